//! Runtime implementation driving an OCI runtime binary (runc or a
//! compatible runtime) through its command line interface.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio as ProcessStdio};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use procfs::process::{ProcState, Process};

use super::{CheckpointOpts, CreateOpts, Runtime, RuntimeContainer, RuntimeError};

const DEFAULT_COMMAND: &str = "runc";
const PID_FILE: &str = "init.pid";

#[derive(Debug, Clone)]
pub struct RuncRuntime {
    command: PathBuf,
    /// Value for the global --root flag, the runtime state directory.
    root: Option<PathBuf>,
}

impl Default for RuncRuntime {
    fn default() -> Self {
        Self {
            command: PathBuf::from(DEFAULT_COMMAND),
            root: None,
        }
    }
}

impl RuncRuntime {
    pub fn new(command: impl Into<PathBuf>, root: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            root,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd
    }
}

impl Runtime for RuncRuntime {
    fn create(&self, opts: CreateOpts) -> Result<Box<dyn RuntimeContainer>, RuntimeError> {
        Ok(Box::new(RuncContainer {
            runtime: self.clone(),
            pid_file: opts.bundle.join(PID_FILE),
            opts,
            pid: None,
        }))
    }
}

pub struct RuncContainer {
    runtime: RuncRuntime,
    opts: CreateOpts,
    pid_file: PathBuf,
    pid: Option<Pid>,
}

impl RuncContainer {
    fn run(&self, mut cmd: Command) -> Result<(), RuntimeError> {
        let rendered = format!("{:?}", cmd);
        tracing::debug!(command = %rendered, "invoking runtime");
        let output = cmd
            .stdin(ProcessStdio::null())
            .stdout(ProcessStdio::piped())
            .stderr(ProcessStdio::piped())
            .output()?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn read_pid_file(&self) -> Result<Pid, RuntimeError> {
        let raw = std::fs::read_to_string(&self.pid_file)?;
        let pid = raw.trim().parse::<i32>().map_err(|_| RuntimeError::NoPid {
            id: self.opts.id.clone(),
        })?;
        Ok(Pid::from_raw(pid))
    }

    /// Opens the stdio paths of the task so the runtime (and through it the
    /// container process) inherits them.
    fn stdio_files(&self) -> Result<(ProcessStdio, ProcessStdio, ProcessStdio), RuntimeError> {
        let stdin = match self.opts.stdio.stdin.as_str() {
            "" => ProcessStdio::null(),
            path => File::open(path)?.into(),
        };
        let open_out = |path: &str| -> Result<ProcessStdio, RuntimeError> {
            if path.is_empty() {
                return Ok(ProcessStdio::null());
            }
            Ok(OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .into())
        };
        Ok((
            stdin,
            open_out(&self.opts.stdio.stdout)?,
            open_out(&self.opts.stdio.stderr)?,
        ))
    }

    fn restore(&mut self) -> Result<Pid, RuntimeError> {
        // checkpoint presence is checked by start()
        let checkpoint = self.opts.checkpoint.clone().ok_or_else(|| {
            RuntimeError::RestoreFailed {
                reason: "no checkpoint directory configured".to_string(),
            }
        })?;
        let mut cmd = self.runtime.command();
        cmd.arg("restore")
            .arg("--detach")
            .arg("--image-path")
            .arg(&checkpoint)
            .arg("--pid-file")
            .arg(&self.pid_file)
            .arg("--bundle")
            .arg(&self.opts.bundle);
        if let Some(work_path) = &self.opts.work_path {
            cmd.arg("--work-path").arg(work_path);
        }
        let (stdin, stdout, stderr) = self.stdio_files()?;
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);

        let rendered = format!("{:?}", cmd);
        tracing::debug!(command = %rendered, "restoring container");
        let status = cmd.status()?;
        if !status.success() {
            return Err(RuntimeError::RestoreFailed {
                reason: format!("{rendered} exited with {status}"),
            });
        }
        self.read_pid_file()
    }
}

impl RuntimeContainer for RuncContainer {
    fn id(&self) -> &str {
        &self.opts.id
    }

    fn bundle(&self) -> &Path {
        &self.opts.bundle
    }

    fn pid(&self) -> Option<Pid> {
        let pid = self.pid?;
        // the stored pid is stale once the process is gone, e.g. after a
        // checkpoint with exit or a kill
        match Process::new(pid.as_raw()) {
            Ok(proc) => match proc.stat().and_then(|stat| stat.state()) {
                Ok(ProcState::Zombie) | Ok(ProcState::Dead) | Err(_) => None,
                Ok(_) => Some(pid),
            },
            Err(_) => None,
        }
    }

    fn start(&mut self) -> Result<Pid, RuntimeError> {
        let pid = if self.opts.checkpoint.is_some() {
            self.restore()?
        } else {
            let mut create = self.runtime.command();
            create
                .arg("create")
                .arg("--bundle")
                .arg(&self.opts.bundle)
                .arg("--pid-file")
                .arg(&self.pid_file)
                .arg(&self.opts.id);
            let (stdin, stdout, stderr) = self.stdio_files()?;
            create.stdin(stdin).stdout(stdout).stderr(stderr);
            let rendered = format!("{:?}", create);
            let status = create.status()?;
            if !status.success() {
                return Err(RuntimeError::CommandFailed {
                    command: rendered,
                    stderr: format!("exited with {status}"),
                });
            }

            let mut start = self.runtime.command();
            start.arg("start").arg(&self.opts.id);
            self.run(start)?;
            self.read_pid_file()?
        };

        self.pid = Some(pid);
        Ok(pid)
    }

    fn kill(&self, signal: Signal, all: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime.command();
        cmd.arg("kill");
        if all {
            cmd.arg("--all");
        }
        cmd.arg(&self.opts.id).arg((signal as i32).to_string());
        self.run(cmd)
    }

    fn checkpoint(&mut self, opts: &CheckpointOpts) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime.command();
        cmd.arg("checkpoint")
            .arg("--image-path")
            .arg(&opts.image_path)
            .arg("--work-path")
            .arg(&opts.work_path);
        if !opts.exit {
            cmd.arg("--leave-running");
        }
        if opts.tcp_established {
            cmd.arg("--tcp-established");
        }
        if opts.ext_unix_sk {
            cmd.arg("--ext-unix-sk");
        }
        if opts.allow_terminal {
            cmd.arg("--shell-job");
        }
        if opts.file_locks {
            cmd.arg("--file-locks");
        }
        if opts.pre_dump {
            // a pre-dump pass reduces the downtime of the final dump
            let parent = opts.image_path.with_file_name("pre-dump");
            let mut pre = self.runtime.command();
            pre.arg("checkpoint")
                .arg("--pre-dump")
                .arg("--image-path")
                .arg(&parent)
                .arg("--work-path")
                .arg(&opts.work_path)
                .arg(&self.opts.id);
            self.run(pre)
                .map_err(|err| RuntimeError::CheckpointFailed {
                    reason: format!("pre-dump: {err}"),
                })?;
            cmd.arg("--parent-path").arg(&parent);
        }
        for ns in &opts.empty_namespaces {
            cmd.arg("--empty-ns").arg(ns);
        }
        cmd.arg(&self.opts.id);
        self.run(cmd).map_err(|err| RuntimeError::CheckpointFailed {
            reason: err.to_string(),
        })?;

        if opts.exit {
            self.pid = None;
        }
        Ok(())
    }

    fn delete(&mut self, force: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime.command();
        cmd.arg("delete");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(&self.opts.id);
        self.run(cmd)?;
        self.pid = None;
        Ok(())
    }
}
