//! Traffic redirection inside the container netns. While a container is
//! scaled down, connections to its service ports have to land on the
//! activator's listeners; the rules doing that live in the nat table of the
//! container's network namespace, never on the host.

use std::io::Write;
use std::os::fd::BorrowedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sched::{setns, CloneFlags};

use crate::netns::NetnsHandle;

/// Chain holding the activator redirect rules.
const CHAIN: &str = "ZEROPOD-ACTIVATOR";

/// Permissive filter table applied after a dump. CRIU locks the network
/// during checkpointing with DROP rules in the filter table which would
/// firewall the activator; restoring this neutralizes them.
const PERMISSIVE_FILTER: &str = "*filter
:INPUT ACCEPT [0:0]
:FORWARD ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
COMMIT
";

#[derive(Debug, thiserror::Error)]
pub enum NetlockError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRedirect {
    pub service_port: u16,
    pub proxy_port: u16,
}

pub trait NetworkLock: Send + Sync {
    /// Installs redirect rules for the given port pairs.
    fn install(&self, redirects: &[PortRedirect]) -> Result<(), NetlockError>;
    /// Removes all redirect rules. Idempotent.
    fn remove(&self) -> Result<(), NetlockError>;
    /// Resets the filter table of the netns to a permissive state.
    fn reset_filter(&self) -> Result<(), NetlockError>;
}

/// iptables-driven implementation. Commands are executed in a child process
/// that enters the target netns before exec.
pub struct IptablesLock {
    netns: NetnsHandle,
}

impl IptablesLock {
    pub fn new(netns: NetnsHandle) -> Self {
        Self { netns }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if let Some(fd) = self.netns.raw_fd() {
            // SAFETY: only async-signal-safe calls between fork and exec;
            // the fd stays open in the child because it is inherited.
            unsafe {
                cmd.pre_exec(move || {
                    setns(BorrowedFd::borrow_raw(fd), CloneFlags::CLONE_NEWNET)
                        .map_err(std::io::Error::from)
                });
            }
        }
        cmd
    }

    fn iptables(&self, args: &[&str]) -> Result<(), NetlockError> {
        let mut cmd = self.command("iptables");
        cmd.args(args);
        let rendered = format!("iptables {}", args.join(" "));
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|source| NetlockError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(NetlockError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn iptables_allow_fail(&self, args: &[&str]) {
        if let Err(err) = self.iptables(args) {
            tracing::debug!(%err, "ignoring iptables failure during teardown");
        }
    }
}

impl NetworkLock for IptablesLock {
    fn install(&self, redirects: &[PortRedirect]) -> Result<(), NetlockError> {
        self.iptables(&["-t", "nat", "-N", CHAIN])?;
        for redirect in redirects {
            let service_port = redirect.service_port.to_string();
            let proxy_port = redirect.proxy_port.to_string();
            self.iptables(&[
                "-t",
                "nat",
                "-A",
                CHAIN,
                "-p",
                "tcp",
                "--dport",
                &service_port,
                "-j",
                "REDIRECT",
                "--to-ports",
                &proxy_port,
            ])?;
        }
        // external traffic goes through PREROUTING, traffic originating
        // inside the netns through OUTPUT
        self.iptables(&["-t", "nat", "-A", "PREROUTING", "-j", CHAIN])?;
        self.iptables(&["-t", "nat", "-A", "OUTPUT", "-j", CHAIN])?;
        tracing::debug!(netns = ?self.netns.path(), ?redirects, "installed redirects");
        Ok(())
    }

    fn remove(&self) -> Result<(), NetlockError> {
        self.iptables_allow_fail(&["-t", "nat", "-D", "PREROUTING", "-j", CHAIN]);
        self.iptables_allow_fail(&["-t", "nat", "-D", "OUTPUT", "-j", CHAIN]);
        self.iptables_allow_fail(&["-t", "nat", "-F", CHAIN]);
        self.iptables_allow_fail(&["-t", "nat", "-X", CHAIN]);
        Ok(())
    }

    fn reset_filter(&self) -> Result<(), NetlockError> {
        let mut cmd = self.command("iptables-restore");
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| NetlockError::Spawn {
                command: "iptables-restore".to_string(),
                source,
            })?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(PERMISSIVE_FILTER.as_bytes())
                .map_err(|source| NetlockError::Spawn {
                    command: "iptables-restore".to_string(),
                    source,
                })?;
        }
        let output = child
            .wait_with_output()
            .map_err(|source| NetlockError::Spawn {
                command: "iptables-restore".to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(NetlockError::CommandFailed {
                command: "iptables-restore".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Lock that records calls instead of touching iptables. Used by tests and
/// for host-network containers where rewriting rules would be destructive.
#[derive(Default)]
pub struct NoopLock {
    state: std::sync::Mutex<NoopState>,
}

#[derive(Default, Debug, Clone)]
pub struct NoopState {
    pub installed: Vec<PortRedirect>,
    pub removed: usize,
    pub filter_resets: usize,
}

impl NoopLock {
    pub fn state(&self) -> NoopState {
        self.state.lock().unwrap().clone()
    }
}

impl NetworkLock for NoopLock {
    fn install(&self, redirects: &[PortRedirect]) -> Result<(), NetlockError> {
        self.state.lock().unwrap().installed.extend(redirects);
        Ok(())
    }

    fn remove(&self) -> Result<(), NetlockError> {
        self.state.lock().unwrap().removed += 1;
        Ok(())
    }

    fn reset_filter(&self) -> Result<(), NetlockError> {
        self.state.lock().unwrap().filter_resets += 1;
        Ok(())
    }
}
