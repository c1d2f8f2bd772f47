//! In-memory runtime used by tests. Containers get fake pids and their
//! "process" is a set of tiny in-process HTTP listeners, which is enough to
//! drive the full scale-down and activation cycle without privileges or an
//! actual runtime binary.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::{CheckpointOpts, CreateOpts, Runtime, RuntimeContainer, RuntimeError};
use crate::reconciler::ExitEvent;

const IMAGE_MARKER: &str = "inventory.img";

#[derive(Clone, Default)]
pub struct TestRuntime {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_pid: AtomicI32,
    restores: AtomicUsize,
    checkpoints: AtomicUsize,
    fail_checkpoint: AtomicBool,
    servers: Mutex<HashMap<String, ServerSpec>>,
    exit_tx: Mutex<Option<Sender<ExitEvent>>>,
}

#[derive(Clone)]
struct ServerSpec {
    ports: Vec<u16>,
    response: String,
}

impl TestRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        runtime.inner.next_pid.store(53000, Ordering::SeqCst);
        runtime
    }

    /// Registers the in-process listeners the container with the given id
    /// runs while "started".
    pub fn serve(&self, id: &str, ports: &[u16], response: &str) {
        self.inner.servers.lock().unwrap().insert(
            id.to_string(),
            ServerSpec {
                ports: ports.to_vec(),
                response: response.to_string(),
            },
        );
    }

    /// Wires process exits to the given channel, the way the shim host's
    /// reaper would.
    pub fn set_exit_sender(&self, tx: Sender<ExitEvent>) {
        *self.inner.exit_tx.lock().unwrap() = Some(tx);
    }

    pub fn fail_next_checkpoint(&self, fail: bool) {
        self.inner.fail_checkpoint.store(fail, Ordering::SeqCst);
    }

    pub fn restores(&self) -> usize {
        self.inner.restores.load(Ordering::SeqCst)
    }

    pub fn checkpoints(&self) -> usize {
        self.inner.checkpoints.load(Ordering::SeqCst)
    }
}

impl Runtime for TestRuntime {
    fn create(&self, opts: CreateOpts) -> Result<Box<dyn RuntimeContainer>, RuntimeError> {
        Ok(Box::new(TestContainer {
            inner: self.inner.clone(),
            opts,
            pid: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
        }))
    }
}

pub struct TestContainer {
    inner: Arc<Inner>,
    opts: CreateOpts,
    pid: Mutex<Option<Pid>>,
    servers: Mutex<Vec<TestServer>>,
}

impl TestContainer {
    fn stop_servers(&self, exit_status: i32) {
        for server in self.servers.lock().unwrap().drain(..) {
            server.stop();
        }
        if let Some(pid) = self.pid.lock().unwrap().take() {
            if let Some(tx) = self.inner.exit_tx.lock().unwrap().as_ref() {
                let _ = tx.send(ExitEvent {
                    pid: pid.as_raw(),
                    status: exit_status,
                    exited_at: Utc::now(),
                });
            }
        }
    }
}

impl RuntimeContainer for TestContainer {
    fn id(&self) -> &str {
        &self.opts.id
    }

    fn bundle(&self) -> &Path {
        &self.opts.bundle
    }

    fn pid(&self) -> Option<Pid> {
        *self.pid.lock().unwrap()
    }

    fn start(&mut self) -> Result<Pid, RuntimeError> {
        if let Some(checkpoint) = &self.opts.checkpoint {
            if !checkpoint.join(IMAGE_MARKER).exists() {
                if let Some(work_path) = &self.opts.work_path {
                    let _ = std::fs::create_dir_all(work_path);
                    let _ = std::fs::write(
                        work_path.join("restore.log"),
                        "Error (criu/cr-restore.c): image inventory not found\n",
                    );
                }
                return Err(RuntimeError::RestoreFailed {
                    reason: format!("checkpoint images missing in {}", checkpoint.display()),
                });
            }
            self.inner.restores.fetch_add(1, Ordering::SeqCst);
        }

        let spec = self
            .inner
            .servers
            .lock()
            .unwrap()
            .get(&self.opts.id)
            .cloned();
        if let Some(spec) = spec {
            let mut servers = self.servers.lock().unwrap();
            for port in &spec.ports {
                servers.push(TestServer::spawn(*port, &spec.response)?);
            }
        }

        let pid = Pid::from_raw(self.inner.next_pid.fetch_add(1, Ordering::SeqCst));
        *self.pid.lock().unwrap() = Some(pid);
        Ok(pid)
    }

    fn kill(&self, signal: Signal, _all: bool) -> Result<(), RuntimeError> {
        self.stop_servers(128 + signal as i32);
        Ok(())
    }

    fn checkpoint(&mut self, opts: &CheckpointOpts) -> Result<(), RuntimeError> {
        if self.inner.fail_checkpoint.swap(false, Ordering::SeqCst) {
            std::fs::create_dir_all(&opts.work_path)?;
            std::fs::write(
                opts.work_path.join("dump.log"),
                "Error (criu/namespaces.c): unsupported namespace\n",
            )?;
            return Err(RuntimeError::CheckpointFailed {
                reason: "criu dump failed".to_string(),
            });
        }

        std::fs::create_dir_all(&opts.image_path)?;
        std::fs::write(opts.image_path.join(IMAGE_MARKER), b"test image")?;
        self.inner.checkpoints.fetch_add(1, Ordering::SeqCst);

        if opts.exit {
            self.stop_servers(0);
        }
        Ok(())
    }

    fn delete(&mut self, _force: bool) -> Result<(), RuntimeError> {
        self.stop_servers(137);
        Ok(())
    }
}

impl Drop for TestContainer {
    fn drop(&mut self) {
        for server in self.servers.lock().unwrap().drain(..) {
            server.stop();
        }
    }
}

/// Stand-in for the workload process: accepts connections on one port and
/// answers every request with a fixed HTTP response.
struct TestServer {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn spawn(port: u16, response: &str) -> Result<Self, RuntimeError> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let body = response.to_string();
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("test-server-{port}"))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            let _ = stream.set_nonblocking(false);
                            let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
                            let mut buf = [0u8; 1024];
                            let _ = stream.read(&mut buf);
                            let reply = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = stream.write_all(reply.as_bytes());
                            let _ = stream.flush();
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
