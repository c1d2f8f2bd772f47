//! Network activator: stands in for the checkpointed process on its service
//! ports and brings it back on the first connection.
//!
//! One activator exists per scale-down generation. Each configured service
//! port gets a listener inside the container's netns plus a redirect rule
//! routing the service port to it. The first accepted connection anywhere
//! triggers the restore callback exactly once; accepts racing with it block
//! until the restore finished and are then proxied to the revived process
//! like any later connection.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use crate::netlock::{NetlockError, NetworkLock, PortRedirect};
use crate::netns::{NetnsError, NetnsHandle};

const ACCEPT_POLL_INTERVAL_MS: i32 = 500;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ActivatorError {
    #[error("activator can only be started once")]
    AlreadyStarted,
    #[error("failed to bind activator listener for port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error(transparent)]
    Netns(#[from] NetnsError),
    #[error(transparent)]
    Netlock(#[from] NetlockError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("restore triggered by connection failed: {0}")]
    Restore(String),
    #[error("failed to dial restored process on port {port}: {source}")]
    Dial { port: u16, source: io::Error },
}

/// Triggers the restore. Called exactly once per activator.
pub type OnAccept = Arc<dyn Fn() -> Result<(), ActivatorError> + Send + Sync>;
/// Called after a proxied connection completed, re-arms the idle countdown.
pub type OnIdle = Arc<dyn Fn() + Send + Sync>;

enum GateState {
    Idle,
    Restoring,
    Ready,
    Failed,
}

/// Coalesces concurrent accepts into a single restore.
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn ensure_restored(&self, on_accept: &OnAccept) -> Result<(), ActivatorError> {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                GateState::Ready => return Ok(()),
                GateState::Failed => {
                    return Err(ActivatorError::Restore("previous restore failed".to_string()))
                }
                GateState::Restoring => {
                    state = self.cond.wait(state).unwrap();
                }
                GateState::Idle => {
                    *state = GateState::Restoring;
                    drop(state);

                    let result = on_accept();

                    let mut state = self.state.lock().unwrap();
                    *state = if result.is_ok() {
                        GateState::Ready
                    } else {
                        GateState::Failed
                    };
                    self.cond.notify_all();
                    return result;
                }
            }
        }
    }
}

pub struct Activator {
    ports: Vec<u16>,
    netns: NetnsHandle,
    lock: Arc<dyn NetworkLock>,
    gate: Arc<Gate>,
    stopping: Arc<AtomicBool>,
    started: AtomicBool,
    stopped: AtomicBool,
    bound: Mutex<Vec<(u16, SocketAddr)>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Activator {
    pub fn new(ports: Vec<u16>, netns: NetnsHandle, lock: Arc<dyn NetworkLock>) -> Self {
        Self {
            ports,
            netns,
            lock,
            gate: Arc::new(Gate {
                state: Mutex::new(GateState::Idle),
                cond: Condvar::new(),
            }),
            stopping: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            bound: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listeners inside the netns, installs the redirects and
    /// returns once everything is accepting.
    pub fn start(&self, on_accept: OnAccept, on_idle: OnIdle) -> Result<(), ActivatorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ActivatorError::AlreadyStarted);
        }

        let (ready_tx, ready_rx) = channel();
        for port in self.ports.clone() {
            let netns = self.netns.clone();
            let gate = self.gate.clone();
            let stopping = self.stopping.clone();
            let on_accept = on_accept.clone();
            let on_idle = on_idle.clone();
            let ready_tx = ready_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("activator-{port}"))
                .spawn(move || {
                    let listener = match bind_in_netns(&netns, port) {
                        Ok(listener) => {
                            let addr = listener.local_addr().ok();
                            let _ = ready_tx.send(Ok((port, addr)));
                            listener
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    drop(ready_tx);
                    accept_loop(listener, port, gate, stopping, on_accept, on_idle);
                })?;
            self.threads.lock().unwrap().push(handle);
        }
        drop(ready_tx);

        let mut redirects = Vec::new();
        for _ in &self.ports {
            match ready_rx.recv() {
                Ok(Ok((port, Some(addr)))) => {
                    self.bound.lock().unwrap().push((port, addr));
                    redirects.push(PortRedirect {
                        service_port: port,
                        proxy_port: addr.port(),
                    });
                }
                Ok(Ok((port, None))) => {
                    self.signal_stop();
                    return Err(ActivatorError::Bind {
                        port,
                        source: io::Error::new(io::ErrorKind::Other, "no local addr"),
                    });
                }
                Ok(Err(err)) => {
                    self.signal_stop();
                    return Err(err);
                }
                Err(_) => {
                    self.signal_stop();
                    return Err(ActivatorError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "activator thread died during startup",
                    )));
                }
            }
        }

        if let Err(err) = self.lock.install(&redirects) {
            self.signal_stop();
            return Err(err.into());
        }

        tracing::info!(ports = ?self.ports, netns = ?self.netns.path(), "activator started");
        Ok(())
    }

    /// Tears down listeners and redirect rules, waiting for the accept
    /// threads to finish. Idempotent. Must not be called while holding the
    /// checkpoint/restore mutex of the owning container: accept threads
    /// block on that mutex while restoring.
    pub fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal_stop();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        if let Err(err) = self.lock.remove() {
            tracing::warn!(%err, "failed to remove redirect rules");
        }
        tracing::info!(ports = ?self.ports, "activator stopped");
    }

    /// Like [`Activator::stop`] but without joining the accept threads;
    /// they notice the stop flag and unwind on their own. Used where a join
    /// could wait on a thread that is itself waiting on the caller.
    pub fn stop_detached(&self) {
        if !self.started.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal_stop();
        if let Err(err) = self.lock.remove() {
            tracing::warn!(%err, "failed to remove redirect rules");
        }
    }

    /// Removes the redirect rules after a successful restore so new
    /// connections reach the real process. The listeners only stay open
    /// long enough to drain connections that were already accepted.
    pub fn disable_redirects(&self) -> Result<(), NetlockError> {
        self.lock.remove()
    }

    /// Listener address for a service port. Present while the activator is
    /// started; used by tests to reach the proxy without redirect rules.
    pub fn bound_addr(&self, port: u16) -> Option<SocketAddr> {
        self.bound
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, addr)| *addr)
    }

    fn signal_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

impl Drop for Activator {
    fn drop(&mut self) {
        self.stop_detached();
    }
}

fn bind_in_netns(netns: &NetnsHandle, port: u16) -> Result<TcpListener, ActivatorError> {
    // setns applies to this thread only, which is all we need: the listener
    // fd keeps working from any thread once bound
    netns.enter()?;
    // a kernel-assigned port keeps the service port free for the socket the
    // restore brings back
    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|source| ActivatorError::Bind { port, source })?;
    Ok(listener)
}

fn accept_loop(
    listener: TcpListener,
    port: u16,
    gate: Arc<Gate>,
    stopping: Arc<AtomicBool>,
    on_accept: OnAccept,
    on_idle: OnIdle,
) {
    loop {
        let mut fds = [PollFd::new(&listener, PollFlags::POLLIN)];
        match poll(&mut fds, ACCEPT_POLL_INTERVAL_MS) {
            // connections already accepted by the kernel are still served
            // after a stop request; the loop only ends once the backlog is
            // drained
            Ok(0) => {
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                tracing::error!(port, %err, "poll on activator listener failed");
                return;
            }
        }

        let (client, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                tracing::error!(port, %err, "accept on activator listener failed");
                return;
            }
        };
        tracing::info!(port, %peer, "accepted connection, activating");

        if let Err(err) = gate.ensure_restored(&on_accept) {
            tracing::error!(port, %err, "dropping connection, restore failed");
            continue;
        }

        // this thread is inside the netns, so the dial lands on the
        // restored process's own listener
        let backend = match dial(port) {
            Ok(backend) => backend,
            Err(err) => {
                tracing::error!(port, %err, "dropping connection");
                continue;
            }
        };

        let on_idle = on_idle.clone();
        let proxy_result = thread::Builder::new()
            .name(format!("proxy-{port}"))
            .spawn(move || {
                proxy(client, backend);
                on_idle();
            });
        if let Err(err) = proxy_result {
            tracing::error!(port, %err, "failed to spawn proxy");
        }
    }
}

/// Connects to the restored process, retrying while it re-establishes its
/// listener.
fn dial(port: u16) -> Result<TcpStream, ActivatorError> {
    let deadline = Instant::now() + DIAL_TIMEOUT;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return Ok(stream),
            Err(source) => {
                if Instant::now() >= deadline {
                    return Err(ActivatorError::Dial { port, source });
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Splices bytes between the two sockets until both directions are done.
fn proxy(client: TcpStream, backend: TcpStream) {
    let client_read = match client.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            tracing::error!(%err, "failed to clone client socket");
            return;
        }
    };
    let backend_read = match backend.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            tracing::error!(%err, "failed to clone backend socket");
            return;
        }
    };

    let upstream = thread::spawn(move || {
        let mut reader = client_read;
        let mut writer = backend;
        let _ = io::copy(&mut reader, &mut writer);
        let _ = writer.shutdown(std::net::Shutdown::Write);
    });

    let mut reader = backend_read;
    let mut writer = client;
    let _ = io::copy(&mut reader, &mut writer);
    let _ = writer.shutdown(std::net::Shutdown::Write);

    let _ = upstream.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlock::NoopLock;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    /// Stand-in for the restored workload process.
    fn spawn_backend(port: u16, response: &'static str) -> Arc<AtomicBool> {
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let mut buf = [0u8; 512];
                        let _ = stream.read(&mut buf);
                        let reply = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = stream.write_all(reply.as_bytes());
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });
        stop
    }

    fn http_get(addr: SocketAddr) -> anyhow::Result<String> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")?;
        let mut response = String::new();
        stream.read_to_string(&mut response)?;
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        Ok(body)
    }

    fn free_ports(n: usize) -> Vec<u16> {
        let listeners: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    #[test]
    fn test_parallel_accepts_coalesce_into_one_restore() -> anyhow::Result<()> {
        let ports = free_ports(2);
        let restores = Arc::new(AtomicUsize::new(0));
        let idles = Arc::new(AtomicUsize::new(0));
        let backends: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::new(Mutex::new(Vec::new()));

        let activator = Arc::new(Activator::new(
            ports.clone(),
            NetnsHandle::Current,
            Arc::new(NoopLock::default()),
        ));

        let restores_clone = restores.clone();
        let backend_ports = ports.clone();
        let backends_clone = backends.clone();
        let on_accept: OnAccept = Arc::new(move || {
            restores_clone.fetch_add(1, Ordering::SeqCst);
            // the "restore": the workload's listeners come back
            for port in &backend_ports {
                backends_clone.lock().unwrap().push(spawn_backend(*port, "ok"));
            }
            Ok(())
        });
        let idles_clone = idles.clone();
        let on_idle: OnIdle = Arc::new(move || {
            idles_clone.fetch_add(1, Ordering::SeqCst);
        });

        activator.start(on_accept, on_idle)?;

        let mut clients = Vec::new();
        for _ in 0..6 {
            for port in &ports {
                let addr = activator.bound_addr(*port).unwrap();
                clients.push(thread::spawn(move || http_get(addr).unwrap()));
            }
        }
        for client in clients {
            assert_eq!(client.join().unwrap(), "ok");
        }

        assert_eq!(restores.load(Ordering::SeqCst), 1);
        assert!(idles.load(Ordering::SeqCst) >= 1);

        activator.stop();
        for backend in backends.lock().unwrap().iter() {
            backend.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    #[test]
    fn test_stop_is_idempotent_and_removes_redirects() -> anyhow::Result<()> {
        let ports = free_ports(1);
        let lock = Arc::new(NoopLock::default());
        let activator = Activator::new(ports.clone(), NetnsHandle::Current, lock.clone());

        activator.start(Arc::new(|| Ok(())), Arc::new(|| {}))?;
        assert_eq!(lock.state().installed.len(), 1);
        assert_eq!(lock.state().installed[0].service_port, ports[0]);

        let addr = activator.bound_addr(ports[0]).unwrap();
        activator.stop();
        activator.stop();
        assert_eq!(lock.state().removed, 1);
        // nothing is listening anymore
        assert!(TcpStream::connect(addr).is_err());
        Ok(())
    }

    #[test]
    fn test_start_twice_fails() -> anyhow::Result<()> {
        let ports = free_ports(1);
        let activator = Activator::new(
            ports,
            NetnsHandle::Current,
            Arc::new(NoopLock::default()),
        );
        activator.start(Arc::new(|| Ok(())), Arc::new(|| {}))?;
        assert!(matches!(
            activator.start(Arc::new(|| Ok(())), Arc::new(|| {})),
            Err(ActivatorError::AlreadyStarted)
        ));
        activator.stop();
        Ok(())
    }

    #[test]
    fn test_failed_restore_drops_connection() -> anyhow::Result<()> {
        let ports = free_ports(1);
        let activator = Activator::new(
            ports.clone(),
            NetnsHandle::Current,
            Arc::new(NoopLock::default()),
        );
        activator.start(
            Arc::new(|| Err(ActivatorError::Restore("images corrupt".to_string()))),
            Arc::new(|| {}),
        )?;

        let addr = activator.bound_addr(ports[0]).unwrap();
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n")?;
        let mut buf = Vec::new();
        // connection is accepted and then dropped without a response
        stream.read_to_end(&mut buf)?;
        assert!(buf.is_empty());

        activator.stop();
        Ok(())
    }
}
