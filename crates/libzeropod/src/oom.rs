//! Cgroup OOM watching, one mechanism per cgroup version: on v2 the
//! `memory.events` file is watched for an increasing `oom_kill` counter, on
//! v1 an eventfd is registered with `cgroup.event_control`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use libcgroups::common::{get_cgroup_setup, CgroupSetup, DEFAULT_CGROUP_ROOT};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

use crate::events::TaskEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum OomError {
    #[error("failed to determine cgroup setup: {0}")]
    CgroupSetup(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to watch {path}: {source}")]
    Watch { path: PathBuf, source: nix::Error },
}

pub struct OomWatcher {
    events: Sender<TaskEvent>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl OomWatcher {
    pub fn new(events: Sender<TaskEvent>) -> Self {
        Self {
            events,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Starts watching the container's cgroup for OOM kills.
    pub fn watch(&self, container_id: &str, cgroup_path: &Path) -> Result<(), OomError> {
        let setup =
            get_cgroup_setup().map_err(|err| OomError::CgroupSetup(err.to_string()))?;
        let relative = cgroup_path
            .strip_prefix("/")
            .unwrap_or(cgroup_path)
            .to_path_buf();
        match setup {
            CgroupSetup::Unified => {
                let memory_events = Path::new(DEFAULT_CGROUP_ROOT)
                    .join(relative)
                    .join("memory.events");
                self.watch_v2(container_id, memory_events)
            }
            CgroupSetup::Legacy | CgroupSetup::Hybrid => {
                let memory_cgroup = Path::new(DEFAULT_CGROUP_ROOT).join("memory").join(relative);
                self.watch_v1(container_id, memory_cgroup)
            }
        }
    }

    fn watch_v2(&self, container_id: &str, memory_events: PathBuf) -> Result<(), OomError> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
            .map_err(|err| OomError::Io(err.into()))?;
        inotify
            .add_watch(&memory_events, AddWatchFlags::IN_MODIFY)
            .map_err(|source| OomError::Watch {
                path: memory_events.clone(),
                source,
            })?;

        let events = self.events.clone();
        let stop = self.stop.clone();
        let container_id = container_id.to_string();
        let handle = thread::Builder::new()
            .name(format!("oom-{container_id}"))
            .spawn(move || {
                let mut last_oom_kill = read_oom_kill(&memory_events).unwrap_or(0);
                while !stop.load(Ordering::SeqCst) {
                    match inotify.read_events() {
                        Ok(_) => {
                            let oom_kill = read_oom_kill(&memory_events).unwrap_or(last_oom_kill);
                            if oom_kill > last_oom_kill {
                                tracing::warn!(%container_id, oom_kill, "oom kill detected");
                                let _ = events.send(TaskEvent::Oom {
                                    container_id: container_id.clone(),
                                });
                            }
                            last_oom_kill = oom_kill;
                        }
                        Err(nix::errno::Errno::EAGAIN) => thread::sleep(POLL_INTERVAL),
                        Err(err) => {
                            tracing::debug!(%container_id, %err, "oom watch ended");
                            return;
                        }
                    }
                }
            })?;
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn watch_v1(&self, container_id: &str, memory_cgroup: PathBuf) -> Result<(), OomError> {
        use std::os::unix::io::AsRawFd;

        let oom_control = std::fs::File::open(memory_cgroup.join("memory.oom_control"))?;
        let efd =
            unsafe { nix::libc::eventfd(0, nix::libc::EFD_CLOEXEC | nix::libc::EFD_NONBLOCK) };
        if efd < 0 {
            return Err(OomError::Watch {
                path: memory_cgroup.clone(),
                source: nix::errno::Errno::last(),
            });
        }
        std::fs::write(
            memory_cgroup.join("cgroup.event_control"),
            format!("{efd} {}", oom_control.as_raw_fd()),
        )?;

        let events = self.events.clone();
        let stop = self.stop.clone();
        let container_id = container_id.to_string();
        let handle = thread::Builder::new()
            .name(format!("oom-{container_id}"))
            .spawn(move || {
                // keeps the control fd registered for the watch lifetime
                let _oom_control = oom_control;
                let mut buf = [0u8; 8];
                while !stop.load(Ordering::SeqCst) {
                    match nix::unistd::read(efd, &mut buf) {
                        Ok(_) => {
                            tracing::warn!(%container_id, "oom event");
                            let _ = events.send(TaskEvent::Oom {
                                container_id: container_id.clone(),
                            });
                        }
                        Err(nix::errno::Errno::EAGAIN) => thread::sleep(POLL_INTERVAL),
                        Err(err) => {
                            tracing::debug!(%container_id, %err, "oom watch ended");
                            break;
                        }
                    }
                }
                let _ = nix::unistd::close(efd);
            })?;
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }
}

impl Drop for OomWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn read_oom_kill(memory_events: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(memory_events).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|count| count.trim().parse().ok())
}
