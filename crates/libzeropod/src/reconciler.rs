//! Reconciles kernel process exits with the logical container state.
//!
//! All exit events of the shim arrive on one channel. A single consumer
//! looks up which tracked processes live at the exiting pid and decides per
//! pair whether the exit is real, deferred behind pending execs, or the
//! expected disappearance of a scaled-down container that must not surface.
//!
//! Without a pidfd an exit event cannot be attributed unambiguously: pids
//! can be recycled between reception and processing, so every pair tracked
//! at the pid is treated as exited. A container restarted within one
//! scheduling quantum may observe a spurious exit on its successor; the
//! orchestrator recovers from that.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use chrono::{DateTime, Utc};

use crate::container::ScaleState;
use crate::events::TaskEvent;
use crate::process::ProcessHandle;

/// A process exit observed by the shim host's reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: i32,
    pub status: i32,
    pub exited_at: DateTime<Utc>,
}

/// What the reconciler needs to know about a managed container. Lookups are
/// weak: a container deleted while an event is in flight simply stops being
/// managed.
pub trait ReconcileTarget: Send + Sync {
    fn scale_state(&self) -> ScaleState;
    fn pending_execs(&self) -> usize;
    fn initial_process(&self) -> Arc<ProcessHandle>;
    fn current_process(&self) -> Option<Arc<ProcessHandle>>;
}

pub type ExitHandler = Box<dyn Fn(&ExitEvent) + Send + Sync>;

struct Registration {
    container_id: String,
    process: Arc<ProcessHandle>,
}

#[derive(Default)]
struct Inner {
    /// pid -> all (container, process) pairs currently tracked at that pid
    running: HashMap<i32, Vec<Registration>>,
    targets: HashMap<String, Weak<dyn ReconcileTarget>>,
    /// init exits held back until the container's execs are reaped
    deferred: HashMap<String, Vec<(Registration, ExitEvent)>>,
    subscribers: HashMap<u64, Sender<ExitEvent>>,
    next_subscriber: u64,
}

pub struct ExitReconciler {
    inner: Mutex<Inner>,
    events: Sender<TaskEvent>,
    delegate_exit: ExitHandler,
}

enum Verdict {
    /// exit of a tracked process that must surface
    Publish(Registration),
    /// scaled-down container, the pid vanished by design
    Suppress(Registration),
    Defer(Registration),
}

impl ExitReconciler {
    pub fn new(events: Sender<TaskEvent>, delegate_exit: ExitHandler) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events,
            delegate_exit,
        })
    }

    /// Spawns the consumer draining the exit channel.
    pub fn run(
        self: &Arc<Self>,
        rx: Receiver<ExitEvent>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let reconciler = self.clone();
        thread::Builder::new()
            .name("exit-reconciler".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    reconciler.handle_exit(&event);
                }
            })
    }

    pub fn register_target(&self, id: &str, target: Weak<dyn ReconcileTarget>) {
        let mut inner = self.inner.lock().unwrap();
        inner.targets.insert(id.to_string(), target);
    }

    pub fn deregister_target(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.targets.remove(id);
        inner.deferred.remove(id);
        for regs in inner.running.values_mut() {
            regs.retain(|reg| reg.container_id != id);
        }
        inner.running.retain(|_, regs| !regs.is_empty());
    }

    /// Tracks a process at its current pid. Called for the init process on
    /// Start, for execs on their Start, and again after a restore replaced
    /// the pid.
    pub fn register_process(&self, container_id: &str, process: Arc<ProcessHandle>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .running
            .entry(process.pid())
            .or_default()
            .push(Registration {
                container_id: container_id.to_string(),
                process,
            });
    }

    /// Lets a concurrent start operation observe exits that race with the
    /// registration of a freshly forked pid.
    pub fn subscribe(&self) -> (u64, Receiver<ExitEvent>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        let (tx, rx) = channel();
        inner.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    /// Re-examines deferred init exits of a container, called after an exec
    /// has been reaped and its events published.
    pub fn flush_deferred(&self, container_id: &str) {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            let pending = inner
                .targets
                .get(container_id)
                .and_then(Weak::upgrade)
                .map(|t| t.pending_execs())
                .unwrap_or(0);
            if pending > 0 {
                return;
            }
            inner.deferred.remove(container_id)
        };
        for (reg, event) in ready.into_iter().flatten() {
            let target = self.target(&reg.container_id);
            self.finish(Verdict::Publish(reg), &event, target);
        }
    }

    fn target(&self, container_id: &str) -> Option<Arc<dyn ReconcileTarget>> {
        self.inner
            .lock()
            .unwrap()
            .targets
            .get(container_id)
            .and_then(Weak::upgrade)
    }

    pub fn handle_exit(&self, event: &ExitEvent) {
        let mut verdicts = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();

            inner
                .subscribers
                .retain(|_, subscriber| subscriber.send(*event).is_ok());

            let regs = inner.running.remove(&event.pid).unwrap_or_default();
            for reg in regs {
                let target = inner
                    .targets
                    .get(&reg.container_id)
                    .and_then(Weak::upgrade);
                let verdict = match &target {
                    Some(target) if reg.process.is_init() && target.pending_execs() > 0 => {
                        Verdict::Defer(reg)
                    }
                    Some(target) if target.scale_state().suppress_exits() => {
                        Verdict::Suppress(reg)
                    }
                    _ => Verdict::Publish(reg),
                };
                match verdict {
                    Verdict::Defer(reg) => {
                        tracing::debug!(
                            container_id = %reg.container_id,
                            pid = event.pid,
                            "deferring init exit behind pending execs"
                        );
                        inner
                            .deferred
                            .entry(reg.container_id.clone())
                            .or_default()
                            .push((reg, *event));
                    }
                    other => verdicts.push(other),
                }
            }
        }

        if verdicts.is_empty() {
            // not a tracked process, hand it straight to the delegate
            (self.delegate_exit)(event);
            return;
        }

        for verdict in verdicts {
            let container_id = match &verdict {
                Verdict::Publish(reg) | Verdict::Suppress(reg) | Verdict::Defer(reg) => {
                    reg.container_id.clone()
                }
            };
            let target = self.target(&container_id);
            self.finish(verdict, event, target);
        }
    }

    fn finish(
        &self,
        verdict: Verdict,
        event: &ExitEvent,
        target: Option<Arc<dyn ReconcileTarget>>,
    ) {
        match verdict {
            Verdict::Suppress(reg) => {
                tracing::debug!(
                    container_id = %reg.container_id,
                    pid = event.pid,
                    "suppressing exit of scaled down container"
                );
                if let Some(target) = target {
                    let initial = target.initial_process();
                    let is_own = Arc::ptr_eq(&initial, &reg.process)
                        || target
                            .current_process()
                            .map(|current| Arc::ptr_eq(&current, &reg.process))
                            .unwrap_or(false);
                    if is_own {
                        // downstream shutdown logic needs a terminal status
                        // even though the exit is not published
                        initial.set_exited(0);
                    }
                }
            }
            Verdict::Publish(reg) => {
                reg.process.set_exited(event.status);
                let _ = self.events.send(TaskEvent::Exit {
                    container_id: reg.container_id.clone(),
                    exec_id: reg.process.exec_id().to_string(),
                    pid: event.pid,
                    exit_status: event.status,
                    exited_at: event.exited_at,
                });
                (self.delegate_exit)(event);
            }
            Verdict::Defer(_) => unreachable!("deferred exits are stored, not finished"),
        }
    }
}
