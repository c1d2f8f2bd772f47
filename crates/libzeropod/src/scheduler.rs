//! Per-container scale-down countdown.
//!
//! A single background thread per timer waits on a condvar for the armed
//! deadline. Re-arming moves the deadline, the most recent one wins, and a
//! fire races never happen because the deadline is cleared under the lock
//! before the callback runs.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

pub struct ScaleDownTimer {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ScaleDownTimer {
    /// Spawns the timer thread. `on_fire` runs on that thread every time an
    /// armed deadline elapses without being cancelled or moved.
    pub fn spawn<F>(name: &str, on_fire: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(format!("scaledown-{name}"))
            .spawn(move || {
                let mut state = thread_shared.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    match state.deadline {
                        None => {
                            state = thread_shared.cond.wait(state).unwrap();
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now < deadline {
                                let (guard, _) = thread_shared
                                    .cond
                                    .wait_timeout(state, deadline - now)
                                    .unwrap();
                                state = guard;
                                continue;
                            }
                            state.deadline = None;
                            drop(state);
                            on_fire();
                            state = thread_shared.state.lock().unwrap();
                        }
                    }
                }
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Arms (or re-arms) the countdown. Calling this twice is equivalent to
    /// a single call with the later deadline.
    pub fn schedule(&self, after: Duration) {
        let mut state = self.shared.state.lock().unwrap();
        state.deadline = Some(Instant::now() + after);
        self.shared.cond.notify_one();
    }

    /// Cancels a pending countdown. Idempotent; a countdown that already
    /// fired is unaffected.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.deadline = None;
        self.shared.cond.notify_one();
    }

    pub fn scheduled(&self) -> bool {
        self.shared.state.lock().unwrap().deadline.is_some()
    }
}

impl Drop for ScaleDownTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            // the fire callback can hold the last strong reference to its
            // owner, in which case this drop runs on the timer thread
            // itself; joining would self-deadlock, the shutdown flag
            // already ends the loop
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}
