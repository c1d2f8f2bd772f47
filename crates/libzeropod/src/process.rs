//! Process bookkeeping shared between the lifecycle wrapper and the exit
//! reconciler. A [`ProcessHandle`] tracks a process the shim host knows
//! about: the init process of a container or one of its execs. The handle
//! outlives the kernel process, which is what lets a scaled-down container
//! keep a consistent external view while no PID exists.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stdio paths of a process as handed over by the shim host. These are
/// usually fifos created by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: i32,
    pub exited_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ProcessHandle {
    // empty for the init process, the exec id otherwise
    exec_id: String,
    pid: AtomicI32,
    stdio: Stdio,
    exited: Mutex<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn new(exec_id: impl Into<String>, pid: i32, stdio: Stdio) -> Self {
        Self {
            exec_id: exec_id.into(),
            pid: AtomicI32::new(pid),
            stdio,
            exited: Mutex::new(None),
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn is_init(&self) -> bool {
        self.exec_id.is_empty()
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Updates the pid after a restore created a new kernel process for the
    /// same logical container process.
    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn stdio(&self) -> &Stdio {
        &self.stdio
    }

    /// Records the exit of this process. The first recorded exit wins, a
    /// second call is a no-op so a synthesized exit cannot be overwritten by
    /// a late kernel event and vice versa.
    pub fn set_exited(&self, status: i32) {
        let mut exited = self.exited.lock().unwrap();
        if exited.is_none() {
            *exited = Some(ProcessExit {
                status,
                exited_at: Utc::now(),
            });
        }
    }

    pub fn exited(&self) -> Option<ProcessExit> {
        *self.exited.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_exit_wins() {
        let p = ProcessHandle::new("", 42, Stdio::default());
        assert!(p.exited().is_none());
        p.set_exited(0);
        p.set_exited(137);
        assert_eq!(p.exited().unwrap().status, 0);
    }

    #[test]
    fn test_init_detection() {
        assert!(ProcessHandle::new("", 1, Stdio::default()).is_init());
        assert!(!ProcessHandle::new("shell", 1, Stdio::default()).is_init());
    }
}
