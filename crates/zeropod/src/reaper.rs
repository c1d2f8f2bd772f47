//! Child process reaper feeding the exit channel. In a full shim setup the
//! host's reaper does this; the standalone runner has to reap the runtime's
//! detached children itself.

use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use libzeropod::reconciler::ExitEvent;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub fn spawn(exits: Sender<ExitEvent>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    send(&exits, pid, code);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    send(&exits, pid, 128 + signal as i32);
                }
                Ok(WaitStatus::StillAlive) => thread::sleep(Duration::from_millis(100)),
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => thread::sleep(Duration::from_millis(500)),
                Err(err) => {
                    tracing::error!(%err, "reaper failed");
                    return;
                }
            }
        })
}

fn send(exits: &Sender<ExitEvent>, pid: Pid, status: i32) {
    tracing::debug!(pid = pid.as_raw(), status, "reaped child");
    if exits
        .send(ExitEvent {
            pid: pid.as_raw(),
            status,
            exited_at: chrono::Utc::now(),
        })
        .is_err()
    {
        tracing::debug!("exit channel closed");
    }
}
