use std::sync::Arc;
use std::time::Instant;

use super::container::ManagedContainer;
use super::state::ScaleState;
use crate::error::{Result, ZeropodError};
use crate::events::TaskEvent;
use crate::logio::Repiper;
use crate::metrics;
use crate::process::ProcessHandle;
use crate::runtime::{container_dir, work_dir, CreateOpts};

impl ManagedContainer {
    /// Brings the container back from its checkpoint and returns the new
    /// process. Safe to call concurrently; callers that lose the race
    /// observe the already-restored process.
    pub fn restore(&self) -> Result<Arc<ProcessHandle>> {
        let _guard = self.lock_checkpoint_restore();
        if self.status() == ScaleState::Running {
            // restored by a concurrent exec or connection
            return Ok(self.current_process());
        }
        // a kill that won the mutex race turns this into a plain state
        // error, not a broken checkpoint
        if !self.status().can_restore() {
            return Err(crate::container::StateError::InvalidTransition {
                from: self.status(),
                to: ScaleState::Restoring,
            }
            .into());
        }
        self.restore_locked()
    }

    /// Restore body, requires the checkpoint/restore mutex to be held.
    pub(super) fn restore_locked(&self) -> Result<Arc<ProcessHandle>> {
        self.transition(ScaleState::Restoring)?;
        let before = Instant::now();
        tracing::info!(container_id = %self.id(), "restoring");

        // The checkpoint severed the stdio fifos and nothing upstream will
        // re-pipe them. The tails block until the restored process re-opens
        // its ends, so this runs concurrently with the restore itself.
        let stdio = self.initial_process().stdio().clone();
        match Repiper::spawn(&stdio, self.log_path().map(|p| p.as_path())) {
            Ok(_repiper) => {}
            Err(err) => {
                tracing::warn!(container_id = %self.id(), %err, "failed to re-pipe logs")
            }
        }

        // the wrapper learns about the new process through this closure
        // before any exit event for it can be dispatched
        let handle_started = self.take_pre_restore_handle();

        let checkpoint = if self.config().disable_checkpointing {
            None
        } else {
            Some(container_dir(self.bundle()))
        };
        let opts = CreateOpts {
            id: self.id().to_string(),
            bundle: self.bundle().clone(),
            checkpoint,
            work_path: Some(work_dir(self.bundle())),
            stdio: stdio.clone(),
        };

        let mut new_container = match self.runtime().create(opts) {
            Ok(container) => container,
            Err(err) => return Err(self.restore_failed("create", err.to_string())),
        };

        let pid = match new_container.start() {
            Ok(pid) => pid,
            Err(err) => return Err(self.restore_failed("start", err.to_string())),
        };

        // swap the slot so every delegated operation hits the successor
        {
            let slot = self.container();
            let mut container = slot.lock().unwrap();
            *container = new_container;
        }

        // the runtime only places restored processes into the cgroup once
        // they run, so attach explicitly
        self.attach_cgroup(pid);

        let process = Arc::new(ProcessHandle::new("", pid.as_raw(), stdio));
        self.set_current_process(process.clone());

        self.run_post_restore(process.clone());
        if let Some(handle_started) = handle_started {
            if let Some(this) = self.strong_ref() {
                handle_started(&this, process.clone());
            }
        }

        self.send_event(TaskEvent::Resumed {
            container_id: self.id().to_string(),
        });

        // the process is live again, new connections go to it directly and
        // the activator is unbound once its redirects are gone
        if let Some(activator) = self.activator() {
            match activator.disable_redirects() {
                Ok(()) => self.release_activator(),
                Err(err) => {
                    tracing::warn!(container_id = %self.id(), %err, "failed to disable redirects");
                }
            }
        }

        self.transition(ScaleState::Running)?;
        self.schedule_scale_down();

        let elapsed = before.elapsed();
        let labels = metrics::labels(self.config());
        metrics::RESTORE_DURATION
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
        metrics::RESTORES.with_label_values(&labels).inc();
        tracing::info!(
            container_id = %self.id(),
            pid = pid.as_raw(),
            duration_ms = elapsed.as_millis() as u64,
            "restored"
        );
        Ok(process)
    }

    fn restore_failed(&self, phase: &str, reason: String) -> ZeropodError {
        // partial restore state is untrusted, this container is lost
        let _ = self.transition(ScaleState::Terminating);
        let restore_log = std::fs::read_to_string(work_dir(self.bundle()).join("restore.log"))
            .unwrap_or_else(|_| String::from("<no restore.log>"));
        tracing::error!(
            container_id = %self.id(),
            phase,
            %reason,
            %restore_log,
            "restore failed"
        );
        ZeropodError::Restore {
            reason: format!("{phase} failed during restore: {reason}"),
            restore_log,
        }
    }
}
