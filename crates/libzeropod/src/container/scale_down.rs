use std::sync::Arc;
use std::time::Instant;

use nix::sys::signal::Signal;

use super::container::ManagedContainer;
use super::state::ScaleState;
use crate::activator::{Activator, OnAccept, OnIdle};
use crate::error::{Result, ZeropodError};
use crate::events::TaskEvent;
use crate::metrics;
use crate::runtime::{container_dir, work_dir, CheckpointOpts};

impl ManagedContainer {
    /// Checkpoints the container and replaces it with the activator.
    ///
    /// On checkpoint failure the container goes back to `Running` and the
    /// countdown is re-armed; nothing is propagated to the orchestrator. A
    /// failure after the dump already let the process exit is recovered by
    /// restoring on the spot.
    pub fn scale_down(&self) -> Result<()> {
        let _guard = self.lock_checkpoint_restore();
        if !self.status().can_scale_down() || self.pending_execs() > 0 {
            // lost the race against an exec or a kill
            return Ok(());
        }
        self.transition(ScaleState::ScalingDown)?;
        let before = Instant::now();

        if let Err(err) = self.checkpoint() {
            tracing::error!(container_id = %self.id(), %err, "checkpoint failed");
            self.transition(ScaleState::Running)?;
            self.schedule_scale_down();
            return Err(err);
        }

        self.send_event(TaskEvent::Checkpointed {
            container_id: self.id().to_string(),
        });

        // CRIU locked the network with DROP rules during the dump; without
        // resetting the filter table the activator would never see a packet
        if let Err(err) = self.network_lock().reset_filter() {
            tracing::warn!(container_id = %self.id(), %err, "failed to reset filter table");
        }

        if let Err(err) = self.start_activator() {
            tracing::error!(
                container_id = %self.id(),
                %err,
                "activator failed to start, restoring container"
            );
            // the process is already gone, the only way back to Running is
            // through the checkpoint we just took
            self.transition(ScaleState::ScaledDown)?;
            self.restore_locked().map_err(|restore_err| {
                self.invoke_fatal(&format!("error restoring container: {restore_err}"));
                restore_err
            })?;
            return Err(err);
        }

        self.transition(ScaleState::ScaledDown)?;

        let elapsed = before.elapsed();
        let labels = metrics::labels(self.config());
        metrics::CHECKPOINT_DURATION
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
        metrics::CHECKPOINTS.with_label_values(&labels).inc();
        tracing::info!(
            container_id = %self.id(),
            duration_ms = elapsed.as_millis() as u64,
            "scaled down"
        );
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        let image_path = container_dir(self.bundle());
        let work_path = work_dir(self.bundle());
        if image_path.exists() {
            std::fs::remove_dir_all(&image_path)?;
        }
        std::fs::create_dir_all(&image_path)?;
        std::fs::create_dir_all(&work_path)?;

        if self.config().disable_checkpointing {
            // debug mode: no images are written, scale-down is just a kill
            // and restore becomes a fresh create
            tracing::info!(container_id = %self.id(), "checkpointing disabled, killing process");
            let slot = self.container();
            let container = slot.lock().unwrap();
            container.kill(Signal::SIGKILL, true)?;
            return Ok(());
        }

        let opts = CheckpointOpts {
            image_path,
            work_path: work_path.clone(),
            exit: true,
            tcp_established: true,
            ext_unix_sk: true,
            allow_terminal: false,
            file_locks: false,
            pre_dump: self.config().pre_dump,
            empty_namespaces: Vec::new(),
        };

        let slot = self.container();
        let mut container = slot.lock().unwrap();
        container.checkpoint(&opts).map_err(|err| {
            let dump_log = std::fs::read_to_string(work_path.join("dump.log"))
                .unwrap_or_else(|_| String::from("<no dump.log>"));
            ZeropodError::Checkpoint {
                reason: err.to_string(),
                dump_log,
            }
        })
    }

    fn start_activator(&self) -> Result<()> {
        let activator = Arc::new(Activator::new(
            self.config().ports.clone(),
            self.netns().clone(),
            self.network_lock(),
        ));

        let weak = self.weak_ref();
        let on_accept: OnAccept = Arc::new(move || {
            let Some(container) = weak.upgrade() else {
                return Err(crate::activator::ActivatorError::Restore(
                    "container is gone".to_string(),
                ));
            };
            container.restore().map(|_| ()).map_err(|err| {
                if !matches!(err, ZeropodError::State(_)) {
                    // the process is gone and the images are untrusted,
                    // the host has to recreate the task from scratch
                    container.invoke_fatal(&format!("error restoring container: {err}"));
                }
                crate::activator::ActivatorError::Restore(err.to_string())
            })
        });

        let weak = self.weak_ref();
        let on_idle: OnIdle = Arc::new(move || {
            if let Some(container) = weak.upgrade() {
                container.schedule_scale_down();
            }
        });

        activator.start(on_accept, on_idle)?;
        self.set_activator(activator);
        Ok(())
    }
}
