//! Standalone runner: wires the full wrapper/engine/reconciler stack around
//! the command-line runtime and drives a single bundle through it. Useful
//! for trying out scale-down behavior without a full orchestrator.

use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use libzeropod::events::{EventForwarder, EventPublisher, TaskEvent};
use libzeropod::oom::OomWatcher;
use libzeropod::reconciler::{ExitEvent, ExitReconciler};
use libzeropod::runtime::runc::RuncRuntime;
use libzeropod::task::api::{CreateRequest, DeleteRequest, StartRequest, WaitRequest};
use libzeropod::task::{LocalTask, TaskDelegate, TaskService, ZeropodTask};

#[derive(Parser, Debug)]
pub struct Run {
    /// container id
    pub id: String,
    /// path to the OCI bundle
    #[arg(long, short)]
    pub bundle: PathBuf,
    /// path to the OCI runtime binary
    #[arg(long, default_value = "runc")]
    pub runtime: PathBuf,
    /// root directory for runtime state
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Publisher that logs events; the standalone runner has no shim host to
/// deliver them to.
struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: TaskEvent) {
        tracing::info!(?event, "task event");
    }
}

pub fn run(args: Run) -> Result<()> {
    let runtime = Arc::new(RuncRuntime::new(args.runtime, args.root));

    let forwarder = EventForwarder::spawn(Arc::new(LogPublisher))
        .context("failed to spawn event forwarder")?;
    let (exit_tx, exit_rx) = channel();

    let delegate = Arc::new(LocalTask::new(runtime.clone(), forwarder.sender()));
    let delegate_exit = {
        let delegate = delegate.clone();
        Box::new(move |event: &ExitEvent| delegate.handle_process_exit(event))
    };
    let reconciler = ExitReconciler::new(forwarder.sender(), delegate_exit);
    let _reconciler_thread = reconciler
        .run(exit_rx)
        .context("failed to spawn exit reconciler")?;
    let _reaper_thread = crate::reaper::spawn(exit_tx).context("failed to spawn reaper")?;

    let oom = Arc::new(OomWatcher::new(forwarder.sender()));
    let task = ZeropodTask::new(
        delegate,
        runtime,
        reconciler,
        forwarder.sender(),
    )
    .with_oom_watcher(oom);

    task.create(CreateRequest {
        id: args.id.clone(),
        bundle: args.bundle.clone(),
        stdio: Default::default(),
    })
    .context("create failed")?;
    let started = task
        .start(StartRequest {
            id: args.id.clone(),
            exec_id: String::new(),
        })
        .context("start failed")?;
    tracing::info!(id = %args.id, pid = started.pid, "container running");

    let exit = task
        .wait(WaitRequest {
            id: args.id.clone(),
            exec_id: String::new(),
        })
        .context("wait failed")?;
    tracing::info!(id = %args.id, status = exit.exit_status, "container exited");

    task.delete(DeleteRequest {
        id: args.id,
        exec_id: String::new(),
    })
    .context("delete failed")?;
    Ok(())
}
