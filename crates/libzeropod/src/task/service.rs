//! The lifecycle wrapper: a transparent [`TaskService`] over a delegate
//! that adds the scale-down state machine to elected containers.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;

use super::api::{
    CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse, CreateRequest,
    CreateResponse, DeleteRequest, DeleteResponse, ExecRequest, KillRequest, PauseRequest,
    ResumeRequest, ShutdownRequest, StartRequest, StartResponse, StateRequest, StateResponse,
    StatsRequest, StatsResponse, TaskDelegate, TaskError, TaskService, UpdateRequest, WaitRequest,
    WaitResponse,
};
use crate::config::ZeropodConfig;
use crate::container::{ManagedContainer, ManagedContainerOpts, ScaleState};
use crate::events::TaskEvent;
use crate::netlock::{IptablesLock, NetworkLock, NoopLock};
use crate::netns::NetnsHandle;
use crate::oom::OomWatcher;
use crate::process::{ProcessHandle, Stdio};
use crate::reconciler::{ExitReconciler, ReconcileTarget};
use crate::runtime::Runtime;

/// Builds the redirect controller for a container's netns. Swapped out in
/// tests and for host-network containers, where touching iptables is off
/// the table.
pub type LockFactory = Box<dyn Fn(&NetnsHandle) -> Arc<dyn NetworkLock> + Send + Sync>;

/// Invoked when the shim cannot continue, e.g. after a failed restore. The
/// default terminates the process so the host recreates the task from
/// scratch.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ZeropodTask<T> {
    delegate: Arc<T>,
    runtime: Arc<dyn Runtime>,
    reconciler: Arc<ExitReconciler>,
    events: Sender<TaskEvent>,
    containers: Mutex<HashMap<String, Arc<ManagedContainer>>>,
    lock_factory: LockFactory,
    fatal: FatalHandler,
    oom: Option<Arc<OomWatcher>>,
}

impl<T: TaskDelegate> ZeropodTask<T> {
    pub fn new(
        delegate: Arc<T>,
        runtime: Arc<dyn Runtime>,
        reconciler: Arc<ExitReconciler>,
        events: Sender<TaskEvent>,
    ) -> Self {
        Self {
            delegate,
            runtime,
            reconciler,
            events,
            containers: Mutex::new(HashMap::new()),
            lock_factory: Box::new(|netns| match netns {
                // without a dedicated netns there is nothing we could
                // safely redirect
                NetnsHandle::Current => Arc::new(NoopLock::default()),
                netns => Arc::new(IptablesLock::new(netns.clone())),
            }),
            fatal: Arc::new(|message| {
                tracing::error!(message, "unrecoverable, exiting shim");
                std::process::exit(1);
            }),
            oom: None,
        }
    }

    pub fn with_lock_factory(mut self, factory: LockFactory) -> Self {
        self.lock_factory = factory;
        self
    }

    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn with_oom_watcher(mut self, oom: Arc<OomWatcher>) -> Self {
        self.oom = Some(oom);
        self
    }

    pub fn managed(&self, id: &str) -> Option<Arc<ManagedContainer>> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    /// Elects a freshly started container and sets up its scale-down
    /// machinery.
    fn manage(&self, id: &str) -> Result<(), TaskError> {
        let delegated = self.delegate.container(id)?;

        let spec = Spec::load(delegated.bundle.join("config.json"))
            .map_err(|err| TaskError::Internal(format!("failed to load spec: {err}")))?;
        let cfg = ZeropodConfig::from_spec(&spec)?;
        if cfg.is_sandbox() || !cfg.is_zeropod_container() {
            tracing::debug!(container_id = %id, "container not elected for scale-down");
            return Ok(());
        }

        let netns = NetnsHandle::from_spec(&spec)
            .map_err(|err| TaskError::Internal(format!("failed to open netns: {err}")))?;
        let lock = (self.lock_factory)(&netns);

        let container = ManagedContainer::new(ManagedContainerOpts {
            id: id.to_string(),
            bundle: delegated.bundle.clone(),
            cfg,
            runtime: self.runtime.clone(),
            netns,
            lock,
            events: self.events.clone(),
            container: delegated.container.clone(),
            init: delegated.init.clone(),
            cgroup_path: delegated.cgroup_path.clone(),
        })
        .map_err(|err| TaskError::Internal(format!("failed to set up container: {err}")))?;

        // Pre-restore: capture a closure that tracks the restored pid with
        // the reconciler before any exit for it can be dispatched. The
        // subscription catches exits racing with the registration.
        let reconciler = self.reconciler.clone();
        let events = self.events.clone();
        container.register_pre_restore(Box::new(move || {
            let reconciler = reconciler.clone();
            let events = events.clone();
            let (token, exits) = reconciler.subscribe();
            Box::new(move |container, process| {
                reconciler.register_process(container.id(), process.clone());
                let _ = events.send(TaskEvent::Start {
                    container_id: container.id().to_string(),
                    pid: process.pid(),
                });
                while let Ok(event) = exits.try_recv() {
                    if event.pid == process.pid() {
                        process.set_exited(event.status);
                        let _ = events.send(TaskEvent::Exit {
                            container_id: container.id().to_string(),
                            exec_id: String::new(),
                            pid: event.pid,
                            exit_status: event.status,
                            exited_at: event.exited_at,
                        });
                    }
                }
                reconciler.unsubscribe(token);
            })
        }));

        // Post-restore: point the delegate's init process at the restored
        // pid so its own state and wait paths follow the successor.
        let delegate_init = delegated.init.clone();
        container.register_post_restore(Box::new(move |_, process| {
            delegate_init.set_pid(process.pid());
        }));

        // a failed restore is unrecoverable, apply the wrapper's policy
        let fatal = self.fatal.clone();
        container.register_fatal_hook(Box::new(move |message| fatal(message)));

        self.reconciler
            .register_target(id, Arc::downgrade(&container) as std::sync::Weak<dyn ReconcileTarget>);
        self.reconciler.register_process(id, delegated.init);

        if let (Some(oom), Some(cgroup_path)) = (&self.oom, &delegated.cgroup_path) {
            if let Err(err) = oom.watch(id, cgroup_path) {
                tracing::warn!(container_id = %id, %err, "failed to watch cgroup for ooms");
            }
        }

        container.schedule_scale_down();
        tracing::info!(
            container_id = %id,
            ports = ?container.config().ports,
            scaledown = ?container.config().scaledown_duration,
            "managing container"
        );
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_string(), container);
        Ok(())
    }
}

impl<T: TaskDelegate> TaskService for ZeropodTask<T> {
    fn create(&self, req: CreateRequest) -> Result<CreateResponse, TaskError> {
        self.delegate.create(req)
    }

    fn start(&self, req: StartRequest) -> Result<StartResponse, TaskError> {
        let resp = self.delegate.start(req.clone())?;

        if !req.exec_id.is_empty() {
            if self.managed(&req.id).is_some() {
                // track the exec's pid so its exit is attributed correctly
                let process = Arc::new(ProcessHandle::new(
                    req.exec_id.clone(),
                    resp.pid as i32,
                    Stdio::default(),
                ));
                self.reconciler.register_process(&req.id, process);
            }
            return Ok(resp);
        }

        self.manage(&req.id)?;
        Ok(resp)
    }

    fn exec(&self, req: ExecRequest) -> Result<(), TaskError> {
        if let Some(container) = self.managed(&req.id) {
            {
                let _guard = container.lock_checkpoint_restore();
                container.cancel_scale_down();
                container.exec_started();
            }
            if container.status() == ScaleState::ScaledDown {
                if let Err(err) = container.restore() {
                    container.exec_finished();
                    if !matches!(err, crate::error::ZeropodError::State(_)) {
                        (self.fatal)(&format!("error restoring container: {err}"));
                    }
                    return Err(TaskError::Internal(format!(
                        "restore for exec failed: {err}"
                    )));
                }
            }
        }
        self.delegate.exec(req)
    }

    fn delete(&self, req: DeleteRequest) -> Result<DeleteResponse, TaskError> {
        let resp = self.delegate.delete(req.clone())?;
        if let Some(container) = self.managed(&req.id) {
            if !req.exec_id.is_empty() {
                container.exec_finished();
                self.reconciler.flush_deferred(&req.id);
                container.schedule_scale_down();
            } else {
                container.terminate();
                self.reconciler.deregister_target(&req.id);
                self.containers.lock().unwrap().remove(&req.id);
            }
        }
        Ok(resp)
    }

    fn kill(&self, req: KillRequest) -> Result<(), TaskError> {
        let Some(container) = self.managed(&req.id) else {
            return self.delegate.kill(req);
        };

        // State work happens under the checkpoint/restore mutex so the kill
        // never observes a half-taken checkpoint or a half-finished
        // restore. The activator is stopped after the guard is released:
        // its accept threads block on this same mutex while restoring.
        let scaled_down = {
            let _guard = container.lock_checkpoint_restore();
            if req.exec_id.is_empty() && container.status() == ScaleState::ScaledDown {
                tracing::info!(container_id = %req.id, "kill while scaled down, synthesizing exit");
                container.initial_process().set_exited(0);
                container.current_process().set_exited(0);
                let _ = self.events.send(TaskEvent::Exit {
                    container_id: req.id.clone(),
                    exec_id: String::new(),
                    pid: container.initial_process().pid(),
                    exit_status: 0,
                    exited_at: Utc::now(),
                });
                container.begin_termination();
                true
            } else {
                if req.exec_id.is_empty() {
                    container.cancel_scale_down();
                    if let Ok(signal) = Signal::try_from(req.signal as i32) {
                        container.kill_current(signal, req.all);
                        if matches!(signal, Signal::SIGTERM | Signal::SIGKILL | Signal::SIGINT) {
                            container.begin_termination();
                        }
                    }
                    container.initial_process().set_exited(0);
                }
                false
            }
        };

        container.stop_activator();
        if scaled_down {
            if let Err(err) = self.delegate.kill(req) {
                // the process is gone by design, nothing left to signal
                tracing::debug!(%err, "delegate kill after scale-down");
            }
            return Ok(());
        }
        self.delegate.kill(req)
    }

    fn state(&self, req: StateRequest) -> Result<StateResponse, TaskError> {
        self.delegate.state(req)
    }

    fn wait(&self, req: WaitRequest) -> Result<WaitResponse, TaskError> {
        self.delegate.wait(req)
    }

    fn pause(&self, req: PauseRequest) -> Result<(), TaskError> {
        self.delegate.pause(req)
    }

    fn resume(&self, req: ResumeRequest) -> Result<(), TaskError> {
        self.delegate.resume(req)
    }

    fn stats(&self, req: StatsRequest) -> Result<StatsResponse, TaskError> {
        self.delegate.stats(req)
    }

    fn close_io(&self, req: CloseIoRequest) -> Result<(), TaskError> {
        self.delegate.close_io(req)
    }

    fn update(&self, req: UpdateRequest) -> Result<(), TaskError> {
        self.delegate.update(req)
    }

    fn checkpoint(&self, req: CheckpointTaskRequest) -> Result<(), TaskError> {
        self.delegate.checkpoint(req)
    }

    fn connect(&self, req: ConnectRequest) -> Result<ConnectResponse, TaskError> {
        self.delegate.connect(req)
    }

    fn shutdown(&self, req: ShutdownRequest) -> Result<(), TaskError> {
        let containers: Vec<_> = self.containers.lock().unwrap().values().cloned().collect();
        for container in containers {
            container.cancel_scale_down();
            container.stop_activator();
        }
        self.delegate.shutdown(req)
    }
}
