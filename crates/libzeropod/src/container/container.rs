use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use libcgroups::common::{create_cgroup_manager, CgroupConfig, CgroupManager};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::state::{ScaleState, StateError};
use crate::activator::Activator;
use crate::config::ZeropodConfig;
use crate::events::TaskEvent;
use crate::netlock::NetworkLock;
use crate::netns::NetnsHandle;
use crate::process::ProcessHandle;
use crate::reconciler::ReconcileTarget;
use crate::runtime::{ContainerSlot, Runtime};
use crate::scheduler::ScaleDownTimer;

/// Closure handed out by the pre-restore hook; called with the restored
/// process once it exists so the caller can track the new pid before any
/// exit can be observed for it.
pub type HandleStartedFn = Box<dyn FnOnce(&Arc<ManagedContainer>, Arc<ProcessHandle>) + Send>;
/// Registered by the lifecycle wrapper, invoked right before a restore.
pub type PreRestoreFn = Box<dyn Fn() -> HandleStartedFn + Send + Sync>;
/// Registered by the lifecycle wrapper, invoked after the container slot
/// was swapped to the restored instance.
pub type PostRestoreFn = Box<dyn Fn(&Arc<ManagedContainer>, Arc<ProcessHandle>) + Send + Sync>;
/// Policy for unrecoverable failures, e.g. a restore that went wrong after
/// the process is already gone.
pub type FatalHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct ManagedContainerOpts {
    pub id: String,
    pub bundle: PathBuf,
    pub cfg: ZeropodConfig,
    pub runtime: Arc<dyn Runtime>,
    pub netns: NetnsHandle,
    pub lock: Arc<dyn NetworkLock>,
    pub events: Sender<TaskEvent>,
    pub container: ContainerSlot,
    pub init: Arc<ProcessHandle>,
    pub cgroup_path: Option<PathBuf>,
}

/// A container elected for scale-down. Owns the runtime container slot, the
/// activator while scaled down, the idle countdown and the single mutex that
/// serializes checkpoint, restore and kill.
pub struct ManagedContainer {
    id: String,
    bundle: PathBuf,
    cfg: ZeropodConfig,
    runtime: Arc<dyn Runtime>,
    netns: NetnsHandle,
    lock: Arc<dyn NetworkLock>,
    events: Sender<TaskEvent>,
    state: Mutex<ScaleState>,
    checkpoint_restore: Mutex<()>,
    container: ContainerSlot,
    initial_process: Arc<ProcessHandle>,
    current_process: Mutex<Arc<ProcessHandle>>,
    activator: Mutex<Option<Arc<Activator>>>,
    timer: OnceLock<ScaleDownTimer>,
    pending_execs: AtomicUsize,
    pre_restore: Mutex<Option<PreRestoreFn>>,
    post_restore: Mutex<Option<PostRestoreFn>>,
    fatal_hook: Mutex<Option<FatalHook>>,
    cgroup_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    // self-reference for the callbacks handed to the timer and activator
    weak: OnceLock<Weak<ManagedContainer>>,
}

impl ManagedContainer {
    pub fn new(opts: ManagedContainerOpts) -> std::io::Result<Arc<Self>> {
        let log_path = opts.cfg.log_path();
        let container = Arc::new(Self {
            id: opts.id,
            bundle: opts.bundle,
            cfg: opts.cfg,
            runtime: opts.runtime,
            netns: opts.netns,
            lock: opts.lock,
            events: opts.events,
            state: Mutex::new(ScaleState::Running),
            checkpoint_restore: Mutex::new(()),
            container: opts.container,
            current_process: Mutex::new(opts.init.clone()),
            initial_process: opts.init,
            activator: Mutex::new(None),
            timer: OnceLock::new(),
            pending_execs: AtomicUsize::new(0),
            pre_restore: Mutex::new(None),
            post_restore: Mutex::new(None),
            fatal_hook: Mutex::new(None),
            cgroup_path: opts.cgroup_path,
            log_path,
            weak: OnceLock::new(),
        });
        let _ = container.weak.set(Arc::downgrade(&container));

        let weak = Arc::downgrade(&container);
        let timer = ScaleDownTimer::spawn(&container.id, move || {
            if let Some(container) = weak.upgrade() {
                container.scale_down_on_timer();
            }
        })?;
        let _ = container.timer.set(timer);
        Ok(container)
    }

    /// Weak self-reference for closures that must not keep the container
    /// alive.
    pub(super) fn weak_ref(&self) -> Weak<ManagedContainer> {
        self.weak.get().cloned().unwrap_or_default()
    }

    pub(super) fn strong_ref(&self) -> Option<Arc<ManagedContainer>> {
        self.weak.get().and_then(Weak::upgrade)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &PathBuf {
        &self.bundle
    }

    pub fn config(&self) -> &ZeropodConfig {
        &self.cfg
    }

    pub fn status(&self) -> ScaleState {
        *self.state.lock().unwrap()
    }

    pub(super) fn transition(&self, to: ScaleState) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition(to) {
            return Err(StateError::InvalidTransition { from: *state, to });
        }
        tracing::debug!(container_id = %self.id, from = %state, %to, "state transition");
        *state = to;
        Ok(())
    }

    /// The serialization point between checkpoint, restore and kill. Hold
    /// the returned guard across any operation that needs to observe a
    /// stable state.
    pub fn lock_checkpoint_restore(&self) -> MutexGuard<'_, ()> {
        self.checkpoint_restore.lock().unwrap()
    }

    pub fn initial_process(&self) -> Arc<ProcessHandle> {
        self.initial_process.clone()
    }

    pub fn current_process(&self) -> Arc<ProcessHandle> {
        self.current_process.lock().unwrap().clone()
    }

    pub(super) fn set_current_process(&self, process: Arc<ProcessHandle>) {
        *self.current_process.lock().unwrap() = process;
    }

    pub fn container(&self) -> ContainerSlot {
        self.container.clone()
    }

    pub fn register_pre_restore(&self, hook: PreRestoreFn) {
        *self.pre_restore.lock().unwrap() = Some(hook);
    }

    pub fn register_post_restore(&self, hook: PostRestoreFn) {
        *self.post_restore.lock().unwrap() = Some(hook);
    }

    pub fn register_fatal_hook(&self, hook: FatalHook) {
        *self.fatal_hook.lock().unwrap() = Some(hook);
    }

    pub(super) fn invoke_fatal(&self, message: &str) {
        if let Some(hook) = self.fatal_hook.lock().unwrap().as_ref() {
            hook(message);
        } else {
            tracing::error!(container_id = %self.id, message, "unrecoverable failure");
        }
    }

    pub(super) fn take_pre_restore_handle(&self) -> Option<HandleStartedFn> {
        self.pre_restore.lock().unwrap().as_ref().map(|hook| hook())
    }

    pub(super) fn run_post_restore(&self, process: Arc<ProcessHandle>) {
        let Some(this) = self.strong_ref() else { return };
        if let Some(hook) = self.post_restore.lock().unwrap().as_ref() {
            hook(&this, process);
        }
    }

    pub fn exec_started(&self) {
        self.pending_execs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exec_finished(&self) {
        let previous = self.pending_execs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
    }

    pub fn pending_execs(&self) -> usize {
        self.pending_execs.load(Ordering::SeqCst)
    }

    /// Arms (or re-arms) the scale-down countdown. No-op unless the
    /// container is running.
    pub fn schedule_scale_down(&self) {
        if !self.status().can_scale_down() {
            return;
        }
        if let Some(timer) = self.timer.get() {
            timer.schedule(self.cfg.scaledown_duration);
        }
    }

    pub fn cancel_scale_down(&self) {
        if let Some(timer) = self.timer.get() {
            timer.cancel();
        }
    }

    pub fn scale_down_scheduled(&self) -> bool {
        self.timer.get().map(ScaleDownTimer::scheduled).unwrap_or(false)
    }

    fn scale_down_on_timer(&self) {
        if self.pending_execs() > 0 {
            tracing::debug!(
                container_id = %self.id,
                "not scaling down, execs are running"
            );
            return;
        }
        if !self.status().can_scale_down() {
            return;
        }
        if let Err(err) = self.scale_down() {
            // scale-down is a background optimization, the container just
            // keeps running when it fails
            tracing::error!(container_id = %self.id, %err, "scale-down failed");
        }
    }

    pub(super) fn netns(&self) -> &NetnsHandle {
        &self.netns
    }

    pub(super) fn network_lock(&self) -> Arc<dyn NetworkLock> {
        self.lock.clone()
    }

    pub(super) fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.clone()
    }

    pub(super) fn send_event(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(container_id = %self.id, "event channel closed");
        }
    }

    pub(super) fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }

    pub(super) fn set_activator(&self, activator: Arc<Activator>) {
        // an activator from a previous generation is drained by now; this
        // runs under the C/R mutex, so no joining here
        if let Some(previous) = self.activator.lock().unwrap().replace(activator) {
            previous.stop_detached();
        }
    }

    pub fn activator(&self) -> Option<Arc<Activator>> {
        self.activator.lock().unwrap().clone()
    }

    pub fn stop_activator(&self) {
        if let Some(activator) = self.activator.lock().unwrap().take() {
            activator.stop();
        }
    }

    /// Unbinds the activator after a successful restore. The activator is
    /// bound only while the process is absent; its listeners drain what
    /// they already accepted and close. Restores usually run on one of the
    /// activator's own accept threads, so this must not join.
    pub(super) fn release_activator(&self) {
        if let Some(activator) = self.activator.lock().unwrap().take() {
            activator.stop_detached();
        }
    }

    /// Forwards a signal to the current process through the runtime.
    pub fn kill_current(&self, signal: Signal, all: bool) {
        let slot = self.container.clone();
        let container = slot.lock().unwrap();
        if let Err(err) = container.kill(signal, all) {
            tracing::warn!(container_id = %self.id, %err, "failed to forward signal");
        }
    }

    /// Re-attaches a restored pid to the container's cgroup. The runtime
    /// does not do this for a process that was brought back from images.
    pub(super) fn attach_cgroup(&self, pid: Pid) {
        let Some(cgroup_path) = &self.cgroup_path else {
            return;
        };
        let config = CgroupConfig {
            cgroup_path: cgroup_path.clone(),
            systemd_cgroup: false,
            container_name: self.id.clone(),
        };
        match create_cgroup_manager(config) {
            Ok(manager) => {
                if let Err(err) = manager.add_task(pid) {
                    tracing::warn!(container_id = %self.id, %err, "failed to re-attach cgroup");
                }
            }
            Err(err) => {
                tracing::warn!(container_id = %self.id, %err, "failed to create cgroup manager");
            }
        }
    }

    /// Starts tearing the container down: no further countdowns fire and
    /// restores bail out. Safe to call under the checkpoint/restore mutex;
    /// the activator is stopped separately because stopping joins accept
    /// threads that may be waiting on that mutex.
    pub fn begin_termination(&self) {
        self.cancel_scale_down();
        let _ = self.transition(ScaleState::Terminating);
    }

    /// Final teardown on delete of the init task.
    pub fn terminate(&self) {
        self.cancel_scale_down();
        self.stop_activator();
        let mut state = self.state.lock().unwrap();
        if *state != ScaleState::Terminated {
            tracing::debug!(container_id = %self.id, from = %state, "terminating");
            *state = ScaleState::Terminated;
        }
    }
}

impl ReconcileTarget for ManagedContainer {
    fn scale_state(&self) -> ScaleState {
        self.status()
    }

    fn pending_execs(&self) -> usize {
        self.pending_execs()
    }

    fn initial_process(&self) -> Arc<ProcessHandle> {
        self.initial_process()
    }

    fn current_process(&self) -> Option<Arc<ProcessHandle>> {
        Some(self.current_process())
    }
}
