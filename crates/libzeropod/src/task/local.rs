//! Minimal reference delegate driving the [`Runtime`] contract directly.
//! The production delegate lives in the shim host; this one exists so the
//! debug runner and the integration tests have a complete task service to
//! wrap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;

use super::api::{
    CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse, CreateRequest,
    CreateResponse, DeleteRequest, DeleteResponse, DelegatedTask, ExecRequest, KillRequest,
    PauseRequest, ResumeRequest, ShutdownRequest, StartRequest, StartResponse, StateRequest,
    StateResponse, StatsRequest, StatsResponse, TaskDelegate, TaskError, TaskService,
    UpdateRequest, WaitRequest, WaitResponse,
};
use crate::events::TaskEvent;
use crate::process::ProcessHandle;
use crate::reconciler::ExitEvent;
use crate::runtime::{ContainerSlot, CreateOpts, Runtime};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Entry {
    slot: ContainerSlot,
    init: Arc<ProcessHandle>,
    bundle: PathBuf,
    cgroup_path: Option<PathBuf>,
    execs: HashMap<String, Arc<ProcessHandle>>,
}

pub struct LocalTask {
    runtime: Arc<dyn Runtime>,
    events: Sender<TaskEvent>,
    entries: Mutex<HashMap<String, Entry>>,
    next_exec_pid: AtomicI32,
}

impl LocalTask {
    pub fn new(runtime: Arc<dyn Runtime>, events: Sender<TaskEvent>) -> Self {
        Self {
            runtime,
            events,
            entries: Mutex::new(HashMap::new()),
            next_exec_pid: AtomicI32::new(70000),
        }
    }

    fn with_entry<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Entry) -> Result<R, TaskError>,
    ) -> Result<R, TaskError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(id).ok_or_else(|| TaskError::NotFound {
            id: id.to_string(),
        })?;
        f(entry)
    }

    fn process(&self, id: &str, exec_id: &str) -> Result<Arc<ProcessHandle>, TaskError> {
        self.with_entry(id, |entry| {
            if exec_id.is_empty() {
                return Ok(entry.init.clone());
            }
            entry
                .execs
                .get(exec_id)
                .cloned()
                .ok_or_else(|| TaskError::NotFound {
                    id: format!("{id}/{exec_id}"),
                })
        })
    }
}

impl TaskService for LocalTask {
    fn create(&self, req: CreateRequest) -> Result<CreateResponse, TaskError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&req.id) {
            return Err(TaskError::Exists { id: req.id });
        }

        let cgroup_path = Spec::load(req.bundle.join("config.json"))
            .ok()
            .and_then(|spec| {
                spec.linux()
                    .as_ref()
                    .and_then(|linux| linux.cgroups_path().clone())
            });

        let container = self.runtime.create(CreateOpts {
            id: req.id.clone(),
            bundle: req.bundle.clone(),
            checkpoint: None,
            work_path: None,
            stdio: req.stdio.clone(),
        })?;

        entries.insert(
            req.id.clone(),
            Entry {
                slot: Arc::new(Mutex::new(container)),
                init: Arc::new(ProcessHandle::new("", 0, req.stdio)),
                bundle: req.bundle,
                cgroup_path,
                execs: HashMap::new(),
            },
        );
        Ok(CreateResponse { pid: 0 })
    }

    fn start(&self, req: StartRequest) -> Result<StartResponse, TaskError> {
        let (pid, container_id) = self.with_entry(&req.id, |entry| {
            if req.exec_id.is_empty() {
                let pid = entry.slot.lock().unwrap().start()?;
                entry.init.set_pid(pid.as_raw());
                return Ok((pid.as_raw(), req.id.clone()));
            }
            let process =
                entry
                    .execs
                    .get(&req.exec_id)
                    .cloned()
                    .ok_or_else(|| TaskError::NotFound {
                        id: format!("{}/{}", req.id, req.exec_id),
                    })?;
            // the runtime contract has no exec surface, the reference
            // delegate only models exec bookkeeping
            let pid = self.next_exec_pid.fetch_add(1, Ordering::SeqCst);
            process.set_pid(pid);
            Ok((pid, req.id.clone()))
        })?;

        let _ = self.events.send(TaskEvent::Start {
            container_id,
            pid,
        });
        Ok(StartResponse { pid: pid as u32 })
    }

    fn exec(&self, req: ExecRequest) -> Result<(), TaskError> {
        self.with_entry(&req.id, |entry| {
            entry.execs.insert(
                req.exec_id.clone(),
                Arc::new(ProcessHandle::new(req.exec_id.clone(), 0, req.stdio)),
            );
            Ok(())
        })
    }

    fn delete(&self, req: DeleteRequest) -> Result<DeleteResponse, TaskError> {
        if !req.exec_id.is_empty() {
            return self.with_entry(&req.id, |entry| {
                let process =
                    entry
                        .execs
                        .remove(&req.exec_id)
                        .ok_or_else(|| TaskError::NotFound {
                            id: format!("{}/{}", req.id, req.exec_id),
                        })?;
                let exit = process.exited();
                Ok(DeleteResponse {
                    pid: process.pid() as u32,
                    exit_status: exit.map(|e| e.status as u32).unwrap_or(0),
                    exited_at: exit.map(|e| e.exited_at),
                })
            });
        }

        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(&req.id).ok_or_else(|| TaskError::NotFound {
            id: req.id.clone(),
        })?;
        if let Err(err) = entry.slot.lock().unwrap().delete(true) {
            tracing::warn!(container_id = %req.id, %err, "failed to delete runtime container");
        }
        let exit = entry.init.exited();
        Ok(DeleteResponse {
            pid: entry.init.pid() as u32,
            exit_status: exit.map(|e| e.status as u32).unwrap_or(0),
            exited_at: exit.map(|e| e.exited_at),
        })
    }

    fn kill(&self, req: KillRequest) -> Result<(), TaskError> {
        self.with_entry(&req.id, |entry| {
            if !req.exec_id.is_empty() {
                return Ok(());
            }
            let signal = Signal::try_from(req.signal as i32)
                .map_err(|_| TaskError::FailedPrecondition(format!("bad signal {}", req.signal)))?;
            entry.slot.lock().unwrap().kill(signal, req.all)?;
            Ok(())
        })
    }

    fn state(&self, req: StateRequest) -> Result<StateResponse, TaskError> {
        let process = self.process(&req.id, &req.exec_id)?;
        let bundle = self.with_entry(&req.id, |entry| Ok(entry.bundle.clone()))?;
        let exit = process.exited();
        let status = match (&exit, process.pid()) {
            (Some(_), _) => "stopped",
            (None, 0) => "created",
            (None, _) => "running",
        };
        Ok(StateResponse {
            id: req.id,
            bundle,
            pid: process.pid() as u32,
            status: status.to_string(),
            exit_status: exit.map(|e| e.status as u32).unwrap_or(0),
            exited_at: exit.map(|e| e.exited_at),
        })
    }

    fn wait(&self, req: WaitRequest) -> Result<WaitResponse, TaskError> {
        let process = self.process(&req.id, &req.exec_id)?;
        loop {
            if let Some(exit) = process.exited() {
                return Ok(WaitResponse {
                    exit_status: exit.status as u32,
                    exited_at: Some(exit.exited_at),
                });
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn pause(&self, _req: PauseRequest) -> Result<(), TaskError> {
        Err(TaskError::FailedPrecondition(
            "pause is not supported by the reference delegate".to_string(),
        ))
    }

    fn resume(&self, _req: ResumeRequest) -> Result<(), TaskError> {
        Err(TaskError::FailedPrecondition(
            "resume is not supported by the reference delegate".to_string(),
        ))
    }

    fn stats(&self, req: StatsRequest) -> Result<StatsResponse, TaskError> {
        self.with_entry(&req.id, |_| {
            Ok(StatsResponse {
                stats: serde_json::Value::Null,
            })
        })
    }

    fn close_io(&self, _req: CloseIoRequest) -> Result<(), TaskError> {
        Ok(())
    }

    fn update(&self, _req: UpdateRequest) -> Result<(), TaskError> {
        Ok(())
    }

    fn checkpoint(&self, _req: CheckpointTaskRequest) -> Result<(), TaskError> {
        Err(TaskError::FailedPrecondition(
            "external checkpoint requests are not supported".to_string(),
        ))
    }

    fn connect(&self, req: ConnectRequest) -> Result<ConnectResponse, TaskError> {
        let task_pid = self
            .process(&req.id, "")
            .map(|process| process.pid() as u32)
            .unwrap_or(0);
        Ok(ConnectResponse {
            shim_pid: std::process::id(),
            task_pid,
        })
    }

    fn shutdown(&self, _req: ShutdownRequest) -> Result<(), TaskError> {
        Ok(())
    }
}

impl TaskDelegate for LocalTask {
    fn container(&self, id: &str) -> Result<DelegatedTask, TaskError> {
        self.with_entry(id, |entry| {
            Ok(DelegatedTask {
                container: entry.slot.clone(),
                init: entry.init.clone(),
                bundle: entry.bundle.clone(),
                cgroup_path: entry.cgroup_path.clone(),
            })
        })
    }

    fn handle_process_exit(&self, event: &ExitEvent) {
        let entries = self.entries.lock().unwrap();
        for entry in entries.values() {
            if entry.init.pid() == event.pid {
                entry.init.set_exited(event.status);
            }
            for process in entry.execs.values() {
                if process.pid() == event.pid {
                    process.set_exited(event.status);
                }
            }
        }
    }
}
