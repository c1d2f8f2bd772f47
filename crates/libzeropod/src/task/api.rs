//! Transport-agnostic task service contract, mirroring the task API of the
//! shim host. The wrapper and the delegate both implement [`TaskService`];
//! the RPC framing that carries these requests lives in the host and is not
//! part of this crate.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::process::{ProcessHandle, Stdio};
use crate::reconciler::ExitEvent;
use crate::runtime::{ContainerSlot, RuntimeError};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {id} not found")]
    NotFound { id: String },
    #[error("task {id} already exists")]
    Exists { id: String },
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub id: String,
    pub bundle: PathBuf,
    pub stdio: Stdio,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    pub id: String,
    pub exec_id: String,
    pub stdio: Stdio,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillRequest {
    pub id: String,
    pub exec_id: String,
    pub signal: u32,
    pub all: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateResponse {
    pub id: String,
    pub bundle: PathBuf,
    pub pid: u32,
    pub status: String,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitResponse {
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseIoRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub id: String,
    pub resources: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointTaskRequest {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub shim_pid: u32,
    pub task_pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub id: String,
    pub now: bool,
}

/// The task operations of the shim. The wrapper applies scale-down behavior
/// to a subset and delegates everything transparently.
pub trait TaskService: Send + Sync {
    fn create(&self, req: CreateRequest) -> Result<CreateResponse, TaskError>;
    fn start(&self, req: StartRequest) -> Result<StartResponse, TaskError>;
    fn exec(&self, req: ExecRequest) -> Result<(), TaskError>;
    fn delete(&self, req: DeleteRequest) -> Result<DeleteResponse, TaskError>;
    fn kill(&self, req: KillRequest) -> Result<(), TaskError>;
    fn state(&self, req: StateRequest) -> Result<StateResponse, TaskError>;
    fn wait(&self, req: WaitRequest) -> Result<WaitResponse, TaskError>;
    fn pause(&self, req: PauseRequest) -> Result<(), TaskError>;
    fn resume(&self, req: ResumeRequest) -> Result<(), TaskError>;
    fn stats(&self, req: StatsRequest) -> Result<StatsResponse, TaskError>;
    fn close_io(&self, req: CloseIoRequest) -> Result<(), TaskError>;
    fn update(&self, req: UpdateRequest) -> Result<(), TaskError>;
    fn checkpoint(&self, req: CheckpointTaskRequest) -> Result<(), TaskError>;
    fn connect(&self, req: ConnectRequest) -> Result<ConnectResponse, TaskError>;
    fn shutdown(&self, req: ShutdownRequest) -> Result<(), TaskError>;
}

/// Handover of a task the delegate started, so the wrapper can manage it.
pub struct DelegatedTask {
    pub container: ContainerSlot,
    pub init: Arc<ProcessHandle>,
    pub bundle: PathBuf,
    pub cgroup_path: Option<PathBuf>,
}

/// What the wrapper needs from the underlying task service beyond the plain
/// RPCs.
pub trait TaskDelegate: TaskService {
    /// Hands out the runtime container slot and init process of a started
    /// task.
    fn container(&self, id: &str) -> Result<DelegatedTask, TaskError>;
    /// Receives the process exits that survive reconciliation.
    fn handle_process_exit(&self, event: &ExitEvent);
}
