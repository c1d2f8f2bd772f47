//! Contract between the shim and the OCI runtime that creates, starts,
//! checkpoints and kills container processes. Everything behind these traits
//! runs out of process; the shim only ever sees pids and exit events.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::process::Stdio;

pub mod runc;
pub mod test;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container {id} not found")]
    NotFound { id: String },
    #[error("container {id} already exists")]
    Exists { id: String },
    #[error("failed to invoke runtime: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("checkpoint failed: {reason}")]
    CheckpointFailed { reason: String },
    #[error("restore failed: {reason}")]
    RestoreFailed { reason: String },
    #[error("unable to determine pid of container {id}")]
    NoPid { id: String },
}

/// Options for creating a container, either fresh from a bundle or from a
/// checkpoint directory written by a previous [`RuntimeContainer::checkpoint`].
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub id: String,
    pub bundle: PathBuf,
    /// Restore from this image directory instead of executing the bundle
    /// entrypoint.
    pub checkpoint: Option<PathBuf>,
    pub work_path: Option<PathBuf>,
    pub stdio: Stdio,
}

/// Checkpoint options passed through to the runtime, which passes them on to
/// CRIU.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOpts {
    pub image_path: PathBuf,
    pub work_path: PathBuf,
    /// Let the process exit after the dump completes.
    pub exit: bool,
    pub tcp_established: bool,
    pub ext_unix_sk: bool,
    pub allow_terminal: bool,
    pub file_locks: bool,
    /// Perform a pre-dump pass before the final dump.
    pub pre_dump: bool,
    pub empty_namespaces: Vec<String>,
}

pub trait Runtime: Send + Sync {
    fn create(&self, opts: CreateOpts) -> Result<Box<dyn RuntimeContainer>, RuntimeError>;
}

pub trait RuntimeContainer: Send + Sync {
    fn id(&self) -> &str;
    fn bundle(&self) -> &Path;
    fn pid(&self) -> Option<Pid>;
    /// Starts (or restores) the container process and returns its pid.
    fn start(&mut self) -> Result<Pid, RuntimeError>;
    fn kill(&self, signal: Signal, all: bool) -> Result<(), RuntimeError>;
    fn checkpoint(&mut self, opts: &CheckpointOpts) -> Result<(), RuntimeError>;
    fn delete(&mut self, force: bool) -> Result<(), RuntimeError>;
}

/// Shared handle to the runtime container of a task. The delegate task
/// service and the managed container both hold the slot; a restore swaps the
/// contained instance so both sides observe the successor.
pub type ContainerSlot = Arc<Mutex<Box<dyn RuntimeContainer>>>;

pub fn snapshot_dir(bundle: &Path) -> PathBuf {
    bundle.join("snapshots")
}

/// Directory the container image files are dumped to.
pub fn container_dir(bundle: &Path) -> PathBuf {
    snapshot_dir(bundle).join("container")
}

/// Work directory CRIU writes `dump.log` and `restore.log` to.
pub fn work_dir(bundle: &Path) -> PathBuf {
    snapshot_dir(bundle).join("work")
}
