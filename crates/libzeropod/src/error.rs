use crate::activator::ActivatorError;
use crate::config::ConfigError;
use crate::container::StateError;
use crate::netlock::NetlockError;
use crate::netns::NetnsError;
use crate::runtime::RuntimeError;

pub type Result<T> = std::result::Result<T, ZeropodError>;

/// Top level error for the crate. The per-module errors carry the detail,
/// this enum only exists so callers that drive a whole scale-down or restore
/// cycle can use a single error type.
#[derive(Debug, thiserror::Error)]
pub enum ZeropodError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Activator(#[from] ActivatorError),
    #[error(transparent)]
    Netlock(#[from] NetlockError),
    #[error(transparent)]
    Netns(#[from] NetnsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint failed: {reason}")]
    Checkpoint { reason: String, dump_log: String },
    #[error("restore failed: {reason}")]
    Restore { reason: String, restore_log: String },
}
