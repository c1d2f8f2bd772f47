//! Task service surface: the wrapper applying scale-down behavior and the
//! contract it wraps.

pub mod api;
mod local;
mod service;

pub use api::{TaskDelegate, TaskError, TaskService};
pub use local::LocalTask;
pub use service::{FatalHandler, LockFactory, ZeropodTask};
