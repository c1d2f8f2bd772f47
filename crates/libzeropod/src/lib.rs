//! Scale-to-zero container lifecycle management.
//!
//! This crate implements the machinery a shim needs to checkpoint idle
//! containers to disk and bring them back on demand: a lifecycle wrapper
//! interposing on the task RPCs, the checkpoint/restore engine, the network
//! activator impersonating scaled-down containers on their service ports,
//! the idle scheduler and the exit reconciler keeping the process exit
//! bookkeeping consistent across the transitions.

pub mod activator;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod logio;
pub mod metrics;
pub mod netlock;
pub mod netns;
pub mod oom;
pub mod process;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod task;

pub use error::{Result, ZeropodError};
