//! Managed container lifecycle: the state machine, the checkpoint path and
//! the restore path. A container becomes managed on its first Start and
//! stays managed until the init task is deleted.

#[allow(clippy::module_inception)]
mod container;
mod restore;
mod scale_down;
pub mod state;

pub use container::{
    HandleStartedFn, ManagedContainer, ManagedContainerOpts, PostRestoreFn, PreRestoreFn,
};
pub use state::{ScaleState, StateError};
