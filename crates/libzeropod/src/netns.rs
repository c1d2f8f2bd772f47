//! Network namespace handling. The activator and the redirect controller
//! both need to act inside the container's netns; the handle carries an open
//! fd so entry keeps working while the namespace's original process is gone.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sched::{setns, CloneFlags};
use oci_spec::runtime::{LinuxNamespaceType, Spec};

#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    #[error("failed to open netns {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to enter netns: {0}")]
    Enter(#[source] nix::Error),
}

/// Handle to a network namespace.
#[derive(Debug, Clone)]
pub enum NetnsHandle {
    /// The namespace the shim already runs in; entering is a no-op. Used
    /// for host-network containers and by tests.
    Current,
    Path { path: PathBuf, file: Arc<File> },
}

impl NetnsHandle {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, NetnsError> {
        let path = path.into();
        let file = File::open(&path).map_err(|source| NetnsError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self::Path {
            path,
            file: Arc::new(file),
        })
    }

    /// Resolves the netns of a container from its spec. The CRI layer
    /// records the bind-mounted namespace path there.
    pub fn from_spec(spec: &Spec) -> Result<Self, NetnsError> {
        let path = spec
            .linux()
            .as_ref()
            .and_then(|linux| linux.namespaces().as_ref())
            .and_then(|namespaces| {
                namespaces
                    .iter()
                    .find(|ns| ns.typ() == LinuxNamespaceType::Network)
            })
            .and_then(|ns| ns.path().clone());

        match path {
            Some(path) => Self::open(path),
            None => Ok(Self::Current),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Current => None,
            Self::Path { path, .. } => Some(path),
        }
    }

    /// Moves the calling thread into the namespace. Requires CAP_SYS_ADMIN
    /// for the [`NetnsHandle::Path`] variant.
    pub fn enter(&self) -> Result<(), NetnsError> {
        match self {
            Self::Current => Ok(()),
            Self::Path { file, .. } => {
                setns(file.as_fd(), CloneFlags::CLONE_NEWNET).map_err(NetnsError::Enter)
            }
        }
    }

    /// Raw fd for entering the namespace from a forked child, e.g. in a
    /// pre_exec hook.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Self::Current => None,
            Self::Path { file, .. } => Some(file.as_raw_fd()),
        }
    }
}
