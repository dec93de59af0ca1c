//! Process-wide runtime accounting.
//!
//! The external library keeps one set of process-wide native resources.
//! Endpoints reference-count it here: the first open initializes it, the
//! last close releases it. The registry also enforces that each control
//! socket path is owned by at most one live endpoint in the process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Error;

#[derive(Debug, Default)]
struct RuntimeState {
    refs: usize,
    socket_paths: HashSet<PathBuf>,
}

static RUNTIME: Mutex<Option<RuntimeState>> = Mutex::new(None);

/// One endpoint's share of the process-wide runtime. Released on drop.
#[derive(Debug)]
pub(crate) struct RuntimeRef {
    socket_path: PathBuf,
}

impl RuntimeRef {
    /// Claims `socket_path` and takes a reference on the runtime,
    /// initializing it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SocketPathInUse`] if another live endpoint owns
    /// the same path.
    pub(crate) fn acquire(socket_path: &Path) -> Result<RuntimeRef, Error> {
        let mut guard = RUNTIME.lock();
        let state = guard.get_or_insert_with(|| {
            tracing::debug!("initializing process-wide runtime");
            RuntimeState::default()
        });

        if !state.socket_paths.insert(socket_path.to_path_buf()) {
            return Err(Error::SocketPathInUse(socket_path.to_path_buf()));
        }
        state.refs += 1;

        Ok(RuntimeRef {
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Whether this reference is the last one alive. Used by teardown to
    /// decide when process-wide cleanup runs.
    pub(crate) fn is_last(&self) -> bool {
        let guard = RUNTIME.lock();
        matches!(guard.as_ref(), Some(state) if state.refs == 1)
    }
}

impl Drop for RuntimeRef {
    fn drop(&mut self) {
        let mut guard = RUNTIME.lock();
        let Some(state) = guard.as_mut() else {
            // Dropping a ref into an uninitialized runtime means the
            // process-wide accounting was corrupted; continuing would hide
            // a double-release.
            panic!("runtime released without being initialized");
        };
        assert!(
            state.refs > 0,
            "runtime reference count underflow (double release)"
        );
        state.socket_paths.remove(&self.socket_path);
        state.refs -= 1;
        if state.refs == 0 {
            tracing::debug!("releasing process-wide runtime");
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests share one process-wide registry, so each uses distinct
    // paths.

    #[test]
    fn duplicate_path_rejected_until_released() {
        let a = RuntimeRef::acquire(Path::new("/tmp/memlink-rt-dup.sock")).unwrap();
        let err = RuntimeRef::acquire(Path::new("/tmp/memlink-rt-dup.sock")).unwrap_err();
        assert!(matches!(err, Error::SocketPathInUse(_)));

        drop(a);
        let _b = RuntimeRef::acquire(Path::new("/tmp/memlink-rt-dup.sock")).unwrap();
    }

    #[test]
    fn distinct_paths_coexist() {
        let a = RuntimeRef::acquire(Path::new("/tmp/memlink-rt-a.sock")).unwrap();
        let b = RuntimeRef::acquire(Path::new("/tmp/memlink-rt-b.sock")).unwrap();
        assert!(!a.is_last() || !b.is_last());
        drop(a);
        drop(b);
    }
}
