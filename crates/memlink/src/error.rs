//! Error types for the bridge.

use std::path::PathBuf;

use memlink_driver::DriverError;

/// Errors surfaced by [`Endpoint`](crate::Endpoint) construction and the
/// consumer loop.
///
/// Datapath losses (allocation shortfall, short transmit, full queue,
/// send-while-disconnected) are never errors: they are counted in
/// [`CountersSnapshot`](crate::CountersSnapshot) and the call returns
/// normally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid construction arguments. Nothing was allocated.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The socket path is already owned by another endpoint in this
    /// process.
    #[error("socket path already in use: {}", .0.display())]
    SocketPathInUse(PathBuf),

    /// Native allocation failed during setup. Everything acquired by
    /// earlier steps has been rolled back.
    #[error("native setup failed: {0}")]
    Resource(#[from] DriverError),

    /// Host poller failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
