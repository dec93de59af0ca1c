//! memlink-driver: the seam between the memlink bridge and the external
//! shared-memory packet library.
//!
//! The external library owns the wire protocol, the ring layout, and the
//! control-channel handshake. This crate only defines the vocabulary the
//! bridge speaks to it:
//!
//! - [`Driver`]: lifecycle, fd-interest requests, readiness dispatch,
//!   and the rx/tx burst datapath.
//! - [`RxSlice`]: a borrowed view into one ring slot. The borrow ties the
//!   slot's lifetime to the driver, so a slot can never be touched after
//!   the ring is refilled.
//! - [`FdUpdate`]/[`FdSink`]: how the library asks the host loop to watch
//!   its control descriptors.
//! - [`LinkEvent`]: connect/disconnect/receive notifications surfaced by
//!   the library's control plane.
//!
//! A production driver wraps the native library; tests use the scripted
//! driver from `memlink-testkit`.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

/// Handle to a control socket created by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub u32);

/// Handle to one connection over a control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u32);

/// Which side of the link this endpoint plays during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Connects to an existing listener.
    #[default]
    Initiator,
    /// Listens for an initiator.
    Responder,
}

/// Arguments for creating a connection.
#[derive(Debug, Clone)]
pub struct ConnArgs {
    /// Interface id negotiated with the peer.
    pub interface_id: u32,
    /// Maximum payload bytes per descriptor.
    pub dataroom: u16,
    /// Ring holds `2^n` slots.
    pub ring_capacity_log2: u8,
    /// Handshake role.
    pub role: Role,
}

/// I/O directions the driver wants watched on a control descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Watch for readability.
    pub const READ: Interest = Interest(0b01);
    /// Watch for writability.
    pub const WRITE: Interest = Interest(0b10);
    /// Watch both directions.
    pub const READ_WRITE: Interest = Interest(0b11);

    /// Whether read readiness is requested.
    #[must_use]
    pub fn is_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Whether write readiness is requested.
    #[must_use]
    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

/// Readiness reported back into the driver for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    /// Descriptor is readable.
    pub const READ: Readiness = Readiness(0b001);
    /// Descriptor is writable.
    pub const WRITE: Readiness = Readiness(0b010);
    /// Descriptor is in an error state.
    pub const ERROR: Readiness = Readiness(0b100);

    /// Combine two readiness values.
    #[must_use]
    pub fn union(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }

    /// Whether read readiness is present.
    #[must_use]
    pub fn is_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Whether write readiness is present.
    #[must_use]
    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Whether an error condition is present.
    #[must_use]
    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Whether no condition is present.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// No readiness.
    #[must_use]
    pub const fn empty() -> Readiness {
        Readiness(0)
    }
}

/// A change the driver requests in the host loop's watch set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdUpdate {
    /// Start watching a previously unseen descriptor.
    Watch { fd: RawFd, interest: Interest },
    /// Change the interest mask of a watched descriptor.
    Modify { fd: RawFd, interest: Interest },
    /// Stop watching. After this returns, no readiness for `fd` may reach
    /// the driver again, even if the OS reuses the descriptor number.
    Forget { fd: RawFd },
}

/// Receiver for [`FdUpdate`] requests.
///
/// Implemented by the host loop's event bridge. The driver may call this
/// from inside [`Driver::handle_fd_event`], i.e. while the host loop is
/// mid-dispatch; implementations must tolerate that.
pub trait FdSink {
    /// Apply one watch-set change.
    ///
    /// # Errors
    ///
    /// Returns an error if the host poller rejects the registration.
    fn apply(&mut self, update: FdUpdate) -> std::io::Result<()>;
}

/// Control-plane notifications produced by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link came up.
    Up,
    /// The link went down.
    Down,
    /// Descriptors are pending on a receive queue.
    Receive { queue: u16 },
}

/// A borrowed view of one received descriptor's payload.
///
/// Valid only while the driver is borrowed; refilling the ring requires
/// `&mut` access again, so all slices must be copied out (or dropped)
/// first.
#[derive(Debug)]
pub struct RxSlice<'a> {
    /// Payload bytes inside the ring slot.
    pub data: &'a [u8],
    /// Continuation flag: this descriptor is a non-final fragment of a
    /// larger logical packet.
    pub more: bool,
}

/// Errors surfaced by a driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Process-wide library initialization failed.
    #[error("library init failed: {0}")]
    Init(String),

    /// Control socket creation failed.
    #[error("socket create failed: {0}")]
    Socket(String),

    /// Connection creation failed.
    #[error("connection create failed: {0}")]
    Connection(String),

    /// An operation referenced an unknown handle.
    #[error("unknown handle")]
    UnknownHandle,

    /// An operation referenced a descriptor the driver is not watching.
    #[error("unknown descriptor {0}")]
    UnknownFd(RawFd),

    /// The datapath is not connected.
    #[error("not connected")]
    NotConnected,

    /// The ring has no free descriptors.
    #[error("ring exhausted")]
    RingExhausted,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The external packet-interface library.
///
/// One instance owns the library's per-process state for one endpoint.
/// Two dispatch models are supported, chosen by the caller:
///
/// - host-driven: the caller watches the fds requested through [`FdSink`]
///   and feeds readiness back via [`Driver::handle_fd_event`];
/// - internal: the caller loops on [`Driver::poll_event`] with a bounded
///   timeout (typically from a dedicated thread) and the driver polls its
///   own descriptors.
pub trait Driver: Send {
    /// Create a control socket bound to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Socket`] if the native allocation fails.
    fn create_socket(&mut self, path: &Path) -> Result<SocketHandle, DriverError>;

    /// Create a connection over `socket`.
    ///
    /// When `fds` is `Some`, the driver must route every control
    /// descriptor it needs watched through it (host-driven model). When
    /// `None`, the driver polls its own descriptors via
    /// [`Driver::poll_event`].
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Connection`] on native failure; the socket
    /// stays valid.
    fn create_connection(
        &mut self,
        socket: SocketHandle,
        args: &ConnArgs,
        fds: Option<&mut dyn FdSink>,
    ) -> Result<ConnHandle, DriverError>;

    /// Tear down a connection. Idempotent on the driver side.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is unknown or native teardown fails.
    fn delete_connection(&mut self, conn: ConnHandle) -> Result<(), DriverError>;

    /// Tear down a control socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is unknown or native teardown fails.
    fn delete_socket(&mut self, socket: SocketHandle) -> Result<(), DriverError>;

    /// Dispatch readiness for a watched descriptor (host-driven model).
    ///
    /// Control-plane consequences are appended to `events`. The driver may
    /// re-enter `fds` during the call to grow or shrink its watch set.
    ///
    /// # Errors
    ///
    /// Returns an error if `fd` is unknown or the control exchange fails.
    fn handle_fd_event(
        &mut self,
        fd: RawFd,
        readiness: Readiness,
        fds: &mut dyn FdSink,
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), DriverError>;

    /// Poll the driver's own descriptors for up to `timeout` (internal
    /// model). Control-plane consequences are appended to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error on native poll failure.
    fn poll_event(
        &mut self,
        timeout: Duration,
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), DriverError>;

    /// Pull up to `max` received descriptors from `queue` without
    /// blocking. May return fewer, including none.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or not connected.
    fn rx_burst(
        &mut self,
        conn: ConnHandle,
        queue: u16,
        max: u16,
    ) -> Result<Vec<RxSlice<'_>>, DriverError>;

    /// Return `count` consumed descriptors to the receive ring.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    fn refill(&mut self, conn: ConnHandle, queue: u16, count: u16) -> Result<(), DriverError>;

    /// Refill the receive ring to capacity (used on link-up).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    fn refill_all(&mut self, conn: ConnHandle, queue: u16) -> Result<(), DriverError>;

    /// Stage up to `chunks` transmit descriptors and return how many were
    /// granted. Granted descriptors stay staged until [`Driver::tx_burst`]
    /// or [`Driver::tx_abort`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or not connected.
    fn alloc_tx(&mut self, conn: ConnHandle, queue: u16, chunks: u16) -> Result<u16, DriverError>;

    /// Payload region of staged descriptor `index`, sized to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is not staged or `len` exceeds the
    /// descriptor's dataroom.
    fn tx_chunk(
        &mut self,
        conn: ConnHandle,
        queue: u16,
        index: u16,
        len: u16,
    ) -> Result<&mut [u8], DriverError>;

    /// Return all staged descriptors to the ring without transmitting.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    fn tx_abort(&mut self, conn: ConnHandle, queue: u16) -> Result<(), DriverError>;

    /// Submit the first `count` staged descriptors as one burst. Returns
    /// how many were actually transmitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or nothing is staged.
    fn tx_burst(&mut self, conn: ConnHandle, queue: u16, count: u16) -> Result<u16, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_masks() {
        assert!(Interest::READ.is_read());
        assert!(!Interest::READ.is_write());
        assert!(Interest::WRITE.is_write());
        assert!(Interest::READ_WRITE.is_read());
        assert!(Interest::READ_WRITE.is_write());
    }

    #[test]
    fn readiness_union() {
        let r = Readiness::READ.union(Readiness::ERROR);
        assert!(r.is_read());
        assert!(r.is_error());
        assert!(!r.is_write());
        assert!(Readiness::empty().is_empty());
        assert!(!r.is_empty());
    }

    #[test]
    fn role_default_is_initiator() {
        assert_eq!(Role::default(), Role::Initiator);
    }
}
