//! Endpoint configuration.

use std::path::PathBuf;
use std::time::Duration;

use memlink_driver::Role;

use crate::error::Error;

/// How multi-descriptor ("fragmented") receives are surfaced to the
/// caller. A packet larger than the negotiated dataroom arrives as a
/// chain of descriptors, all but the last carrying a continuation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentPolicy {
    /// Deliver every fragment, paired with a `more_fragments` flag.
    #[default]
    Forward,
    /// Suppress every fragment of a multi-descriptor packet and count the
    /// whole packet as dropped. Single-descriptor packets are unaffected.
    Discard,
}

/// Which thread drives the external library's I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduling {
    /// A dedicated thread runs the library's blocking poll loop; received
    /// packets and state changes cross into the consumer thread through a
    /// bounded queue and a doorbell.
    #[default]
    Background,
    /// The library's descriptors are watched by the consumer's own poll;
    /// every callback runs on the consumer thread.
    HostDriven,
}

/// Construction configuration for an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone)]
pub struct Config {
    /// Control socket path. Required, unique per process.
    pub socket_path: PathBuf,
    /// Interface id negotiated with the peer.
    pub interface_id: u32,
    /// Payload bytes per descriptor. Rounded up to the next power of two;
    /// the result must land in `512..=32768`.
    pub dataroom: u32,
    /// Ring slot count. Rounded up to the next power of two; the exponent
    /// must land in `4..=15`.
    pub ring_capacity: u32,
    /// Handshake role.
    pub role: Role,
    /// Fragmented-receive policy.
    pub fragments: FragmentPolicy,
    /// Scheduling model.
    pub scheduling: Scheduling,
    /// Cross-thread receive queue depth ([`Scheduling::Background`] only).
    pub rx_queue_depth: usize,
    /// Poll timeout for the background worker's loop iterations. Bounds
    /// how long `close()` waits for the thread to notice the stop flag.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::new(),
            interface_id: 0,
            dataroom: 2048,
            ring_capacity: 1024,
            role: Role::Initiator,
            fragments: FragmentPolicy::default(),
            scheduling: Scheduling::default(),
            rx_queue_depth: 1024,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Validated, normalized connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Normalized {
    pub dataroom: u16,
    pub ring_capacity_log2: u8,
}

impl Config {
    /// Validates the configuration and normalizes the ring geometry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any field is out of range.
    pub(crate) fn validate(&self) -> Result<Normalized, Error> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::Config("socket_path is required".to_string()));
        }

        let dataroom = self
            .dataroom
            .checked_next_power_of_two()
            .unwrap_or(u32::MAX);
        if !(512..=32768).contains(&dataroom) {
            return Err(Error::Config(format!(
                "dataroom {} out of range (512..=32768 after rounding)",
                self.dataroom
            )));
        }

        let ring_capacity = self
            .ring_capacity
            .checked_next_power_of_two()
            .unwrap_or(u32::MAX);
        let log2 = ring_capacity.trailing_zeros();
        if !(4..=15).contains(&log2) {
            return Err(Error::Config(format!(
                "ring_capacity {} out of range (16..=32768 after rounding)",
                self.ring_capacity
            )));
        }

        if self.rx_queue_depth == 0 {
            return Err(Error::Config("rx_queue_depth must be non-zero".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be non-zero".to_string()));
        }

        Ok(Normalized {
            dataroom: dataroom as u16,
            ring_capacity_log2: log2 as u8,
        })
    }
}
