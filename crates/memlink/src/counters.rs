//! Packet counters.
//!
//! All counters are monotonically non-decreasing for the lifetime of the
//! endpoint and may be read from any thread as a point-in-time snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter set shared between the datapath and the caller.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    rx_delivered: AtomicU64,
    rx_dropped: AtomicU64,
    rx_fragments: AtomicU64,
    tx_delivered: AtomicU64,
    tx_dropped: AtomicU64,
    tx_fragments: AtomicU64,
}

impl Counters {
    pub(crate) const fn new() -> Self {
        Self {
            rx_delivered: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            rx_fragments: AtomicU64::new(0),
            tx_delivered: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
            tx_fragments: AtomicU64::new(0),
        }
    }

    pub(crate) fn inc_rx_delivered(&self) {
        self.rx_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rx_fragments(&self) {
        self.rx_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_tx_delivered(&self) {
        self.tx_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_tx_fragments(&self, n: u64) {
        self.tx_fragments.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counters.
    #[must_use]
    pub(crate) fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            rx_delivered: self.rx_delivered.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_fragments: self.rx_fragments.load(Ordering::Relaxed),
            tx_delivered: self.tx_delivered.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            tx_fragments: self.tx_fragments.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the endpoint's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Whole packets delivered to the receive callback.
    pub rx_delivered: u64,
    /// Received packets dropped (full queue, or suppressed fragments).
    pub rx_dropped: u64,
    /// Individual fragments delivered to the receive callback.
    pub rx_fragments: u64,
    /// Whole packets handed to the transmit ring.
    pub tx_delivered: u64,
    /// Transmit attempts dropped before or during submission.
    pub tx_dropped: u64,
    /// Individual descriptors submitted for transmitted packets.
    pub tx_fragments: u64,
}

impl std::fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rx {{ delivered: {}, dropped: {}, fragments: {} }} tx {{ delivered: {}, dropped: {}, fragments: {} }}",
            self.rx_delivered,
            self.rx_dropped,
            self.rx_fragments,
            self.tx_delivered,
            self.tx_dropped,
            self.tx_fragments
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let c = Counters::new();
        c.inc_rx_delivered();
        c.inc_rx_delivered();
        c.inc_rx_dropped();
        c.inc_tx_delivered();
        c.inc_tx_dropped();
        c.add_tx_fragments(3);
        c.inc_rx_fragments();

        let s = c.snapshot();
        assert_eq!(s.rx_delivered, 2);
        assert_eq!(s.rx_dropped, 1);
        assert_eq!(s.rx_fragments, 1);
        assert_eq!(s.tx_delivered, 1);
        assert_eq!(s.tx_dropped, 1);
        assert_eq!(s.tx_fragments, 3);
    }

    #[test]
    fn display_contains_fields() {
        let c = Counters::new();
        c.inc_tx_dropped();
        let text = format!("{}", c.snapshot());
        assert!(text.contains("dropped: 1"));
    }
}
