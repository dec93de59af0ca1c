//! Connectivity-state deduplication.

use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks the link's connected flag and deduplicates transitions so each
/// real up/down flip yields at most one notification, no matter how many
/// threads or callbacks race to report it.
#[derive(Debug, Default)]
pub(crate) struct StateTracker {
    connected: AtomicBool,
}

impl StateTracker {
    pub(crate) const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
        }
    }

    /// Records the new state. Returns `true` if this call actually changed
    /// it, i.e. the caller owns the single notification for this
    /// transition.
    pub(crate) fn transition(&self, up: bool) -> bool {
        self.connected.swap(up, Ordering::AcqRel) != up
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let t = StateTracker::new();
        assert!(!t.is_connected());
    }

    #[test]
    fn first_up_owns_transition() {
        let t = StateTracker::new();
        assert!(t.transition(true));
        assert!(t.is_connected());
        // Repeated ups are duplicates.
        assert!(!t.transition(true));
    }

    #[test]
    fn down_after_up_owns_transition() {
        let t = StateTracker::new();
        t.transition(true);
        assert!(t.transition(false));
        assert!(!t.transition(false));
        assert!(!t.is_connected());
    }

    #[test]
    fn down_while_already_down_is_duplicate() {
        let t = StateTracker::new();
        assert!(!t.transition(false));
    }
}
