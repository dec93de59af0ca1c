//! Event bridge between the driver's fd-interest requests and the host
//! poller.
//!
//! The driver asks to watch, rewatch, or forget control descriptors; the
//! bridge owns the corresponding poller registrations, keyed by fd with
//! monotonically increasing tokens. Tokens are never reused, so a stale
//! readiness event for a forgotten descriptor resolves to nothing even if
//! the OS has already handed the same fd number to someone else. The
//! driver may mutate the watch set from inside its own readiness handler;
//! keyed storage keeps that safe while an event batch is being walked.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::{Registry, Token};

use memlink_driver::{FdSink, FdUpdate, Interest, Readiness};

/// Token space reserved for the bridge's registrations. Token(0) belongs
/// to the doorbell.
pub(crate) const FIRST_FD_TOKEN: usize = 1;

pub(crate) struct EventBridge {
    registry: Registry,
    token_by_fd: HashMap<RawFd, Token>,
    fd_by_token: HashMap<Token, RawFd>,
    next_token: usize,
}

impl EventBridge {
    pub(crate) fn new(registry: Registry) -> Self {
        Self {
            registry,
            token_by_fd: HashMap::new(),
            fd_by_token: HashMap::new(),
            next_token: FIRST_FD_TOKEN,
        }
    }

    /// Resolve a poll token back to its descriptor. `None` means the
    /// registration was forgotten and the event must be suppressed.
    pub(crate) fn fd_for(&self, token: Token) -> Option<RawFd> {
        self.fd_by_token.get(&token).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.token_by_fd.len()
    }

    /// Translate host readiness into the driver's event vocabulary.
    pub(crate) fn translate(event: &mio::event::Event) -> Readiness {
        let mut readiness = Readiness::empty();
        if event.is_readable() {
            readiness = readiness.union(Readiness::READ);
        }
        if event.is_writable() {
            readiness = readiness.union(Readiness::WRITE);
        }
        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            readiness = readiness.union(Readiness::ERROR);
        }
        readiness
    }

    /// Drop every remaining registration. Called at teardown; a non-empty
    /// watch set here means the driver leaked descriptors, which is worth
    /// a warning but never an error.
    pub(crate) fn clear(&mut self) {
        if !self.token_by_fd.is_empty() {
            tracing::warn!(
                remaining = self.token_by_fd.len(),
                "closing residual fd registrations"
            );
        }
        for (&fd, _) in &self.token_by_fd {
            if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                tracing::warn!(fd, "deregister failed during teardown: {err}");
            }
        }
        self.token_by_fd.clear();
        self.fd_by_token.clear();
    }

    fn to_mio(interest: Interest) -> mio::Interest {
        match (interest.is_read(), interest.is_write()) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }
}

impl FdSink for EventBridge {
    fn apply(&mut self, update: FdUpdate) -> std::io::Result<()> {
        match update {
            FdUpdate::Watch { fd, interest } => {
                if let Some(&token) = self.token_by_fd.get(&fd) {
                    // Exactly one registration per fd: a repeated watch is
                    // an interest change.
                    tracing::trace!(fd, "watch for already-watched fd, rewatching");
                    self.registry
                        .reregister(&mut SourceFd(&fd), token, Self::to_mio(interest))?;
                    return Ok(());
                }
                let token = Token(self.next_token);
                self.next_token += 1;
                self.registry
                    .register(&mut SourceFd(&fd), token, Self::to_mio(interest))?;
                self.token_by_fd.insert(fd, token);
                self.fd_by_token.insert(token, fd);
                tracing::trace!(fd, token = token.0, "watching fd");
                Ok(())
            }
            FdUpdate::Modify { fd, interest } => {
                let Some(&token) = self.token_by_fd.get(&fd) else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("modify for unwatched fd {fd}"),
                    ));
                };
                self.registry
                    .reregister(&mut SourceFd(&fd), token, Self::to_mio(interest))
            }
            FdUpdate::Forget { fd } => {
                let Some(token) = self.token_by_fd.remove(&fd) else {
                    // Forget is how the driver guarantees no callback can
                    // follow; an unknown fd already satisfies that.
                    tracing::trace!(fd, "forget for unwatched fd");
                    return Ok(());
                };
                self.fd_by_token.remove(&token);
                tracing::trace!(fd, token = token.0, "forgetting fd");
                self.registry.deregister(&mut SourceFd(&fd))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    fn poll_once(poll: &mut mio::Poll, events: &mut mio::Events) {
        poll.poll(events, Some(Duration::from_millis(100))).unwrap();
    }

    #[test]
    fn watch_dispatch_forget_suppresses() {
        let mut poll = mio::Poll::new().unwrap();
        let mut bridge = EventBridge::new(poll.registry().try_clone().unwrap());
        let (ringer, listener) = doorbell::pair().unwrap();
        let fd = listener.as_raw_fd();

        bridge
            .apply(FdUpdate::Watch {
                fd,
                interest: Interest::READ,
            })
            .unwrap();
        assert_eq!(bridge.len(), 1);

        ringer.ring();
        let mut events = mio::Events::with_capacity(8);
        poll_once(&mut poll, &mut events);
        let event = events.iter().next().expect("readiness expected");
        assert_eq!(bridge.fd_for(event.token()), Some(fd));
        assert!(EventBridge::translate(event).is_read());
        let stale = event.token();
        listener.drain();

        bridge.apply(FdUpdate::Forget { fd }).unwrap();
        assert_eq!(bridge.len(), 0);
        // A spurious wakeup carrying the old token resolves to nothing.
        assert_eq!(bridge.fd_for(stale), None);

        // No further readiness is delivered for the forgotten fd.
        ringer.ring();
        let mut events = mio::Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert!(events.iter().next().is_none());
    }

    #[test]
    fn rewatch_keeps_single_registration() {
        let poll = mio::Poll::new().unwrap();
        let mut bridge = EventBridge::new(poll.registry().try_clone().unwrap());
        let (_ringer, listener) = doorbell::pair().unwrap();
        let fd = listener.as_raw_fd();

        bridge
            .apply(FdUpdate::Watch {
                fd,
                interest: Interest::READ,
            })
            .unwrap();
        bridge
            .apply(FdUpdate::Watch {
                fd,
                interest: Interest::READ_WRITE,
            })
            .unwrap();
        assert_eq!(bridge.len(), 1);
    }

    #[test]
    fn modify_unwatched_fd_fails() {
        let poll = mio::Poll::new().unwrap();
        let mut bridge = EventBridge::new(poll.registry().try_clone().unwrap());
        let err = bridge
            .apply(FdUpdate::Modify {
                fd: 999,
                interest: Interest::READ,
            })
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn forget_unwatched_fd_is_noop() {
        let poll = mio::Poll::new().unwrap();
        let mut bridge = EventBridge::new(poll.registry().try_clone().unwrap());
        bridge.apply(FdUpdate::Forget { fd: 999 }).unwrap();
    }

    #[test]
    fn tokens_are_never_reused() {
        let poll = mio::Poll::new().unwrap();
        let mut bridge = EventBridge::new(poll.registry().try_clone().unwrap());
        let (_r1, l1) = doorbell::pair().unwrap();
        let fd = l1.as_raw_fd();

        bridge
            .apply(FdUpdate::Watch {
                fd,
                interest: Interest::READ,
            })
            .unwrap();
        let first = bridge.token_by_fd[&fd];
        bridge.apply(FdUpdate::Forget { fd }).unwrap();
        bridge
            .apply(FdUpdate::Watch {
                fd,
                interest: Interest::READ,
            })
            .unwrap();
        let second = bridge.token_by_fd[&fd];
        assert_ne!(first, second);
    }

    #[test]
    fn clear_drops_everything() {
        let poll = mio::Poll::new().unwrap();
        let mut bridge = EventBridge::new(poll.registry().try_clone().unwrap());
        let (_r, l) = doorbell::pair().unwrap();
        bridge
            .apply(FdUpdate::Watch {
                fd: l.as_raw_fd(),
                interest: Interest::READ,
            })
            .unwrap();
        bridge.clear();
        assert_eq!(bridge.len(), 0);
    }
}
