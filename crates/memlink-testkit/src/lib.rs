//! Scripted in-memory [`Driver`] for tests.
//!
//! [`MockDriver`] is a cloneable handle over shared state: one clone moves
//! into the endpoint under test, another stays in the test to script
//! inbound traffic ([`MockDriver::push_frame`],
//! [`MockDriver::push_link_event`]) and inspect what the endpoint did
//! ([`MockDriver::transmitted`] and friends). It supports both dispatch
//! models: `poll_event` waits on the scripted event queue, and in the
//! host-driven model each connection carries a real socketpair so pushed
//! events wake the host poller the same way a native control channel
//! would.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use memlink_driver::{
    ConnArgs, ConnHandle, Driver, DriverError, FdSink, FdUpdate, Interest, LinkEvent, Readiness,
    RxSlice, SocketHandle,
};

#[derive(Debug)]
struct MockConn {
    dataroom: u16,
    /// Control socketpair, present in the host-driven model. `notify` is
    /// written on every scripted event; `watched` is the end handed to the
    /// host poller.
    ctrl: Option<(OwnedFd, OwnedFd)>,
}

#[derive(Debug, Default)]
struct MockState {
    next_socket: u32,
    next_conn: u32,
    sockets: HashMap<u32, PathBuf>,
    conns: HashMap<u32, MockConn>,
    rx_pending: VecDeque<(Vec<u8>, bool)>,
    pending_events: Vec<LinkEvent>,
    transmitted: Vec<Vec<u8>>,
    tx_grant_limit: Option<u16>,
    tx_send_limit: Option<u16>,
    tx_abort_calls: usize,
    refill_counts: Vec<u16>,
    refill_all_calls: usize,
    deleted_connections: usize,
    deleted_sockets: usize,
    fail_next_connection: Option<String>,
}

impl MockState {
    fn conn(&self, conn: ConnHandle) -> Result<&MockConn, DriverError> {
        self.conns.get(&conn.0).ok_or(DriverError::UnknownHandle)
    }
}

/// Cloneable scripted driver. See the crate docs.
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    /// Payload copies returned by the last `rx_burst`, per handle so the
    /// returned borrows never cross the shared lock.
    rx_scratch: Vec<(Vec<u8>, bool)>,
    /// Descriptors staged by `alloc_tx`, per handle for the same reason.
    tx_scratch: Vec<Vec<u8>>,
}

impl Clone for MockDriver {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            rx_scratch: Vec::new(),
            tx_scratch: Vec::new(),
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            rx_scratch: Vec::new(),
            tx_scratch: Vec::new(),
        }
    }

    /// `create_socket` without going through the trait object.
    ///
    /// # Errors
    ///
    /// Propagates the trait method's error.
    pub fn create_socket_direct(&mut self, path: &Path) -> Result<SocketHandle, DriverError> {
        Driver::create_socket(self, path)
    }

    /// `create_connection` without an fd sink (internal dispatch model).
    ///
    /// # Errors
    ///
    /// Propagates the trait method's error.
    pub fn create_connection_direct(
        &mut self,
        socket: SocketHandle,
        args: &ConnArgs,
    ) -> Result<ConnHandle, DriverError> {
        Driver::create_connection(self, socket, args, None)
    }

    /// Queue one inbound descriptor for the next `rx_burst`.
    pub fn push_frame(&self, bytes: &[u8], more: bool) {
        self.state
            .lock()
            .rx_pending
            .push_back((bytes.to_vec(), more));
    }

    /// Queue a control-plane event for the next `poll_event` or, in the
    /// host-driven model, signal the control descriptor so the host
    /// poller dispatches it.
    pub fn push_link_event(&self, event: LinkEvent) {
        let mut state = self.state.lock();
        // Queued before the notify byte: by the time the poller wakes,
        // the event is visible.
        state.pending_events.push(event);
        for conn in state.conns.values() {
            if let Some((notify, _watched)) = &conn.ctrl {
                let byte = [1u8];
                // SAFETY: `notify` is a valid owned descriptor; the buffer
                // outlives the call.
                unsafe {
                    libc::send(
                        notify.as_raw_fd(),
                        byte.as_ptr().cast(),
                        1,
                        libc::MSG_DONTWAIT,
                    );
                }
            }
        }
    }

    /// Make the next `create_connection` fail with the given message.
    pub fn set_fail_next_connection(&self, message: &str) {
        self.state.lock().fail_next_connection = Some(message.to_string());
    }

    pub fn set_tx_grant_limit(&self, limit: Option<u16>) {
        self.state.lock().tx_grant_limit = limit;
    }

    pub fn set_tx_send_limit(&self, limit: Option<u16>) {
        self.state.lock().tx_send_limit = limit;
    }

    /// Every payload transmitted so far, in descriptor order.
    #[must_use]
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.state.lock().transmitted.clone()
    }

    #[must_use]
    pub fn tx_abort_calls(&self) -> usize {
        self.state.lock().tx_abort_calls
    }

    /// Per-call descriptor counts handed to `refill`.
    #[must_use]
    pub fn refill_counts(&self) -> Vec<u16> {
        self.state.lock().refill_counts.clone()
    }

    #[must_use]
    pub fn refill_all_calls(&self) -> usize {
        self.state.lock().refill_all_calls
    }

    #[must_use]
    pub fn deleted_connections(&self) -> usize {
        self.state.lock().deleted_connections
    }

    #[must_use]
    pub fn deleted_sockets(&self) -> usize {
        self.state.lock().deleted_sockets
    }
}

fn ctrl_pair() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at two writable c_ints.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded, so both descriptors are valid and
    // owned by no one else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn drain_fd(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: buf is a valid writable buffer for the duration of the
        // call.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT) };
        if n <= 0 {
            return;
        }
    }
}

impl Driver for MockDriver {
    fn create_socket(&mut self, path: &Path) -> Result<SocketHandle, DriverError> {
        let mut state = self.state.lock();
        let id = state.next_socket;
        state.next_socket += 1;
        state.sockets.insert(id, path.to_path_buf());
        Ok(SocketHandle(id))
    }

    fn create_connection(
        &mut self,
        socket: SocketHandle,
        args: &ConnArgs,
        fds: Option<&mut dyn FdSink>,
    ) -> Result<ConnHandle, DriverError> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next_connection.take() {
            return Err(DriverError::Connection(message));
        }
        if !state.sockets.contains_key(&socket.0) {
            return Err(DriverError::UnknownHandle);
        }

        let ctrl = match fds {
            Some(sink) => {
                let (notify, watched) = ctrl_pair()?;
                sink.apply(FdUpdate::Watch {
                    fd: watched.as_raw_fd(),
                    interest: Interest::READ,
                })?;
                Some((notify, watched))
            }
            None => None,
        };

        let id = state.next_conn;
        state.next_conn += 1;
        state.conns.insert(
            id,
            MockConn {
                dataroom: args.dataroom,
                ctrl,
            },
        );
        Ok(ConnHandle(id))
    }

    fn delete_connection(&mut self, conn: ConnHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state
            .conns
            .remove(&conn.0)
            .ok_or(DriverError::UnknownHandle)?;
        state.deleted_connections += 1;
        Ok(())
    }

    fn delete_socket(&mut self, socket: SocketHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state
            .sockets
            .remove(&socket.0)
            .ok_or(DriverError::UnknownHandle)?;
        state.deleted_sockets += 1;
        Ok(())
    }

    fn handle_fd_event(
        &mut self,
        fd: RawFd,
        _readiness: Readiness,
        _fds: &mut dyn FdSink,
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let watched = state
            .conns
            .values()
            .any(|c| matches!(&c.ctrl, Some((_, w)) if w.as_raw_fd() == fd));
        if !watched {
            return Err(DriverError::UnknownFd(fd));
        }
        drain_fd(fd);
        events.append(&mut state.pending_events);
        Ok(())
    }

    fn poll_event(
        &mut self,
        timeout: Duration,
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if !state.pending_events.is_empty() {
                    events.append(&mut state.pending_events);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn rx_burst(
        &mut self,
        conn: ConnHandle,
        _queue: u16,
        max: u16,
    ) -> Result<Vec<RxSlice<'_>>, DriverError> {
        {
            let mut state = self.state.lock();
            state.conn(conn)?;
            self.rx_scratch.clear();
            for _ in 0..max {
                let Some(frame) = state.rx_pending.pop_front() else {
                    break;
                };
                self.rx_scratch.push(frame);
            }
        }
        Ok(self
            .rx_scratch
            .iter()
            .map(|(bytes, more)| RxSlice {
                data: bytes,
                more: *more,
            })
            .collect())
    }

    fn refill(&mut self, conn: ConnHandle, _queue: u16, count: u16) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.conn(conn)?;
        state.refill_counts.push(count);
        Ok(())
    }

    fn refill_all(&mut self, conn: ConnHandle, _queue: u16) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.conn(conn)?;
        state.refill_all_calls += 1;
        Ok(())
    }

    fn alloc_tx(&mut self, conn: ConnHandle, _queue: u16, chunks: u16) -> Result<u16, DriverError> {
        let state = self.state.lock();
        state.conn(conn)?;
        let granted = state.tx_grant_limit.map_or(chunks, |limit| chunks.min(limit));
        drop(state);
        self.tx_scratch = vec![Vec::new(); usize::from(granted)];
        Ok(granted)
    }

    fn tx_chunk(
        &mut self,
        conn: ConnHandle,
        _queue: u16,
        index: u16,
        len: u16,
    ) -> Result<&mut [u8], DriverError> {
        {
            let state = self.state.lock();
            let record = state.conn(conn)?;
            if len > record.dataroom {
                return Err(DriverError::RingExhausted);
            }
        }
        let slot = self
            .tx_scratch
            .get_mut(usize::from(index))
            .ok_or(DriverError::RingExhausted)?;
        slot.resize(usize::from(len), 0);
        Ok(slot)
    }

    fn tx_abort(&mut self, conn: ConnHandle, _queue: u16) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.conn(conn)?;
        state.tx_abort_calls += 1;
        drop(state);
        self.tx_scratch.clear();
        Ok(())
    }

    fn tx_burst(&mut self, conn: ConnHandle, _queue: u16, count: u16) -> Result<u16, DriverError> {
        let mut state = self.state.lock();
        state.conn(conn)?;
        let sent = state.tx_send_limit.map_or(count, |limit| count.min(limit));
        let staged = std::mem::take(&mut self.tx_scratch);
        state
            .transmitted
            .extend(staged.into_iter().take(usize::from(sent)));
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlink_driver::Role;

    fn open_conn(mock: &mut MockDriver) -> ConnHandle {
        let socket = mock
            .create_socket_direct(Path::new("/tmp/memlink-testkit.sock"))
            .unwrap();
        mock.create_connection_direct(
            socket,
            &ConnArgs {
                interface_id: 0,
                dataroom: 2048,
                ring_capacity_log2: 10,
                role: Role::Initiator,
            },
        )
        .unwrap()
    }

    #[test]
    fn rx_burst_respects_max_and_drains_in_order() {
        let mut mock = MockDriver::new();
        let conn = open_conn(&mut mock);
        mock.push_frame(b"one", false);
        mock.push_frame(b"two", true);
        mock.push_frame(b"three", false);

        let batch = mock.rx_burst(conn, 0, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].data, b"one");
        assert!(!batch[0].more);
        assert_eq!(batch[1].data, b"two");
        assert!(batch[1].more);

        let batch = mock.rx_burst(conn, 0, 2).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data, b"three");
    }

    #[test]
    fn poll_event_returns_scripted_events() {
        let mut mock = MockDriver::new();
        mock.push_link_event(LinkEvent::Up);
        mock.push_link_event(LinkEvent::Receive { queue: 0 });

        let mut events = Vec::new();
        mock.poll_event(Duration::from_millis(10), &mut events)
            .unwrap();
        assert_eq!(events, vec![LinkEvent::Up, LinkEvent::Receive { queue: 0 }]);

        // Queue is now empty; the deadline expires without events.
        events.clear();
        mock.poll_event(Duration::from_millis(1), &mut events)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn tx_staging_round_trips_through_burst() {
        let mut mock = MockDriver::new();
        let conn = open_conn(&mut mock);

        let granted = mock.alloc_tx(conn, 0, 2).unwrap();
        assert_eq!(granted, 2);
        mock.tx_chunk(conn, 0, 0, 3).unwrap().copy_from_slice(b"abc");
        mock.tx_chunk(conn, 0, 1, 3).unwrap().copy_from_slice(b"def");
        assert_eq!(mock.tx_burst(conn, 0, 2).unwrap(), 2);
        assert_eq!(mock.transmitted(), vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn unknown_conn_is_rejected() {
        let mut mock = MockDriver::new();
        assert!(matches!(
            mock.rx_burst(ConnHandle(42), 0, 1),
            Err(DriverError::UnknownHandle)
        ));
    }

    #[test]
    fn scripted_connection_failure() {
        let mut mock = MockDriver::new();
        let socket = mock
            .create_socket_direct(Path::new("/tmp/memlink-testkit-fail.sock"))
            .unwrap();
        mock.set_fail_next_connection("boom");
        let err = mock
            .create_connection_direct(
                socket,
                &ConnArgs {
                    interface_id: 0,
                    dataroom: 2048,
                    ring_capacity_log2: 10,
                    role: Role::Initiator,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DriverError::Connection(_)));
    }
}
