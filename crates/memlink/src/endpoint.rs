//! The endpoint: connection lifecycle and the consumer-side loop.
//!
//! `Endpoint::open` builds everything atomically: any step's failure
//! rolls back what earlier steps acquired and surfaces a configuration or
//! resource error. After that the consumer drives `poll()` from its own
//! thread; depending on [`Scheduling`] the driver's I/O either crosses a
//! thread bridge into that loop or is dispatched by it directly.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::Token;
use parking_lot::Mutex;

use memlink_driver::{ConnArgs, Driver, LinkEvent, SocketHandle};

use crate::bridge::EventBridge;
use crate::channel::{self, Consumer};
use crate::config::{Config, Scheduling};
use crate::counters::{Counters, CountersSnapshot};
use crate::error::Error;
use crate::rx::RxPipeline;
use crate::runtime::RuntimeRef;
use crate::state::StateTracker;
use crate::tx::TxPipeline;
use crate::worker::{self, Delivery, Shared};

/// Poll token reserved for the cross-thread doorbell.
const DOORBELL: Token = Token(0);

/// Callbacks registered by the caller. Both run on the consumer thread,
/// from inside `poll()` (or, for the final down, `close()`).
pub struct Handlers {
    /// One received packet (already copied out of the ring) and whether
    /// more fragments of the same logical packet follow.
    pub on_receive: Box<dyn FnMut(&[u8], bool)>,
    /// Deduplicated connectivity change.
    pub on_state: Box<dyn FnMut(bool)>,
}

impl Handlers {
    /// Build handlers from two closures.
    #[must_use]
    pub fn new(
        on_receive: impl FnMut(&[u8], bool) + 'static,
        on_state: impl FnMut(bool) + 'static,
    ) -> Self {
        Self {
            on_receive: Box::new(on_receive),
            on_state: Box::new(on_state),
        }
    }

    /// Handlers that discard everything.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_, _| {}, |_| {})
    }
}

/// A shared-memory packet endpoint.
///
/// Owned by the consumer thread. `send` and `counters` are also available
/// through a cloneable [`EndpointHandle`], so user callbacks can transmit
/// re-entrantly.
pub struct Endpoint {
    driver: Arc<Mutex<Box<dyn Driver>>>,
    shared: Arc<Shared>,
    handlers: Handlers,
    poll: mio::Poll,
    events: mio::Events,
    /// Host-driven model only.
    bridge: Option<EventBridge>,
    /// Background model only.
    consumer: Option<Consumer>,
    worker: Option<JoinHandle<()>>,
    rx: RxPipeline,
    tx: TxPipeline,
    socket: SocketHandle,
    runtime: Option<RuntimeRef>,
    /// Last state the caller was told about; guards duplicate
    /// notifications and drives the synthesized final down.
    notified_up: bool,
    closed: bool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Open an endpoint over `driver` with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`]/[`Error::SocketPathInUse`] for invalid
    /// arguments and [`Error::Resource`]/[`Error::Io`] when a setup step
    /// fails. Construction is atomic: on error, everything acquired by
    /// earlier steps has been released.
    pub fn open<D: Driver + 'static>(
        driver: D,
        config: Config,
        handlers: Handlers,
    ) -> Result<Self, Error> {
        let normalized = config.validate()?;
        let runtime = RuntimeRef::acquire(&config.socket_path)?;
        let poll = mio::Poll::new()?;

        let mut driver: Box<dyn Driver> = Box::new(driver);
        let socket = driver.create_socket(&config.socket_path)?;

        let args = ConnArgs {
            interface_id: config.interface_id,
            dataroom: normalized.dataroom,
            ring_capacity_log2: normalized.ring_capacity_log2,
            role: config.role,
        };

        let (conn, bridge) = match config.scheduling {
            Scheduling::HostDriven => {
                let registry = match poll.registry().try_clone() {
                    Ok(registry) => registry,
                    Err(err) => {
                        rollback_socket(&mut *driver, socket);
                        return Err(err.into());
                    }
                };
                let mut bridge = EventBridge::new(registry);
                match driver.create_connection(socket, &args, Some(&mut bridge)) {
                    Ok(conn) => (conn, Some(bridge)),
                    Err(err) => {
                        bridge.clear();
                        rollback_socket(&mut *driver, socket);
                        return Err(err.into());
                    }
                }
            }
            Scheduling::Background => match driver.create_connection(socket, &args, None) {
                Ok(conn) => (conn, None),
                Err(err) => {
                    rollback_socket(&mut *driver, socket);
                    return Err(err.into());
                }
            },
        };

        let shared = Arc::new(Shared {
            conn,
            counters: Counters::new(),
            tracker: StateTracker::new(),
            running: AtomicBool::new(true),
        });
        let driver = Arc::new(Mutex::new(driver));

        let (consumer, worker) = if config.scheduling == Scheduling::Background {
            match Self::start_worker(&driver, &shared, &poll, &config) {
                Ok(parts) => parts,
                Err(err) => {
                    let mut guard = driver.lock();
                    if let Err(e) = guard.delete_connection(conn) {
                        tracing::warn!("rollback connection delete failed: {e}");
                    }
                    rollback_socket(&mut **guard, socket);
                    return Err(err);
                }
            }
        } else {
            (None, None)
        };

        tracing::debug!(
            path = %config.socket_path.display(),
            id = config.interface_id,
            "endpoint open"
        );

        Ok(Self {
            driver,
            shared,
            handlers,
            poll,
            events: mio::Events::with_capacity(128),
            bridge,
            consumer,
            worker,
            rx: RxPipeline::new(config.fragments),
            tx: TxPipeline::new(normalized.dataroom),
            socket,
            runtime: Some(runtime),
            notified_up: false,
            closed: false,
        })
    }

    fn start_worker(
        driver: &Arc<Mutex<Box<dyn Driver>>>,
        shared: &Arc<Shared>,
        poll: &mio::Poll,
        config: &Config,
    ) -> Result<(Option<Consumer>, Option<JoinHandle<()>>), Error> {
        let (producer, consumer) = channel::bridge(config.rx_queue_depth)?;
        let bell_fd = consumer.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&bell_fd), DOORBELL, mio::Interest::READABLE)?;

        let worker = std::thread::Builder::new()
            .name("memlink-poll".to_string())
            .spawn({
                let driver = Arc::clone(driver);
                let shared = Arc::clone(shared);
                let rx = RxPipeline::new(config.fragments);
                let poll_interval = config.poll_interval;
                move || worker::run(driver, shared, producer, rx, poll_interval)
            })?;

        Ok((Some(consumer), Some(worker)))
    }

    /// A cloneable handle for transmitting and reading counters from
    /// inside callbacks or from other owners on the consumer thread.
    #[must_use]
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            driver: Arc::clone(&self.driver),
            shared: Arc::clone(&self.shared),
            tx: self.tx,
        }
    }

    /// Transmit one frame, fire-and-forget. Outcomes are observable only
    /// through [`Endpoint::counters`].
    pub fn send(&self, frame: &[u8]) {
        self.handle().send(frame);
    }

    /// Whether the link is currently up.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.tracker.is_connected()
    }

    /// Point-in-time counter snapshot.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    /// Run one iteration of the consumer loop, waiting up to `timeout`
    /// for readiness (`None` waits indefinitely). Fires user callbacks on
    /// this thread. A no-op after `close()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the host poller fails.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }

        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        // Host-driven model: feed readiness into the driver. Tokens are
        // resolved per event so that a forget issued mid-batch suppresses
        // the rest of the batch for that descriptor.
        let mut link_events: Vec<LinkEvent> = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token == DOORBELL {
                continue;
            }
            let Some(bridge) = self.bridge.as_mut() else {
                continue;
            };
            let Some(fd) = bridge.fd_for(token) else {
                continue;
            };
            let readiness = EventBridge::translate(event);
            if readiness.is_empty() {
                continue;
            }
            let mut guard = self.driver.lock();
            if let Err(err) = guard.handle_fd_event(fd, readiness, bridge, &mut link_events) {
                tracing::warn!(fd, "driver dispatch failed: {err}");
            }
        }

        if !link_events.is_empty() {
            // Buffer under the driver lock, dispatch after releasing it:
            // callbacks may re-enter send(), which takes the same lock.
            let mut deliveries: Vec<Delivery> = Vec::new();
            {
                let mut guard = self.driver.lock();
                for event in link_events.drain(..) {
                    worker::process_link_event(
                        &mut **guard,
                        event,
                        &self.shared,
                        &mut self.rx,
                        &mut |delivery| {
                            deliveries.push(delivery);
                            true
                        },
                    );
                }
            }
            for delivery in deliveries {
                match delivery {
                    Delivery::Packet(packet) => {
                        (self.handlers.on_receive)(&packet.bytes, packet.more);
                    }
                    Delivery::State(up) => {
                        if self.notified_up != up {
                            self.notified_up = up;
                            (self.handlers.on_state)(up);
                        }
                    }
                }
            }
        }

        // Background model: drain whatever crossed the thread bridge.
        if let Some(consumer) = &self.consumer {
            consumer.acknowledge();

            let mut packets = Vec::new();
            consumer.take_packets(&mut packets);
            for packet in packets {
                (self.handlers.on_receive)(&packet.bytes, packet.more);
            }

            let mut states = Vec::new();
            consumer.take_states(&mut states);
            for up in states {
                if self.notified_up != up {
                    self.notified_up = up;
                    (self.handlers.on_state)(up);
                }
            }
        }

        Ok(())
    }

    /// Tear the endpoint down. Idempotent; callable from the consumer
    /// thread under either scheduling model; never blocks longer than it
    /// takes the poll thread to notice the stop flag. After this returns,
    /// no user callback fires again.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.running.store(false, Ordering::Release);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("poll thread panicked during teardown");
            }
        }

        // Final synthesized down if the caller still believes the link is
        // up. Queued-but-undelivered notifications are superseded by it.
        if self.notified_up {
            self.notified_up = false;
            (self.handlers.on_state)(false);
        }
        self.shared.tracker.transition(false);

        // Release cross-thread channel resources.
        self.consumer = None;

        // Stop watching the driver's descriptors before the driver closes
        // them.
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.clear();
        }

        {
            let mut guard = self.driver.lock();
            if let Err(err) = guard.delete_connection(self.shared.conn) {
                tracing::warn!("connection delete failed: {err}");
            }
            if let Err(err) = guard.delete_socket(self.socket) {
                tracing::warn!("socket delete failed: {err}");
            }
        }

        if let Some(runtime) = self.runtime.take() {
            if runtime.is_last() {
                tracing::debug!("last endpoint closed, releasing process-wide state");
            }
            drop(runtime);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable transmit/inspection handle, detached from the consumer loop.
#[derive(Clone)]
pub struct EndpointHandle {
    driver: Arc<Mutex<Box<dyn Driver>>>,
    shared: Arc<Shared>,
    tx: TxPipeline,
}

impl EndpointHandle {
    /// Transmit one frame, fire-and-forget.
    ///
    /// Disconnected links and empty frames are counted as drops without
    /// touching the native path.
    pub fn send(&self, frame: &[u8]) {
        if !self.shared.running.load(Ordering::Acquire)
            || !self.shared.tracker.is_connected()
            || frame.is_empty()
        {
            self.shared.counters.inc_tx_dropped();
            return;
        }
        let mut guard = self.driver.lock();
        self.tx
            .send(&mut **guard, self.shared.conn, 0, frame, &self.shared.counters);
    }

    /// Whether the link is currently up.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.tracker.is_connected()
    }

    /// Point-in-time counter snapshot.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }
}

fn rollback_socket(driver: &mut dyn Driver, socket: SocketHandle) {
    if let Err(err) = driver.delete_socket(socket) {
        tracing::warn!("rollback socket delete failed: {err}");
    }
}
