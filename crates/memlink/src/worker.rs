//! Background poll worker and shared link-event handling.
//!
//! In the background scheduling model one dedicated thread loops on the
//! driver's bounded-timeout poll, reacting to link events under the
//! driver lock and handing results across the thread bridge. The same
//! event handling is reused by the host-driven model, where it runs on
//! the consumer thread itself.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use memlink_driver::{ConnHandle, Driver, LinkEvent};

use crate::channel::{Packet, Producer};
use crate::counters::Counters;
use crate::rx::RxPipeline;
use crate::state::StateTracker;

/// State shared between the consumer thread, the background worker, and
/// cloned endpoint handles.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) conn: ConnHandle,
    pub(crate) counters: Counters,
    pub(crate) tracker: StateTracker,
    pub(crate) running: std::sync::atomic::AtomicBool,
}

/// One caller-visible consequence of a link event. Packets and state
/// transitions share a single ordered stream so a down can never overtake
/// the packets received before it.
#[derive(Debug)]
pub(crate) enum Delivery {
    Packet(Packet),
    State(bool),
}

/// React to one control-plane event.
///
/// An up transition is deduplicated and primes the receive ring before
/// anyone is told about it; a down transition is deduplicated; a receive
/// event drains the ring through the fragmentation policy. Consequences
/// are pushed into `sink` in order; the sink reports whether a packet was
/// accepted, and must not call back into the driver (it runs under the
/// driver lock).
pub(crate) fn process_link_event(
    driver: &mut dyn Driver,
    event: LinkEvent,
    shared: &Shared,
    rx: &mut RxPipeline,
    sink: &mut dyn FnMut(Delivery) -> bool,
) {
    match event {
        LinkEvent::Up => {
            if shared.tracker.transition(true) {
                if let Err(err) = driver.refill_all(shared.conn, 0) {
                    tracing::warn!("ring prime on link-up failed: {err}");
                }
                sink(Delivery::State(true));
            }
        }
        LinkEvent::Down => {
            if shared.tracker.transition(false) {
                sink(Delivery::State(false));
            }
        }
        LinkEvent::Receive { queue } => {
            rx.drain(driver, shared.conn, queue, &shared.counters, &mut |packet| {
                sink(Delivery::Packet(packet))
            });
        }
    }
}

/// Body of the dedicated poll thread.
///
/// Holds the driver lock only for one bounded poll iteration at a time,
/// so `send` calls from the consumer thread wait at most one interval.
/// Exits promptly once the running flag clears.
pub(crate) fn run(
    driver: Arc<Mutex<Box<dyn Driver>>>,
    shared: Arc<Shared>,
    producer: Producer,
    mut rx: RxPipeline,
    poll_interval: Duration,
) {
    let mut events: Vec<LinkEvent> = Vec::new();
    while shared.running.load(Ordering::Acquire) {
        let mut guard = driver.lock();
        events.clear();
        if let Err(err) = guard.poll_event(poll_interval, &mut events) {
            drop(guard);
            tracing::warn!("driver poll failed: {err}");
            std::thread::sleep(poll_interval);
            continue;
        }
        for event in events.drain(..) {
            process_link_event(&mut **guard, event, &shared, &mut rx, &mut |delivery| {
                match delivery {
                    Delivery::Packet(packet) => producer.offer_packet(packet),
                    Delivery::State(up) => {
                        producer.push_state(up);
                        true
                    }
                }
            });
        }
    }
    tracing::debug!("poll thread stopping");
}
