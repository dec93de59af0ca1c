//! Cross-thread bridge between the driver's poll thread and the consumer.
//!
//! Two lanes with different loss policies:
//!
//! - packets ride a bounded queue with non-blocking `try_send`; a full
//!   queue drops the packet (counted by the caller) instead of ever
//!   blocking the poll thread;
//! - state transitions ride an ordered lossless queue, so a terminal
//!   "down" can never be dropped or reordered behind a later "up".
//!
//! Every successful enqueue rings the doorbell the consumer's poller is
//! watching.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::doorbell::{self, DoorbellListener, DoorbellRinger};

/// An owned, already-copied received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub bytes: Vec<u8>,
    /// More fragments of the same logical packet follow.
    pub more: bool,
}

/// Producer half, owned by the background worker.
#[derive(Debug)]
pub(crate) struct Producer {
    packets: Sender<Packet>,
    states: Sender<bool>,
    bell: DoorbellRinger,
}

/// Consumer half, drained by [`Endpoint::poll`](crate::Endpoint::poll).
#[derive(Debug)]
pub(crate) struct Consumer {
    packets: Receiver<Packet>,
    states: Receiver<bool>,
    bell: DoorbellListener,
}

/// Create a connected producer/consumer pair with the given packet-queue
/// depth.
pub(crate) fn bridge(depth: usize) -> io::Result<(Producer, Consumer)> {
    let (packet_tx, packet_rx) = crossbeam_channel::bounded(depth);
    let (state_tx, state_rx) = crossbeam_channel::unbounded();
    let (ringer, listener) = doorbell::pair()?;
    Ok((
        Producer {
            packets: packet_tx,
            states: state_tx,
            bell: ringer,
        },
        Consumer {
            packets: packet_rx,
            states: state_rx,
            bell: listener,
        },
    ))
}

impl Producer {
    /// Offer a packet without blocking. Returns `false` if the queue is
    /// full or the consumer is gone; the caller counts the drop.
    pub(crate) fn offer_packet(&self, packet: Packet) -> bool {
        match self.packets.try_send(packet) {
            Ok(()) => {
                self.bell.ring();
                true
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue a state transition. Ordered and lossless; never blocks
    /// (unbounded lane), and transitions are rare enough that the lane
    /// stays tiny.
    pub(crate) fn push_state(&self, up: bool) {
        if self.states.send(up).is_ok() {
            self.bell.ring();
        }
    }
}

impl Consumer {
    /// Clear the doorbell after a wakeup.
    pub(crate) fn acknowledge(&self) {
        self.bell.drain();
    }

    /// Drain pending packets without blocking.
    pub(crate) fn take_packets(&self, out: &mut Vec<Packet>) {
        while let Ok(p) = self.packets.try_recv() {
            out.push(p);
        }
    }

    /// Drain pending state transitions without blocking, in arrival
    /// order.
    pub(crate) fn take_states(&self, out: &mut Vec<bool>) {
        while let Ok(up) = self.states.try_recv() {
            out.push(up);
        }
    }
}

impl AsRawFd for Consumer {
    fn as_raw_fd(&self) -> RawFd {
        self.bell.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_lane_drops_when_full() {
        let (producer, consumer) = bridge(2).unwrap();

        let p = Packet {
            bytes: vec![1],
            more: false,
        };
        assert!(producer.offer_packet(p.clone()));
        assert!(producer.offer_packet(p.clone()));
        // Queue is full: producer must not block.
        assert!(!producer.offer_packet(p));

        let mut got = Vec::new();
        consumer.take_packets(&mut got);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn state_lane_preserves_order() {
        let (producer, consumer) = bridge(1).unwrap();
        producer.push_state(true);
        producer.push_state(false);
        producer.push_state(true);
        producer.push_state(false);

        let mut got = Vec::new();
        consumer.take_states(&mut got);
        assert_eq!(got, vec![true, false, true, false]);
    }

    #[test]
    fn enqueue_rings_doorbell() {
        let (producer, consumer) = bridge(4).unwrap();
        producer.push_state(true);
        assert!(consumer.bell.drain());
    }
}
