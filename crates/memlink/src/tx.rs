//! Transmit pipeline.
//!
//! Chunks one outbound frame across descriptors sized to the negotiated
//! dataroom and submits them as a single burst. Transmission is
//! all-or-nothing: an allocation shortfall returns the staged descriptors
//! and submits none of them. Every failure mode is counted, never
//! surfaced.

use memlink_driver::{ConnHandle, Driver};

use crate::counters::Counters;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TxPipeline {
    dataroom: u16,
}

impl TxPipeline {
    pub(crate) fn new(dataroom: u16) -> Self {
        Self { dataroom }
    }

    /// Transmit `frame`. The caller has already verified the link is up
    /// and the frame is non-empty.
    pub(crate) fn send(
        &self,
        driver: &mut dyn Driver,
        conn: ConnHandle,
        queue: u16,
        frame: &[u8],
        counters: &Counters,
    ) {
        let dataroom = usize::from(self.dataroom);
        let chunks = frame.len().div_ceil(dataroom);
        let Ok(chunks) = u16::try_from(chunks) else {
            // Wider than any ring can hold.
            counters.inc_tx_dropped();
            return;
        };

        let granted = match driver.alloc_tx(conn, queue, chunks) {
            Ok(granted) => granted,
            Err(err) => {
                tracing::debug!("tx alloc failed: {err}");
                counters.inc_tx_dropped();
                return;
            }
        };
        if granted < chunks {
            if let Err(err) = driver.tx_abort(conn, queue) {
                tracing::warn!("tx abort failed: {err}");
            }
            counters.inc_tx_dropped();
            return;
        }

        for (index, chunk) in frame.chunks(dataroom).enumerate() {
            let region = match driver.tx_chunk(conn, queue, index as u16, chunk.len() as u16) {
                Ok(region) => region,
                Err(err) => {
                    tracing::warn!("tx chunk {index} unavailable: {err}");
                    if let Err(err) = driver.tx_abort(conn, queue) {
                        tracing::warn!("tx abort failed: {err}");
                    }
                    counters.inc_tx_dropped();
                    return;
                }
            };
            region.copy_from_slice(chunk);
        }

        match driver.tx_burst(conn, queue, chunks) {
            Ok(sent) if sent == chunks => {
                counters.inc_tx_delivered();
                counters.add_tx_fragments(u64::from(chunks));
            }
            Ok(sent) => {
                tracing::debug!(sent, requested = chunks, "short transmit");
                counters.inc_tx_dropped();
            }
            Err(err) => {
                tracing::debug!("tx burst failed: {err}");
                counters.inc_tx_dropped();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlink_driver::{ConnArgs, Role};
    use memlink_testkit::MockDriver;

    fn setup(dataroom: u16) -> (MockDriver, ConnHandle, TxPipeline, Counters) {
        let mut mock = MockDriver::new();
        let socket = mock
            .create_socket_direct(std::path::Path::new("/tmp/memlink-tx-test.sock"))
            .unwrap();
        let conn = mock
            .create_connection_direct(
                socket,
                &ConnArgs {
                    interface_id: 0,
                    dataroom,
                    ring_capacity_log2: 10,
                    role: Role::Initiator,
                },
            )
            .unwrap();
        (mock, conn, TxPipeline::new(dataroom), Counters::new())
    }

    #[test]
    fn single_chunk_frame_transmits_whole() {
        let (mut mock, conn, tx, counters) = setup(2048);
        tx.send(&mut mock, conn, 0, &[7u8; 100], &counters);

        let sent = mock.transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], vec![7u8; 100]);
        let s = counters.snapshot();
        assert_eq!(s.tx_delivered, 1);
        assert_eq!(s.tx_fragments, 1);
        assert_eq!(s.tx_dropped, 0);
    }

    #[test]
    fn frame_spanning_dataroom_chunks_exactly() {
        let (mut mock, conn, tx, counters) = setup(2048);
        // 2.5 x dataroom => 3 descriptors.
        let frame: Vec<u8> = (0..5120u32).map(|i| i as u8).collect();
        tx.send(&mut mock, conn, 0, &frame, &counters);

        let sent = mock.transmitted();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].len(), 2048);
        assert_eq!(sent[1].len(), 2048);
        assert_eq!(sent[2].len(), 1024);
        let rejoined: Vec<u8> = sent.concat();
        assert_eq!(rejoined, frame);

        let s = counters.snapshot();
        assert_eq!(s.tx_delivered, 1);
        assert_eq!(s.tx_fragments, 3);
    }

    #[test]
    fn allocation_shortfall_aborts_without_submitting() {
        let (mut mock, conn, tx, counters) = setup(2048);
        mock.set_tx_grant_limit(Some(2));
        tx.send(&mut mock, conn, 0, &vec![0u8; 5120], &counters);

        assert!(mock.transmitted().is_empty());
        assert_eq!(mock.tx_abort_calls(), 1);
        let s = counters.snapshot();
        assert_eq!(s.tx_dropped, 1);
        assert_eq!(s.tx_delivered, 0);
        assert_eq!(s.tx_fragments, 0);
    }

    #[test]
    fn short_transmit_counts_one_drop() {
        let (mut mock, conn, tx, counters) = setup(2048);
        mock.set_tx_send_limit(Some(1));
        tx.send(&mut mock, conn, 0, &vec![0u8; 4096], &counters);

        let s = counters.snapshot();
        assert_eq!(s.tx_dropped, 1);
        assert_eq!(s.tx_delivered, 0);
    }
}
