//! Per-peer sequence-numbered outbox and ack processing for inter-kernel
//! links (§4.G).
//!
//! The transport that actually moves bytes between kernels is an external
//! collaborator, mirrored on `RemoteTransport` the same way `PlatformServices`
//! abstracts vat worker transport — this module owns only the sequencing and
//! persistence discipline around it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::KernelResult;
use crate::ids::EndpointId;
use crate::store::{KernelStore, RemoteInfo};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transmit to peer failed: {0}")]
    SendFailed(String),
}

/// What actually moves a framed message to a peer; a real implementation is
/// a socket or other byte stream, supplied by the embedder.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn transmit(&self, rid: EndpointId, seq: u64, message: &[u8]) -> Result<(), RemoteError>;
}

/// Per-peer link state, backed by the `remote.*`/`remoteSeq.*`/
/// `remotePending.*` key families (§6.3). One `RemoteLink` per registered
/// peer; `RemoteLink`s share the kernel store but own no in-memory sequence
/// state of their own, so a restart just re-derives everything from disk.
pub struct RemoteLink {
    store: Arc<KernelStore>,
    transport: Arc<dyn RemoteTransport>,
    rid: EndpointId,
}

const NEXT_SEND_SEQ: &str = "nextSendSeq";
const HIGHEST_RECEIVED_SEQ: &str = "highestReceivedSeq";
const START_SEQ: &str = "startSeq";

impl RemoteLink {
    /// Registers a new peer, or re-opens the link to one already registered
    /// (`info` is written unconditionally — callers that only want to
    /// re-open an existing link should look it up with
    /// `KernelStore::get_remote_info` first).
    pub fn register(
        store: Arc<KernelStore>,
        transport: Arc<dyn RemoteTransport>,
        rid: EndpointId,
        info: RemoteInfo,
    ) -> KernelResult<Self> {
        store.put_remote_info(rid, &info)?;
        Ok(Self { store, transport, rid })
    }

    pub fn peer_info(&self) -> KernelResult<Option<RemoteInfo>> {
        self.store.get_remote_info(self.rid)
    }

    /// Assigns the next outbound sequence number, persists the message to
    /// the outbox, then transmits it. The outbox write happens before the
    /// transmit attempt so a crash between the two still finds the message
    /// on `recover`.
    pub async fn send(&self, message: &[u8]) -> KernelResult<u64> {
        let seq = self.store.remote_seq_get(self.rid, NEXT_SEND_SEQ)?;
        self.store.remote_pending_put(self.rid, seq, message)?;
        self.store.remote_seq_put(self.rid, NEXT_SEND_SEQ, seq + 1)?;
        self.transport
            .transmit(self.rid, seq, message)
            .await
            .map_err(|e| crate::error::KernelError::SyscallFailed(e.to_string()))?;
        Ok(seq)
    }

    /// Processes an ack for every sequence number strictly below
    /// `acked_seq`: deletes its outbox row and bumps `startSeq` past it.
    pub fn ack(&self, acked_seq: u64) -> KernelResult<()> {
        for (seq, _) in self.store.remote_pending_iter(self.rid)? {
            if seq < acked_seq {
                self.store.remote_pending_delete(self.rid, seq)?;
            }
        }
        self.store.remote_seq_put(self.rid, START_SEQ, acked_seq)?;
        Ok(())
    }

    /// Records an inbound message's sequence number as the new high-water
    /// mark; callers decide separately whether to actually accept the
    /// payload (e.g. reject `seq <= highestReceivedSeq` as a duplicate).
    pub fn receive(&self, seq: u64) -> KernelResult<()> {
        let highest = self.store.remote_seq_get_opt(self.rid, HIGHEST_RECEIVED_SEQ)?;
        if highest.map(|h| seq > h).unwrap_or(true) {
            self.store.remote_seq_put(self.rid, HIGHEST_RECEIVED_SEQ, seq)?;
        }
        Ok(())
    }

    pub fn highest_received_seq(&self) -> KernelResult<Option<u64>> {
        self.store.remote_seq_get_opt(self.rid, HIGHEST_RECEIVED_SEQ)
    }

    /// Recovery after restart (§4.G): sweeps orphaned outbox rows left by a
    /// crash mid-ack (`seq < startSeq`, never cleaned up because the ack
    /// that should have deleted them never completed) and retransmits
    /// everything still pending, in ascending sequence order.
    pub async fn recover(&self) -> KernelResult<()> {
        let start_seq = self.store.remote_seq_get(self.rid, START_SEQ)?;
        let mut pending = self.store.remote_pending_iter(self.rid)?;
        pending.sort_by_key(|(seq, _)| *seq);

        for (seq, _) in &pending {
            if *seq < start_seq {
                self.store.remote_pending_delete(self.rid, *seq)?;
            }
        }

        for (seq, message) in pending {
            if seq >= start_seq {
                self.transport
                    .transmit(self.rid, seq, &message)
                    .await
                    .map_err(|e| crate::error::KernelError::SyscallFailed(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl RemoteTransport for RecordingTransport {
        async fn transmit(&self, _rid: EndpointId, seq: u64, message: &[u8]) -> Result<(), RemoteError> {
            self.sent.lock().unwrap().push((seq, message.to_vec()));
            Ok(())
        }
    }

    fn link(transport: Arc<RecordingTransport>) -> RemoteLink {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        RemoteLink::register(store, transport, EndpointId::remote(1), RemoteInfo { label: "peer".into() }).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_assigns_increasing_sequence_numbers() {
        let transport = Arc::new(RecordingTransport::new());
        let link = link(transport.clone());
        assert_eq!(link.send(b"a").await.unwrap(), 0);
        assert_eq!(link.send(b"b").await.unwrap(), 1);
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ack_clears_outbox_below_acked_seq() {
        let transport = Arc::new(RecordingTransport::new());
        let link = link(transport);
        link.send(b"a").await.unwrap();
        link.send(b"b").await.unwrap();
        link.send(b"c").await.unwrap();

        link.ack(2).unwrap();
        let remaining: Vec<u64> = link.store.remote_pending_iter(link.rid).unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(remaining, vec![2]);
    }

    #[test]
    fn receive_tracks_only_the_high_water_mark() {
        let transport = Arc::new(RecordingTransport::new());
        let link = link(transport);
        assert_eq!(link.highest_received_seq().unwrap(), None);
        link.receive(5).unwrap();
        assert_eq!(link.highest_received_seq().unwrap(), Some(5));
        link.receive(2).unwrap();
        assert_eq!(link.highest_received_seq().unwrap(), Some(5));
        link.receive(9).unwrap();
        assert_eq!(link.highest_received_seq().unwrap(), Some(9));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recover_sweeps_orphans_and_retransmits_the_rest() {
        let transport = Arc::new(RecordingTransport::new());
        let link = link(transport.clone());
        link.send(b"a").await.unwrap();
        link.send(b"b").await.unwrap();
        link.send(b"c").await.unwrap();
        // Simulate a crash mid-ack: startSeq advanced past seq 0 but its
        // outbox row was never deleted.
        link.store.remote_seq_put(link.rid, START_SEQ, 1).unwrap();
        transport.sent.lock().unwrap().clear();

        link.recover().await.unwrap();

        assert!(link.store.remote_pending_iter(link.rid).unwrap().iter().all(|(s, _)| *s != 0));
        let retransmitted: Vec<u64> = transport.sent.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(retransmitted, vec![1, 2]);
    }
}
