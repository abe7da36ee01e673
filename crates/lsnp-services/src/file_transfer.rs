//! File-transfer sessions — chunking on the way out, assembly on the way in.
//!
//! Each transfer is a two-party state machine keyed by `transfer_id`:
//! offered → accepted → transferring → completed, with failed/cancelled
//! exits. The sender's reliability comes from the transport's per-chunk
//! ACK/retry lane; this module only accounts for which indices are done.
//! Chunks may arrive out of order and each index reaches the application
//! at most once.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;

use lsnp_core::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Offered,
    Accepted,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

/// Number of chunks a blob splits into. A zero-byte file still ships one
/// (empty) chunk so the receiver has something to complete on.
pub fn chunk_count(size: usize, chunk_size: usize) -> u32 {
    if size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size) as u32
}

// ── Sender side ───────────────────────────────────────────────────────────────

/// An outbound transfer. Owned by the single task pumping its chunks;
/// the table below never holds these.
#[derive(Debug)]
pub struct OutgoingTransfer {
    pub transfer_id: String,
    pub peer: UserId,
    pub filename: String,
    pub data: Bytes,
    pub chunk_size: usize,
    pub chunk_count: u32,
    pub acked: HashSet<u32>,
    pub state: TransferState,
    pub offered_at: Instant,
}

impl OutgoingTransfer {
    pub fn new(
        transfer_id: String,
        peer: UserId,
        filename: String,
        data: Bytes,
        chunk_size: usize,
    ) -> Self {
        let chunk_count = chunk_count(data.len(), chunk_size);
        Self {
            transfer_id,
            peer,
            filename,
            data,
            chunk_size,
            chunk_count,
            acked: HashSet::new(),
            state: TransferState::Offered,
            offered_at: Instant::now(),
        }
    }

    /// The bytes for one chunk index. Zero-copy slice of the blob.
    pub fn chunk(&self, index: u32) -> Result<Bytes, TransferError> {
        if index >= self.chunk_count {
            return Err(TransferError::IndexOutOfRange {
                index,
                count: self.chunk_count,
            });
        }
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    /// Record an acked index. Returns true once every index is acked.
    pub fn mark_acked(&mut self, index: u32) -> bool {
        self.acked.insert(index);
        self.all_acked()
    }

    pub fn all_acked(&self) -> bool {
        self.acked.len() as u32 == self.chunk_count
    }
}

// ── Receiver side ─────────────────────────────────────────────────────────────

/// An inbound transfer: the offer, then chunks assembled by index.
#[derive(Debug)]
pub struct IncomingTransfer {
    pub transfer_id: String,
    pub peer: UserId,
    pub filename: String,
    pub size: u64,
    pub chunk_size: usize,
    pub chunk_count: u32,
    pub state: TransferState,
    chunks: HashMap<u32, Bytes>,
}

impl IncomingTransfer {
    pub fn from_offer(
        transfer_id: String,
        peer: UserId,
        filename: String,
        size: u64,
        chunk_size: usize,
        chunk_count: u32,
    ) -> Self {
        Self {
            transfer_id,
            peer,
            filename,
            size,
            chunk_size,
            chunk_count,
            state: TransferState::Offered,
            chunks: HashMap::new(),
        }
    }

    /// Store one chunk. Out-of-order is fine; a repeated index is dropped
    /// (the wire may duplicate, the application must not see it twice).
    /// Returns true once all indices are present.
    pub fn insert_chunk(&mut self, index: u32, data: Bytes) -> Result<bool, TransferError> {
        if !matches!(
            self.state,
            TransferState::Accepted | TransferState::Transferring
        ) {
            return Err(TransferError::NotAccepted);
        }
        if index >= self.chunk_count {
            return Err(TransferError::IndexOutOfRange {
                index,
                count: self.chunk_count,
            });
        }
        self.state = TransferState::Transferring;
        self.chunks.entry(index).or_insert(data);
        Ok(self.chunks.len() as u32 == self.chunk_count)
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Concatenate chunks in index order and verify the advertised size.
    pub fn assemble(&self) -> Result<Bytes, TransferError> {
        let mut out = Vec::with_capacity(self.size as usize);
        for index in 0..self.chunk_count {
            let chunk = self
                .chunks
                .get(&index)
                .ok_or(TransferError::MissingChunk(index))?;
            out.extend_from_slice(chunk);
        }
        if out.len() as u64 != self.size {
            return Err(TransferError::SizeMismatch {
                expected: self.size,
                actual: out.len() as u64,
            });
        }
        Ok(Bytes::from(out))
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// Inbound transfers by id. Each entry is mutated only from the dispatch
/// task; the map exists so concurrent transfers stay independent.
#[derive(Default)]
pub struct IncomingTable {
    transfers: DashMap<String, IncomingTransfer>,
}

impl IncomingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transfer: IncomingTransfer) {
        self.transfers.insert(transfer.transfer_id.clone(), transfer);
    }

    /// Flip an offered transfer to accepted. None if unknown or not offered.
    pub fn accept(&self, transfer_id: &str) -> Option<(UserId, String)> {
        let mut transfer = self.transfers.get_mut(transfer_id)?;
        if transfer.state != TransferState::Offered {
            return None;
        }
        transfer.state = TransferState::Accepted;
        Some((transfer.peer.clone(), transfer.filename.clone()))
    }

    /// Drop an offered transfer. Returns the offering peer for the REJECT.
    pub fn reject(&self, transfer_id: &str) -> Option<UserId> {
        let (_, transfer) = self.transfers.remove(transfer_id)?;
        (transfer.state == TransferState::Offered).then_some(transfer.peer)
    }

    /// Store a chunk; when the set completes, assemble and remove the entry.
    pub fn insert_chunk(
        &self,
        transfer_id: &str,
        index: u32,
        data: Bytes,
    ) -> Result<Option<(IncomingTransfer, Bytes)>, TransferError> {
        let complete = {
            let mut transfer = self
                .transfers
                .get_mut(transfer_id)
                .ok_or(TransferError::UnknownTransfer)?;
            transfer.insert_chunk(index, data)?
        };
        if !complete {
            return Ok(None);
        }
        let (_, mut transfer) = self
            .transfers
            .remove(transfer_id)
            .ok_or(TransferError::UnknownTransfer)?;
        let blob = transfer.assemble()?;
        transfer.state = TransferState::Completed;
        Ok(Some((transfer, blob)))
    }

    /// Remove a transfer on CANCEL or failure. Returns it for UI reporting.
    pub fn cancel(&self, transfer_id: &str) -> Option<IncomingTransfer> {
        self.transfers.remove(transfer_id).map(|(_, mut t)| {
            t.state = TransferState::Cancelled;
            tracing::debug!(
                transfer_id,
                received = t.received(),
                of = t.chunk_count,
                "incoming transfer cancelled"
            );
            t
        })
    }

    pub fn get_state(&self, transfer_id: &str) -> Option<TransferState> {
        self.transfers.get(transfer_id).map(|t| t.state)
    }

    pub fn progress(&self, transfer_id: &str) -> Option<(u32, u32)> {
        self.transfers
            .get(transfer_id)
            .map(|t| (t.received(), t.chunk_count))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("no such transfer")]
    UnknownTransfer,

    #[error("chunk index {index} out of range (count {count})")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("transfer not accepted")]
    NotAccepted,

    #[error("missing chunk {0} at assembly")]
    MissingChunk(u32),

    #[error("assembled {actual} bytes, offer said {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> UserId {
        "bob@192.168.1.11".parse().unwrap()
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(3500, 1024), 4);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(0, 1024), 1);
    }

    #[test]
    fn outgoing_chunks_tile_the_blob() {
        let data: Vec<u8> = (0..3500u16).map(|i| (i % 251) as u8).collect();
        let out = OutgoingTransfer::new(
            "t1".into(),
            peer(),
            "blob.bin".into(),
            Bytes::from(data.clone()),
            1024,
        );
        assert_eq!(out.chunk_count, 4);
        assert_eq!(out.chunk(0).unwrap().len(), 1024);
        assert_eq!(out.chunk(3).unwrap().len(), 3500 - 3 * 1024);
        assert!(out.chunk(4).is_err());

        let rejoined: Vec<u8> = (0..4)
            .flat_map(|i| out.chunk(i).unwrap().to_vec())
            .collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn acks_complete_the_sender() {
        let mut out = OutgoingTransfer::new(
            "t1".into(),
            peer(),
            "blob.bin".into(),
            Bytes::from(vec![0u8; 2048]),
            1024,
        );
        assert!(!out.mark_acked(1));
        // Duplicate ack changes nothing.
        assert!(!out.mark_acked(1));
        assert!(out.mark_acked(0));
        assert!(out.all_acked());
    }

    #[test]
    fn incoming_assembles_out_of_order() {
        let data: Vec<u8> = (0..3500u16).map(|i| (i % 251) as u8).collect();
        let table = IncomingTable::new();
        table.insert(IncomingTransfer::from_offer(
            "t1".into(),
            peer(),
            "blob.bin".into(),
            3500,
            1024,
            4,
        ));
        assert!(table.accept("t1").is_some());

        let chunk = |i: usize| {
            let start = i * 1024;
            Bytes::copy_from_slice(&data[start..(start + 1024).min(data.len())])
        };

        // Arrival order 2, 0, 3, 1 — and chunk 2 arrives twice.
        assert!(table.insert_chunk("t1", 2, chunk(2)).unwrap().is_none());
        assert!(table.insert_chunk("t1", 0, chunk(0)).unwrap().is_none());
        assert!(table
            .insert_chunk("t1", 2, Bytes::from_static(b"garbage"))
            .unwrap()
            .is_none());
        assert!(table.insert_chunk("t1", 3, chunk(3)).unwrap().is_none());

        let (transfer, blob) = table.insert_chunk("t1", 1, chunk(1)).unwrap().unwrap();
        assert_eq!(transfer.state, TransferState::Completed);
        assert_eq!(blob.as_ref(), &data[..]);
        // Entry consumed on completion.
        assert_eq!(
            table.insert_chunk("t1", 1, chunk(1)).unwrap_err(),
            TransferError::UnknownTransfer
        );
    }

    #[test]
    fn chunks_before_accept_are_refused() {
        let table = IncomingTable::new();
        table.insert(IncomingTransfer::from_offer(
            "t1".into(),
            peer(),
            "blob.bin".into(),
            10,
            1024,
            1,
        ));
        assert!(matches!(
            table.insert_chunk("t1", 0, Bytes::from_static(b"0123456789")),
            Err(TransferError::NotAccepted)
        ));
    }

    #[test]
    fn size_mismatch_detected() {
        let table = IncomingTable::new();
        table.insert(IncomingTransfer::from_offer(
            "t1".into(),
            peer(),
            "blob.bin".into(),
            99,
            1024,
            1,
        ));
        table.accept("t1");
        let result = table.insert_chunk("t1", 0, Bytes::from_static(b"short"));
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch {
                expected: 99,
                actual: 5
            })
        ));
    }

    #[test]
    fn reject_only_works_on_offers() {
        let table = IncomingTable::new();
        table.insert(IncomingTransfer::from_offer(
            "t1".into(),
            peer(),
            "blob.bin".into(),
            10,
            1024,
            1,
        ));
        table.accept("t1");
        assert!(table.reject("t1").is_none());
    }
}
