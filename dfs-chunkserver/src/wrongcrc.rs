//! Wrong-CRC notifier: a background task that batches up chunk parts found
//! to have a bad checksum during normal reads or a scrub pass, and flushes
//! them to the master periodically rather than on every single detection.

use std::collections::HashSet;
use std::time::Duration;

use dfs_proto::types::{ChunkId, ChunkPartType};
use tokio::sync::mpsc;
use tokio::time::interval;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WrongCrcReport {
    pub chunk_id: ChunkId,
    pub part: ChunkPartType,
}

/// Accumulates distinct bad-CRC reports between flushes, so a part that's
/// re-read many times before the next flush is only reported once.
pub struct WrongCrcBatch {
    pending: HashSet<WrongCrcReport>,
}

impl WrongCrcBatch {
    pub fn new() -> Self {
        WrongCrcBatch { pending: HashSet::new() }
    }

    pub fn record(&mut self, chunk_id: ChunkId, part: ChunkPartType) {
        self.pending.insert(WrongCrcReport { chunk_id, part });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn drain(&mut self) -> Vec<WrongCrcReport> {
        self.pending.drain().collect()
    }
}

impl Default for WrongCrcBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs until `shutdown` is dropped/closed, flushing accumulated reports to
/// `send` every `period`. Reports recorded between ticks are coalesced by
/// `WrongCrcBatch`, which already dedupes repeats.
pub async fn run(
    mut batch_rx: mpsc::Receiver<(ChunkId, ChunkPartType)>,
    send: impl Fn(Vec<WrongCrcReport>) + Send + 'static,
    period: Duration,
) {
    let mut batch = WrongCrcBatch::new();
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            report = batch_rx.recv() => {
                match report {
                    Some((id, part)) => batch.record(id, part),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    send(batch.drain());
                }
            }
        }
    }
    if !batch.is_empty() {
        send(batch.drain());
    }
}
