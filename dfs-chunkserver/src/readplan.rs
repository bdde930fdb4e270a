//! Wave-based read-plan executor (§4.5): a client wanting a block from an
//! EC or XOR chunk fans requests out to several sources at once in waves,
//! reconstructing from whichever wave answers first, instead of waiting on
//! one fixed source.

use std::collections::HashMap;

use dfs_proto::types::ServerId;

use crate::replicator::SliceRecoveryPlanner;

/// Per-source progress within one read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    SendingRequest,
    ReceivingHeader,
    ReceivingReadData,
    ReceivingDataBlock,
    ReceivingReadStatus,
    Finished,
}

/// Counters published by the executor for observability (§4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadPlanCounters {
    pub total_executions: u64,
    pub needed_wave1_plus: u64,
    pub rescued_by_later_wave: u64,
}

struct SourceProgress {
    part: u8,
    state: SourceState,
    wave: u32,
    data: Option<Vec<u8>>,
}

/// Drives one multi-source read to completion across waves.
pub struct ReadPlanExecutor {
    planner: SliceRecoveryPlanner,
    missing_part: u8,
    sources: HashMap<ServerId, SourceProgress>,
    current_wave: u32,
    counters: ReadPlanCounters,
}

impl ReadPlanExecutor {
    pub fn new(planner: SliceRecoveryPlanner, missing_part: u8) -> Self {
        ReadPlanExecutor {
            planner,
            missing_part,
            sources: HashMap::new(),
            current_wave: 0,
            counters: ReadPlanCounters::default(),
        }
    }

    pub fn counters(&self) -> ReadPlanCounters {
        self.counters
    }

    /// Starts wave 1 by marking `first_wave` sources as dispatched.
    pub fn start(&mut self, first_wave: &[(ServerId, u8)]) {
        self.current_wave = 1;
        self.counters.total_executions += 1;
        for &(server, part) in first_wave {
            self.sources.insert(server, SourceProgress { part, state: SourceState::SendingRequest, wave: 1, data: None });
        }
    }

    /// Adds another wave of sources - called when an earlier wave has
    /// stalled past its per-wave timeout.
    pub fn add_wave(&mut self, sources: &[(ServerId, u8)]) {
        self.current_wave += 1;
        self.counters.needed_wave1_plus += 1;
        for &(server, part) in sources {
            self.sources
                .entry(server)
                .or_insert(SourceProgress { part, state: SourceState::SendingRequest, wave: self.current_wave, data: None });
        }
    }

    pub fn on_header_received(&mut self, server: ServerId) {
        if let Some(p) = self.sources.get_mut(&server) {
            p.state = SourceState::ReceivingHeader;
        }
    }

    pub fn on_data_block(&mut self, server: ServerId, data: Vec<u8>) {
        if let Some(p) = self.sources.get_mut(&server) {
            p.data = Some(data);
            p.state = SourceState::Finished;
            if p.wave > 1 {
                self.counters.rescued_by_later_wave += 1;
            }
        }
    }

    pub fn on_status_only(&mut self, server: ServerId) {
        if let Some(p) = self.sources.get_mut(&server) {
            p.state = SourceState::ReceivingReadStatus;
        }
    }

    /// The `(part, data)` pairs of every source that has finished so far -
    /// the raw material a caller reconstructs from, whether through this
    /// executor's own planner or an external one (e.g. a bandwidth-limited
    /// [`crate::replicator::Replicator`] wrapping an equivalent planner).
    pub fn finished(&self) -> Vec<(u8, Vec<u8>)> {
        self.sources
            .values()
            .filter(|p| p.state == SourceState::Finished)
            .filter_map(|p| p.data.clone().map(|d| (p.part, d)))
            .collect()
    }

    /// True once enough sources have finished to reconstruct the
    /// requested part.
    pub fn ready(&self) -> bool {
        let finished = self.finished();
        let have: Vec<u8> = finished.iter().map(|(p, _)| *p).collect();
        self.planner.sources_needed(&have, self.missing_part).is_ok()
    }

    /// Reconstructs the requested block from whatever has finished so far.
    /// Call only after `ready()` returns true.
    pub fn finish(&self) -> Option<Vec<u8>> {
        self.planner.reconstruct_block(self.missing_part, &self.finished()).ok()
    }
}
