//! The `Chunk` and `ChunkPart` entities (data model §3).

use dfs_proto::types::{ChunkId, ChunkPartType, LockId, ServerId, Version};

use crate::goal::{Availability, ChunkCopiesCalculator, Goal, PartView};

/// `Td*` means "to delete": the chunkserver flagged the disk holding this
/// part as retiring. `Busy`/`TdBusy` must never be observed by the
/// placement loop; they gate mutation while a master<->chunkserver op is in
/// flight for this part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Invalid,
    Del,
    Busy,
    Valid,
    TdBusy,
    TdValid,
}

impl PartState {
    pub fn is_busy(self) -> bool {
        matches!(self, PartState::Busy | PartState::TdBusy)
    }

    pub fn is_valid(self) -> bool {
        matches!(self, PartState::Valid | PartState::TdValid)
    }

    pub fn is_todel(self) -> bool {
        matches!(self, PartState::TdBusy | PartState::TdValid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPart {
    pub server_id: ServerId,
    pub part_type: ChunkPartType,
    pub version: Version,
    pub state: PartState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    None,
    Create,
    SetVersion,
    Duplicate,
    Truncate,
    DupTrunc,
}

/// Cached availability summary, recomputed after every mutation (§4.1
/// invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvailabilitySummary {
    pub missing_count: u32,
    pub redundant_count: u32,
    pub full_copies: u32,
    is_safe: bool,
    is_lost: bool,
}

impl AvailabilitySummary {
    pub fn state(&self) -> Availability {
        if self.is_lost {
            Availability::Lost
        } else if self.is_safe {
            Availability::Safe
        } else {
            Availability::Endangered
        }
    }
}

pub struct Chunk {
    pub id: ChunkId,
    pub version: Version,
    pub lockid: LockId,
    /// Absolute unix timestamp (seconds) until which the chunk is locked.
    pub lockedto: u32,
    /// Per-file-goal multiset: how many open files reference this chunk
    /// under each goal name (I5 — availability uses the merge of these).
    pub goal_counters: Vec<(String, u32)>,
    pub parts: Vec<ChunkPart>,
    pub availability: AvailabilitySummary,
    pub operation: Operation,
    pub interrupted: bool,
    pub needs_version_increase: bool,
    pub in_endangered_queue: bool,
}

impl Chunk {
    pub fn new(id: ChunkId) -> Self {
        Chunk {
            id,
            version: 1,
            lockid: 0,
            lockedto: 0,
            goal_counters: Vec::new(),
            parts: Vec::new(),
            availability: AvailabilitySummary::default(),
            operation: Operation::None,
            interrupted: false,
            needs_version_increase: false,
            in_endangered_queue: false,
        }
    }

    pub fn file_count(&self) -> u32 {
        self.goal_counters.iter().map(|(_, c)| c).sum()
    }

    pub fn is_locked(&self, now: u32) -> bool {
        self.lockid != 0 && self.lockedto > now
    }

    pub fn has_busy_part(&self) -> bool {
        self.parts.iter().any(|p| p.state.is_busy())
    }

    /// Recomputes [`Chunk::availability`] from valid parts against `goal`
    /// (already merged across `goal_counters`, invariant I5). `label_of`
    /// resolves a part's server to its placement label.
    pub fn recompute_availability(&mut self, goal: &Goal, label_of: impl Fn(ServerId) -> String) {
        let labels: Vec<String> = self
            .parts
            .iter()
            .filter(|p| p.state.is_valid())
            .map(|p| label_of(p.server_id))
            .collect();
        let views: Vec<PartView> = self
            .parts
            .iter()
            .filter(|p| p.state.is_valid())
            .zip(labels.iter())
            .map(|(p, label)| PartView {
                slice: p.part_type.slice,
                part: p.part_type.part,
                label,
            })
            .collect();
        let summary = ChunkCopiesCalculator::compute(goal, &views);
        self.availability = AvailabilitySummary {
            missing_count: summary.missing_count,
            redundant_count: summary.redundant_count,
            full_copies: summary.full_copies,
            is_safe: summary.state_is_safe,
            is_lost: summary.state_is_lost,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_proto::types::SliceType;

    #[test]
    fn file_count_sums_goal_counters() {
        let mut c = Chunk::new(1);
        c.goal_counters.push(("a".into(), 2));
        c.goal_counters.push(("b".into(), 3));
        assert_eq!(c.file_count(), 5);
    }

    #[test]
    fn recompute_availability_reflects_valid_parts_only() {
        let mut c = Chunk::new(1);
        c.parts.push(ChunkPart {
            server_id: 1,
            part_type: ChunkPartType::standard(),
            version: 1,
            state: PartState::Valid,
        });
        c.parts.push(ChunkPart {
            server_id: 2,
            part_type: ChunkPartType::standard(),
            version: 1,
            state: PartState::Busy,
        });
        let goal = Goal::standard("2x", 2);
        c.recompute_availability(&goal, |_| "any".to_string());
        assert_eq!(c.availability.full_copies, 1);
        assert_eq!(c.availability.state(), Availability::Endangered);
    }
}
