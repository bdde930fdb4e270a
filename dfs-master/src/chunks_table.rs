//! The chunk table: the in-memory map from [`ChunkId`] to [`Chunk`], and the
//! mutation/query operations the session layer and worker drive it through
//! (§4.1).

use std::collections::HashMap;

use dfs_proto::types::{ChunkId, ChunkPartType, LockId, ServerId, Version};
use dfs_proto::Status;

use crate::checksum::ChunkTableChecksum;
use crate::chunk::{Chunk, ChunkPart, Operation, PartState};
use crate::chunkserver_db::ChunkServerDb;
use crate::errors::{ChunkError, ChunkResult};
use crate::goal::Goal;

/// What changed by a successful `multi_modify`/`multi_truncate`/`repair`
/// call, for the caller to turn into file-metadata updates and a reply.
#[derive(Debug, Clone, Copy)]
pub struct ModificationResult {
    pub new_chunk_id: ChunkId,
    pub new_version: Version,
}

pub struct ChunkTable {
    chunks: HashMap<ChunkId, Chunk>,
    next_id: ChunkId,
    checksum: ChunkTableChecksum,
    /// Chunk ids whose availability needs recomputing against the current
    /// goal set; invalidated in bulk on a goal definition change (§4.1).
    goal_cache_dirty: bool,
}

impl ChunkTable {
    pub fn new() -> Self {
        ChunkTable {
            chunks: HashMap::new(),
            next_id: 1,
            checksum: ChunkTableChecksum::new(),
            goal_cache_dirty: false,
        }
    }

    pub fn checksum(&self) -> u64 {
        self.checksum.get()
    }

    fn touch(&mut self, chunk: &Chunk) {
        self.checksum.update(chunk.id, chunk.version);
    }

    pub fn get(&self, id: ChunkId) -> ChunkResult<&Chunk> {
        self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)
    }

    pub fn get_mut(&mut self, id: ChunkId) -> ChunkResult<&mut Chunk> {
        self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)
    }

    /// Allocates a brand new, empty, unplaced chunk (the metadata-layer half
    /// of a file's first write; the worker places parts for it later).
    pub fn create(&mut self, goal_name: &str) -> ChunkId {
        let id = self.next_id;
        self.next_id += 1;
        let mut chunk = Chunk::new(id);
        chunk.goal_counters.push((goal_name.to_string(), 1));
        chunk.operation = Operation::Create;
        self.touch(&chunk);
        self.chunks.insert(id, chunk);
        id
    }

    /// Increments the given goal's reference count on an existing chunk
    /// (another file/snapshot now shares it, data model invariant I5).
    pub fn add_goal_reference(&mut self, id: ChunkId, goal_name: &str) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        match chunk.goal_counters.iter_mut().find(|(g, _)| g == goal_name) {
            Some((_, count)) => *count += 1,
            None => chunk.goal_counters.push((goal_name.to_string(), 1)),
        }
        Ok(())
    }

    /// Decrements a goal reference; drops the chunk entirely once its last
    /// reference is gone.
    pub fn remove_goal_reference(&mut self, id: ChunkId, goal_name: &str) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        if let Some(pos) = chunk.goal_counters.iter().position(|(g, _)| g == goal_name) {
            let (_, count) = &mut chunk.goal_counters[pos];
            *count -= 1;
            if *count == 0 {
                chunk.goal_counters.remove(pos);
            }
        }
        if chunk.file_count() == 0 {
            self.chunks.remove(&id);
        }
        Ok(())
    }

    /// Write-open path: a modification of an existing chunk that isn't
    /// exclusively owned by the caller's file must duplicate first (copy on
    /// write). Returns the id to use for subsequent writes, bumping the
    /// version either way.
    pub fn multi_modify(
        &mut self,
        id: ChunkId,
        lockid: LockId,
        now: u32,
        exclusively_owned: bool,
    ) -> ChunkResult<ModificationResult> {
        let chunk = self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)?;
        self.check_lock(chunk, lockid, now)?;
        if chunk.has_busy_part() {
            return Err(ChunkError::NotPossible);
        }

        if exclusively_owned {
            let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
            chunk.version += 1;
            chunk.operation = Operation::SetVersion;
            chunk.needs_version_increase = true;
            let result = ModificationResult { new_chunk_id: id, new_version: chunk.version };
            self.touch_by_id(id);
            Ok(result)
        } else {
            let goal_counters = chunk.goal_counters.clone();
            let new_id = self.next_id;
            self.next_id += 1;
            let mut new_chunk = Chunk::new(new_id);
            new_chunk.goal_counters = goal_counters;
            new_chunk.version = 1;
            new_chunk.operation = Operation::Duplicate;
            self.touch(&new_chunk);
            self.chunks.insert(new_id, new_chunk);
            Ok(ModificationResult { new_chunk_id: new_id, new_version: 1 })
        }
    }

    /// Truncate-open path, same copy-on-write rule as `multi_modify` plus
    /// the parity-bearing-part refusal (only standard-copy chunks may be
    /// truncated in place; parity slices would need a full re-encode).
    pub fn multi_truncate(
        &mut self,
        id: ChunkId,
        lockid: LockId,
        now: u32,
        exclusively_owned: bool,
    ) -> ChunkResult<ModificationResult> {
        let chunk = self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)?;
        self.check_lock(chunk, lockid, now)?;
        if chunk.parts.iter().any(|p| p.part_type.slice.is_parity_bearing()) {
            return Err(ChunkError::NotPossible);
        }
        if chunk.has_busy_part() {
            return Err(ChunkError::NotPossible);
        }

        let op = if exclusively_owned { Operation::Truncate } else { Operation::DupTrunc };
        if exclusively_owned {
            let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
            chunk.version += 1;
            chunk.operation = op;
            let result = ModificationResult { new_chunk_id: id, new_version: chunk.version };
            self.touch_by_id(id);
            Ok(result)
        } else {
            let goal_counters = chunk.goal_counters.clone();
            let new_id = self.next_id;
            self.next_id += 1;
            let mut new_chunk = Chunk::new(new_id);
            new_chunk.goal_counters = goal_counters;
            new_chunk.operation = op;
            self.touch(&new_chunk);
            self.chunks.insert(new_id, new_chunk);
            Ok(ModificationResult { new_chunk_id: new_id, new_version: 1 })
        }
    }

    fn check_lock(&self, chunk: &Chunk, lockid: LockId, now: u32) -> ChunkResult<()> {
        if chunk.is_locked(now) {
            if lockid == dfs_proto::types::LEGACY_LOCKID || chunk.lockid == lockid {
                Ok(())
            } else {
                Err(ChunkError::WrongLockId)
            }
        } else {
            Ok(())
        }
    }

    pub fn can_unlock(&self, id: ChunkId, lockid: LockId) -> ChunkResult<bool> {
        let chunk = self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)?;
        Ok(chunk.lockid == 0 || chunk.lockid == lockid || lockid == dfs_proto::types::LEGACY_LOCKID)
    }

    pub fn unlock(&mut self, id: ChunkId, lockid: LockId) -> ChunkResult<()> {
        if !self.can_unlock(id, lockid)? {
            return Err(ChunkError::WrongLockId);
        }
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        chunk.lockid = 0;
        chunk.lockedto = 0;
        Ok(())
    }

    pub fn lock(&mut self, id: ChunkId, lockid: LockId, until: u32) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        chunk.lockid = lockid;
        chunk.lockedto = until;
        Ok(())
    }

    /// Re-evaluates every chunk's availability against `goals`, used after a
    /// goal definition change (`invalidate_goal_cache`) or at worker startup.
    pub fn recompute_all_availability(&mut self, goals: &HashMap<String, Goal>, servers: &ChunkServerDb) {
        for chunk in self.chunks.values_mut() {
            let merged = Goal::merge(
                chunk
                    .goal_counters
                    .iter()
                    .filter_map(|(name, _)| goals.get(name)),
            );
            chunk.recompute_availability(&merged, |sid| servers.label_of(sid));
        }
        self.goal_cache_dirty = false;
    }

    pub fn invalidate_goal_cache(&mut self) {
        self.goal_cache_dirty = true;
    }

    pub fn goal_cache_dirty(&self) -> bool {
        self.goal_cache_dirty
    }

    /// Chunk ids whose cached availability is not `Safe` (feeds the
    /// endangered-chunks worker queue, §4.2).
    pub fn get_availability_state(&self, state: crate::goal::Availability) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|c| c.availability.state() == state)
            .map(|c| c.id)
            .collect()
    }

    pub fn get_fullcopies(&self, id: ChunkId) -> ChunkResult<u32> {
        Ok(self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)?.availability.full_copies)
    }

    /// A chunkserver reports that its on-disk copy of `part_type` for `id`
    /// is readable but wrong (CRC failure, truncated file): invalidate it in
    /// place rather than dropping it, so a later `server_has_chunk` at the
    /// right version can reclaim the slot instead of re-placing from
    /// scratch.
    pub fn damaged(&mut self, server: ServerId, id: ChunkId, part_type: ChunkPartType) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        if let Some(part) = chunk.parts.iter_mut().find(|p| p.server_id == server && p.part_type == part_type) {
            part.state = PartState::Invalid;
            part.version = 0;
        }
        chunk.needs_version_increase = true;
        self.touch_by_id(id);
        Ok(())
    }

    /// A chunkserver reports it no longer holds `part_type` of `id` at all
    /// (disk failure, manual removal): the part is gone, not merely wrong.
    pub fn lost(&mut self, server: ServerId, id: ChunkId, part_type: ChunkPartType) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        chunk.parts.retain(|p| !(p.server_id == server && p.part_type == part_type));
        self.touch_by_id(id);
        Ok(())
    }

    /// A chunkserver advertises that it holds `part_type` of `id` at
    /// `version`, `todel` set once the disk backing it has been flagged for
    /// retirement. Idempotent disconnection-reconciliation entry point
    /// (§4.2 step (a)): reconciles the table's view of that one part
    /// against the chunkserver's, lazily creating an unreferenced
    /// placeholder chunk if the master has no record of `id` at all (e.g.
    /// right after a restart, before the namespace layer catches up).
    pub fn server_has_chunk(
        &mut self,
        server: ServerId,
        id: ChunkId,
        version: Version,
        part_type: ChunkPartType,
        todel: bool,
    ) -> ChunkResult<()> {
        if !self.chunks.contains_key(&id) {
            let mut chunk = Chunk::new(id);
            chunk.version = version;
            self.chunks.insert(id, chunk);
            self.next_id = self.next_id.max(id + 1);
        }
        let wanted_state = if todel { PartState::TdValid } else { PartState::Valid };
        {
            let chunk = self.chunks.get_mut(&id).expect("just inserted or already present");
            let mut needs_bump = false;
            match chunk.parts.iter_mut().find(|p| p.server_id == server && p.part_type == part_type) {
                Some(part) if part.version == version => part.state = wanted_state,
                Some(part) => {
                    part.state = PartState::Invalid;
                    part.version = 0;
                    needs_bump = true;
                }
                None => chunk.parts.push(ChunkPart { server_id: server, part_type, version, state: wanted_state }),
            }
            if needs_bump {
                chunk.needs_version_increase = true;
            }
        }
        self.touch_by_id(id);
        Ok(())
    }

    /// Parts of `id` that should be replicated away from or deleted off a
    /// disconnecting/retiring server, paired with the part type so the
    /// replicator can pick a like-for-like source.
    pub fn get_partstomodify(&self, id: ChunkId) -> ChunkResult<Vec<ChunkPart>> {
        Ok(self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)?.parts.clone())
    }

    pub fn get_replication_state(&self, id: ChunkId) -> ChunkResult<(u32, bool)> {
        let chunk = self.chunks.get(&id).ok_or(ChunkError::NoSuchChunk)?;
        Ok((chunk.availability.missing_count, chunk.availability.state_is_lost()))
    }

    /// Repairs a chunk stuck below its goal by dropping it to the highest
    /// version actually present among its valid parts (used when the normal
    /// replication path can't make progress, e.g. after a chunkserver loses
    /// its disk permanently). Parts at a stale version are always
    /// discarded; `correct_only` controls whether parts at the best version
    /// but of a type the current `goal` no longer calls for are also
    /// discarded (`false`) or left alone (`true`, the safer choice when the
    /// caller isn't sure the goal it's holding is current). Returns the
    /// repaired version and whether anything actually changed.
    pub fn repair(&mut self, goal: &Goal, id: ChunkId, correct_only: bool) -> ChunkResult<(Version, bool)> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        let best_version = chunk
            .parts
            .iter()
            .filter(|p| p.state.is_valid())
            .map(|p| p.version)
            .max()
            .ok_or(ChunkError::ChunkLost)?;
        let wanted: Vec<ChunkPartType> = goal
            .slices
            .iter()
            .flat_map(|sg| (0..sg.required_count() as u8).map(move |part| ChunkPartType { slice: sg.slice, part }))
            .collect();

        let before = chunk.parts.len();
        let before_version = chunk.version;
        chunk.parts.retain(|p| {
            if !(p.state.is_valid() && p.version == best_version) {
                return false;
            }
            correct_only || wanted.iter().any(|w| *w == p.part_type)
        });
        chunk.version = best_version;
        chunk.interrupted = false;
        self.touch_by_id(id);
        let changed = chunk.parts.len() != before || chunk.version != before_version;
        Ok((best_version, changed))
    }

    fn touch_by_id(&mut self, id: ChunkId) {
        if let Some(chunk) = self.chunks.get(&id) {
            let id = chunk.id;
            let version = chunk.version;
            self.checksum.update(id, version);
        }
    }

    /// Registers a freshly placed part with state `Busy` (the op is in
    /// flight; the caller promotes it to `Valid` on ack via `got_*_status`).
    pub fn add_pending_part(&mut self, id: ChunkId, server_id: ServerId, part_type: ChunkPartType, version: Version) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        chunk.parts.push(ChunkPart { server_id, part_type, version, state: PartState::Busy });
        Ok(())
    }

    /// Drops the busy placeholder [`add_pending_part`] left at `server_id`
    /// for `part_type`, whether the in-flight op that placeholder was
    /// guarding against double-dispatch ended up succeeding or failing.
    /// Callers that record the real outcome separately (e.g.
    /// [`Self::got_replicate_status`], which always appends its own part on
    /// success) call this first so the placeholder never lingers.
    pub fn clear_pending_part(&mut self, id: ChunkId, server_id: ServerId, part_type: ChunkPartType) {
        if let Some(chunk) = self.chunks.get_mut(&id) {
            chunk.parts.retain(|p| !(p.server_id == server_id && p.part_type == part_type && p.state.is_busy()));
        }
    }

    fn finish_pending(&mut self, id: ChunkId, server_id: ServerId, status: Status, ok_state: PartState) -> ChunkResult<()> {
        let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
        let part = chunk
            .parts
            .iter_mut()
            .find(|p| p.server_id == server_id && p.state.is_busy())
            .ok_or(ChunkError::NoSuchChunk)?;
        if status.is_ok() {
            part.state = ok_state;
        } else {
            chunk.parts.retain(|p| !(p.server_id == server_id && p.state.is_busy()));
            chunk.interrupted = true;
        }
        self.touch_by_id(id);
        Ok(())
    }

    pub fn got_create_status(&mut self, id: ChunkId, server_id: ServerId, status: Status) -> ChunkResult<()> {
        self.finish_pending(id, server_id, status, PartState::Valid)
    }

    pub fn got_duplicate_status(&mut self, id: ChunkId, server_id: ServerId, status: Status) -> ChunkResult<()> {
        self.finish_pending(id, server_id, status, PartState::Valid)
    }

    pub fn got_setversion_status(&mut self, id: ChunkId, server_id: ServerId, status: Status) -> ChunkResult<()> {
        if status.is_ok() {
            let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
            if let Some(p) = chunk.parts.iter_mut().find(|p| p.server_id == server_id) {
                p.version = chunk.version;
            }
            self.touch_by_id(id);
            Ok(())
        } else {
            let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
            chunk.interrupted = true;
            Ok(())
        }
    }

    pub fn got_truncate_status(&mut self, id: ChunkId, server_id: ServerId, status: Status) -> ChunkResult<()> {
        self.got_setversion_status(id, server_id, status)
    }

    pub fn got_duptrunc_status(&mut self, id: ChunkId, server_id: ServerId, status: Status) -> ChunkResult<()> {
        self.finish_pending(id, server_id, status, PartState::Valid)
    }

    pub fn got_replicate_status(&mut self, id: ChunkId, server_id: ServerId, part_type: ChunkPartType, version: Version, status: Status) -> ChunkResult<()> {
        if status.is_ok() {
            let chunk = self.chunks.get_mut(&id).ok_or(ChunkError::NoSuchChunk)?;
            chunk.parts.push(ChunkPart { server_id, part_type, version, state: PartState::Valid });
            self.touch_by_id(id);
        }
        Ok(())
    }

    pub fn got_delete_status(&mut self, id: ChunkId, server_id: ServerId, status: Status) -> ChunkResult<()> {
        if status.is_ok() {
            if let Some(chunk) = self.chunks.get_mut(&id) {
                chunk.parts.retain(|p| p.server_id != server_id);
                self.touch_by_id(id);
            }
        }
        Ok(())
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for ChunkTable {
    fn default() -> Self {
        Self::new()
    }
}

// `state_is_lost` isn't itself public on `AvailabilitySummary` (only
// `state()` is, elsewhere) but `get_replication_state` wants the raw flag
// without allocating an `Availability` match; expose it narrowly here.
impl crate::chunk::AvailabilitySummary {
    fn state_is_lost(&self) -> bool {
        self.state() == crate::goal::Availability::Lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_proto::types::Addr;
    use std::net::Ipv4Addr;

    fn servers_with_one() -> ChunkServerDb {
        let mut db = ChunkServerDb::new();
        db.register(Addr::new(Ipv4Addr::new(10, 0, 0, 1), 9422), "l".into(), 1, 2).unwrap();
        db.register(Addr::new(Ipv4Addr::new(10, 0, 0, 2), 9422), "l".into(), 1, 2).unwrap();
        db
    }

    #[test]
    fn create_allocates_a_fresh_empty_chunk() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        let chunk = table.get(id).unwrap();
        assert_eq!(chunk.file_count(), 1);
        assert!(chunk.parts.is_empty());
    }

    #[test]
    fn multi_modify_exclusive_bumps_version_in_place() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        let result = table.multi_modify(id, 0, 0, true).unwrap();
        assert_eq!(result.new_chunk_id, id);
        assert_eq!(result.new_version, 2);
    }

    #[test]
    fn multi_modify_shared_duplicates_to_a_new_id() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.add_goal_reference(id, "2x").unwrap();
        let result = table.multi_modify(id, 0, 0, false).unwrap();
        assert_ne!(result.new_chunk_id, id);
        assert_eq!(result.new_version, 1);
    }

    #[test]
    fn multi_modify_refuses_wrong_lockid_while_locked() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.lock(id, 42, 1_000_000).unwrap();
        let err = table.multi_modify(id, 7, 0, true).unwrap_err();
        assert_eq!(err, ChunkError::WrongLockId);
    }

    #[test]
    fn legacy_lockid_bypasses_the_lock_check() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.lock(id, 42, 1_000_000).unwrap();
        assert!(table.multi_modify(id, dfs_proto::types::LEGACY_LOCKID, 0, true).is_ok());
    }

    #[test]
    fn truncate_refuses_parity_bearing_chunks() {
        let mut table = ChunkTable::new();
        let id = table.create("ec");
        table.add_pending_part(id, 1, ChunkPartType { slice: dfs_proto::types::SliceType::Ec { data_k: 4, parity_m: 2 }, part: 0 }, 1).unwrap();
        let err = table.multi_truncate(id, 0, 0, true).unwrap_err();
        assert_eq!(err, ChunkError::NotPossible);
    }

    #[test]
    fn got_create_status_promotes_busy_to_valid_on_ok() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.add_pending_part(id, 1, ChunkPartType::standard(), 1).unwrap();
        table.got_create_status(id, 1, Status::Ok).unwrap();
        let chunk = table.get(id).unwrap();
        assert!(chunk.parts[0].state.is_valid());
    }

    #[test]
    fn got_create_status_drops_the_part_on_failure() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.add_pending_part(id, 1, ChunkPartType::standard(), 1).unwrap();
        table.got_create_status(id, 1, Status::Disconnected).unwrap();
        let chunk = table.get(id).unwrap();
        assert!(chunk.parts.is_empty());
        assert!(chunk.interrupted);
    }

    #[test]
    fn repair_drops_stale_version_parts() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        {
            let chunk = table.get_mut(id).unwrap();
            chunk.parts.push(ChunkPart { server_id: 1, part_type: ChunkPartType::standard(), version: 1, state: PartState::Valid });
            chunk.parts.push(ChunkPart { server_id: 2, part_type: ChunkPartType::standard(), version: 2, state: PartState::Valid });
        }
        let goal = Goal::standard("2x", 2);
        let (repaired_version, changed) = table.repair(&goal, id, false).unwrap();
        assert_eq!(repaired_version, 2);
        assert!(changed);
        let chunk = table.get(id).unwrap();
        assert_eq!(chunk.parts.len(), 1);
        assert_eq!(chunk.parts[0].server_id, 2);
    }

    #[test]
    fn repair_correct_only_keeps_parts_outside_the_goals_shape() {
        let mut table = ChunkTable::new();
        let id = table.create("ec");
        {
            let chunk = table.get_mut(id).unwrap();
            chunk.parts.push(ChunkPart {
                server_id: 1,
                part_type: ChunkPartType { slice: dfs_proto::types::SliceType::Ec { data_k: 2, parity_m: 1 }, part: 5 },
                version: 1,
                state: PartState::Valid,
            });
        }
        let goal = Goal::standard("ec", 1);
        let (_, changed) = table.repair(&goal, id, true).unwrap();
        assert!(!changed);
        assert_eq!(table.get(id).unwrap().parts.len(), 1);
    }

    #[test]
    fn recompute_all_availability_reflects_goals() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.got_replicate_status(id, 1, ChunkPartType::standard(), 1, Status::Ok).unwrap();
        table.got_replicate_status(id, 2, ChunkPartType::standard(), 1, Status::Ok).unwrap();
        let mut goals = HashMap::new();
        goals.insert("2x".to_string(), Goal::standard("2x", 2));
        table.recompute_all_availability(&goals, &servers_with_one());
        assert_eq!(table.get(id).unwrap().availability.state(), crate::goal::Availability::Endangered);
    }
}
