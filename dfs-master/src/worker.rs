//! The chunk worker: a cooperative reconciliation loop over the chunk
//! table, expressed as an explicit state machine so each tick can yield
//! at a clean boundary rather than relying on a reentrant goto-resume.
//!
//! The worker only *decides*; it never touches a socket. Each tick returns
//! the [`WorkerAction`]s the caller (the session/replication layer) should
//! carry out, keeping this module testable without any I/O.

use std::collections::{HashMap, VecDeque};

use dfs_proto::types::{ChunkId, ChunkPartType, ServerId};

use crate::chunk::PartState;
use crate::chunks_table::ChunkTable;
use crate::chunkserver_db::ChunkServerDb;
use crate::goal::{Availability, Goal};
use crate::placement::{self, Candidate};

/// Disk-usage and same-IP rebalance knobs (§4.2 steps (g)/(h)), matching
/// `MasterConfig::acceptable_difference`/`rebalance_across_labels`.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceTuning {
    /// Usage-fraction gap between the fullest and emptiest connected server
    /// above which step (h) moves a copy from one to the other.
    pub acceptable_difference: f64,
    /// Whether step (h) may pick a destination with a different label than
    /// the source, or must stay within the source's label.
    pub rebalance_across_labels: bool,
}

impl Default for RebalanceTuning {
    fn default() -> Self {
        RebalanceTuning { acceptable_difference: 1.0, rebalance_across_labels: false }
    }
}

/// Per-tick cap on how many `Invalid` parts of one server step (b) will
/// queue for deletion, so a burst of damaged reports doesn't empty a
/// server's queue in one go.
const MAX_INVALID_DELETES_PER_SERVER_PER_TICK: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct TickBudget {
    /// Hash buckets (here: chunks) to visit this tick, whichever of the two
    /// limits is hit first.
    pub hash_steps: u32,
    /// Chunks per second cap; `u32::MAX` means unbounded by count.
    pub hash_cps: u32,
    /// Of `hash_steps`, how many may be spent draining the endangered
    /// queue before the main bucket walk gets a look in (§4.2 step 1,
    /// `ENDANGERED_CHUNKS_PRIORITY * HashSteps`).
    pub endangered_priority: u32,
}

impl TickBudget {
    fn main_budget(&self) -> u32 {
        self.hash_steps.min(self.hash_cps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A full pass over the table completed this tick.
    Done,
    /// Budget ran out before the pass completed; call `step` again.
    Yielded,
    /// Made progress but deliberately stopped short (reserved for a future
    /// wall-clock budget check; unused by the chunk-count budget alone).
    InProgress,
}

/// One thing the worker decided should happen to a chunk. The caller turns
/// this into an actual replication/deletion/version-bump request against a
/// chunkserver connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerAction {
    Replicate { chunk: ChunkId, part_type: ChunkPartType, dest: ServerId },
    Delete { chunk: ChunkId, server: ServerId, part_type: ChunkPartType },
    VersionBump { chunk: ChunkId },
    GcEmpty { chunk: ChunkId },
}

enum Phase {
    Idle,
    ScanningEndangered,
    ScanningBucket,
}

/// Default floor for the per-tick over-goal deletion allowance, matching
/// `MasterConfig::tmp_max_del_frac`'s documented default.
pub const DEFAULT_TMP_MAX_DEL_FRAC: f64 = 0.001;
/// Default ceiling the ladder below stops doubling at, matching
/// `MasterConfig::tmp_max_del_frac_cap`.
pub const DEFAULT_TMP_MAX_DEL_FRAC_CAP: f64 = 0.05;

/// Lives for the master's whole uptime; `step` is called once per loop
/// iteration.
///
/// Deletions of over-goal parts are rationed per tick to
/// `del_frac * chunk_count` (rounded up, at least one), rather than
/// unbounded, so a goal-lowering operation doesn't evict a burst of
/// replicas all at once. `del_frac` starts at `tmp_max_del_frac` and
/// doubles each tick the backlog doesn't fully drain, capped at
/// `tmp_max_del_frac_cap` (always a power-of-two multiple of the floor,
/// which keeps the invariant easy to check). It resets to the floor once
/// a tick finds nothing left to delete.
pub struct ChunkWorkerState {
    phase: Phase,
    endangered_queue: VecDeque<ChunkId>,
    bucket_ids: Vec<ChunkId>,
    bucket_pos: usize,
    del_frac_floor: f64,
    del_frac_cap: f64,
    del_frac: f64,
}

impl ChunkWorkerState {
    pub fn new() -> Self {
        Self::with_deletion_budget(DEFAULT_TMP_MAX_DEL_FRAC, DEFAULT_TMP_MAX_DEL_FRAC_CAP)
    }

    pub fn with_deletion_budget(tmp_max_del_frac: f64, tmp_max_del_frac_cap: f64) -> Self {
        ChunkWorkerState {
            phase: Phase::Idle,
            endangered_queue: VecDeque::new(),
            bucket_ids: Vec::new(),
            bucket_pos: 0,
            del_frac_floor: tmp_max_del_frac,
            del_frac_cap: tmp_max_del_frac_cap,
            del_frac: tmp_max_del_frac,
        }
    }

    /// Current per-tick deletion allowance, exposed for tests and
    /// observability.
    pub fn deletion_allowance(&self) -> usize {
        ((self.del_frac * self.bucket_ids.len().max(1) as f64).ceil() as usize).max(1)
    }

    pub fn step(
        &mut self,
        table: &ChunkTable,
        servers: &ChunkServerDb,
        goals: &HashMap<String, Goal>,
        budget: TickBudget,
        max_write_repl: u32,
    ) -> (StepOutcome, Vec<WorkerAction>) {
        self.step_with_rebalance(table, servers, goals, budget, max_write_repl, RebalanceTuning::default())
    }

    /// Full form of [`Self::step`] taking the disk-usage/same-IP rebalance
    /// knobs (§4.2 steps (g)/(h)); `step` calls this with rebalancing
    /// effectively disabled for callers that don't care.
    pub fn step_with_rebalance(
        &mut self,
        table: &ChunkTable,
        servers: &ChunkServerDb,
        goals: &HashMap<String, Goal>,
        budget: TickBudget,
        max_write_repl: u32,
        rebalance: RebalanceTuning,
    ) -> (StepOutcome, Vec<WorkerAction>) {
        let mut actions = Vec::new();
        let mut invalid_delete_budget: HashMap<ServerId, u32> = HashMap::new();

        if matches!(self.phase, Phase::Idle) {
            self.refill(table);
        }

        if matches!(self.phase, Phase::ScanningEndangered) {
            let cap = budget.endangered_priority.min(budget.main_budget());
            let mut visited = 0u32;
            while visited < cap {
                let Some(id) = self.endangered_queue.pop_front() else {
                    self.phase = Phase::ScanningBucket;
                    break;
                };
                evaluate_chunk(id, table, servers, goals, max_write_repl, rebalance, &mut invalid_delete_budget, &mut actions);
                visited += 1;
            }
            if visited >= cap && !self.endangered_queue.is_empty() {
                return (StepOutcome::Yielded, actions);
            }
        }

        let cap = budget.main_budget();
        let mut visited = 0u32;
        while visited < cap {
            if self.bucket_pos >= self.bucket_ids.len() {
                self.phase = Phase::Idle;
                return (StepOutcome::Done, self.ration_deletions(actions));
            }
            let id = self.bucket_ids[self.bucket_pos];
            evaluate_chunk(id, table, servers, goals, max_write_repl, rebalance, &mut invalid_delete_budget, &mut actions);
            self.bucket_pos += 1;
            visited += 1;
        }

        if self.bucket_pos >= self.bucket_ids.len() {
            self.phase = Phase::Idle;
            (StepOutcome::Done, self.ration_deletions(actions))
        } else {
            (StepOutcome::Yielded, self.ration_deletions(actions))
        }
    }

    /// Caps the `Delete` actions in `actions` to this tick's allowance,
    /// growing or resetting `del_frac` for next time based on whether any
    /// were held back.
    fn ration_deletions(&mut self, actions: Vec<WorkerAction>) -> Vec<WorkerAction> {
        let allowance = self.deletion_allowance();
        let mut kept = Vec::with_capacity(actions.len());
        let mut delete_count = 0usize;
        let mut held_back = false;
        for action in actions {
            if matches!(action, WorkerAction::Delete { .. }) {
                if delete_count < allowance {
                    delete_count += 1;
                    kept.push(action);
                } else {
                    held_back = true;
                }
            } else {
                kept.push(action);
            }
        }

        if held_back {
            self.del_frac = (self.del_frac * 2.0).min(self.del_frac_cap);
        } else if delete_count == 0 {
            self.del_frac = self.del_frac_floor;
        }

        kept
    }

    fn refill(&mut self, table: &ChunkTable) {
        for id in table.get_availability_state(Availability::Endangered) {
            if !self.endangered_queue.contains(&id) {
                self.endangered_queue.push_back(id);
            }
        }
        self.bucket_ids = table.iter_ids().collect();
        self.bucket_pos = 0;
        self.phase = if self.endangered_queue.is_empty() {
            Phase::ScanningBucket
        } else {
            Phase::ScanningEndangered
        };
    }
}

impl Default for ChunkWorkerState {
    fn default() -> Self {
        Self::new()
    }
}

fn evaluate_chunk(
    id: ChunkId,
    table: &ChunkTable,
    servers: &ChunkServerDb,
    goals: &HashMap<String, Goal>,
    max_write_repl: u32,
    rebalance: RebalanceTuning,
    invalid_delete_budget: &mut HashMap<ServerId, u32>,
    actions: &mut Vec<WorkerAction>,
) {
    let Ok(chunk) = table.get(id) else { return };

    // step (c): unreferenced chunks get their parts swept, not replicated.
    if chunk.file_count() == 0 {
        actions.push(WorkerAction::GcEmpty { chunk: id });
        return;
    }

    // step (a): parts whose server has vanished can't serve; treat the
    // chunk as needing both a version bump and a replacement copy.
    let mut have_ghost = false;
    for part in &chunk.parts {
        if part.state.is_valid() && !servers.is_connected(part.server_id) {
            have_ghost = true;
        }
    }
    if have_ghost {
        actions.push(WorkerAction::VersionBump { chunk: id });
    }

    // step (b): parts already marked `Invalid` (damaged/stale) are pure
    // dead weight on their chunkserver's disk; queue their removal,
    // rationed per server so one chunk's report doesn't monopolize a
    // server's deletion budget this tick.
    for part in &chunk.parts {
        if part.state == PartState::Invalid {
            let used = invalid_delete_budget.entry(part.server_id).or_insert(0);
            if *used < MAX_INVALID_DELETES_PER_SERVER_PER_TICK {
                *used += 1;
                actions.push(WorkerAction::Delete { chunk: id, server: part.server_id, part_type: part.part_type });
            }
        }
    }

    let merged = Goal::merge(chunk.goal_counters.iter().filter_map(|(name, _)| goals.get(name)));

    // step (d): replicate missing parts, capped at max_write_repl per tick.
    if chunk.availability.missing_count > 0 {
        let mut candidates: Vec<Candidate> = servers
            .iter()
            .filter(|(id, e)| e.connected && !chunk.parts.iter().any(|p| p.server_id == **id))
            .map(|(id, e)| Candidate {
                server_id: *id,
                label: e.label.clone(),
                weight: e.weight,
                version: e.version,
                load_factor: e.load_factor,
                ip: e.addr.ip,
                usage_fraction: e.usage_fraction(),
                chunks_created: e.chunks_created,
            })
            .collect();

        let wanted = chunk.availability.missing_count.min(max_write_repl);
        if let Ok(dests) = placement::choose_servers_for_new_chunk(&mut candidates, &merged, 0, false) {
            for dest in dests.into_iter().take(wanted as usize) {
                actions.push(WorkerAction::Replicate {
                    chunk: id,
                    part_type: ChunkPartType::standard(),
                    dest,
                });
            }
        }
    }

    // step (e): over-goal deletion, worst (most-used, then todel) part
    // first. A chunk is "degenerate" when one server already holds two or
    // more of its valid parts: that server's extra part may be the only
    // thing keeping the chunk above its goal on paper, so this step refuses
    // to touch any part of the chunk until placement elsewhere fixes the
    // duplication instead of this step blindly discarding from it.
    let mut per_server_valid: HashMap<ServerId, u32> = HashMap::new();
    for part in chunk.parts.iter().filter(|p| p.state.is_valid()) {
        *per_server_valid.entry(part.server_id).or_insert(0) += 1;
    }
    let degenerate = per_server_valid.values().any(|&count| count > 1);
    if chunk.availability.redundant_count > 0 && !degenerate {
        let worst = chunk
            .parts
            .iter()
            .filter(|p| p.state.is_valid() && !p.state.is_todel())
            .max_by(|a, b| {
                let ua = servers.get(a.server_id).map(|e| e.usage_fraction()).unwrap_or(0.0);
                let ub = servers.get(b.server_id).map(|e| e.usage_fraction()).unwrap_or(0.0);
                ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(part) = worst {
            actions.push(WorkerAction::Delete { chunk: id, server: part.server_id, part_type: part.part_type });
        }
    }

    // step (f): parts stuck on a retiring (`TdValid`) disk get rebalanced
    // the same way a missing part would, piggybacking on the replication
    // selection above rather than a second placement pass.
    for part in &chunk.parts {
        if part.state == PartState::TdValid {
            let mut candidates: Vec<Candidate> = servers
                .iter()
                .filter(|(sid, e)| e.connected && !chunk.parts.iter().any(|p| p.server_id == **sid))
                .map(|(sid, e)| Candidate {
                    server_id: *sid,
                    label: e.label.clone(),
                    weight: e.weight,
                    version: e.version,
                    load_factor: e.load_factor,
                    ip: e.addr.ip,
                    usage_fraction: e.usage_fraction(),
                    chunks_created: e.chunks_created,
                })
                .collect();
            if let Some(dest) = candidates.first() {
                actions.push(WorkerAction::Replicate { chunk: id, part_type: part.part_type, dest: dest.server_id });
            }
            break;
        }
    }

    // step (g): two valid parts sharing a physical host (same IP, distinct
    // chunkserver ports) defeat the goal's host-level redundancy even
    // though the part count looks satisfied; replicate one of them to a
    // server on a different IP, same as a missing-part repair would.
    let mut ip_counts: HashMap<std::net::Ipv4Addr, u32> = HashMap::new();
    for part in chunk.parts.iter().filter(|p| p.state.is_valid()) {
        if let Some(ip) = servers.get(part.server_id).map(|e| e.addr.ip) {
            *ip_counts.entry(ip).or_insert(0) += 1;
        }
    }
    if ip_counts.values().any(|&count| count > 1) {
        let used_ips: std::collections::HashSet<_> =
            chunk.parts.iter().filter(|p| p.state.is_valid()).filter_map(|p| servers.get(p.server_id).map(|e| e.addr.ip)).collect();
        let dest = servers
            .iter()
            .filter(|(sid, e)| e.connected && !used_ips.contains(&e.addr.ip) && !chunk.parts.iter().any(|p| p.server_id == **sid))
            .min_by(|(_, a), (_, b)| a.usage_fraction().partial_cmp(&b.usage_fraction()).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((sid, _)) = dest {
            actions.push(WorkerAction::Replicate { chunk: id, part_type: ChunkPartType::standard(), dest: *sid });
        }
    }

    // step (h): move a copy from the fullest connected server holding a
    // part of this chunk to the emptiest eligible one once the spread
    // between any two connected servers' usage fractions exceeds
    // `acceptable_difference`. `rebalance_across_labels` controls whether
    // the destination may carry a different label than the source.
    if let Some(fullest_holder) = chunk
        .parts
        .iter()
        .filter(|p| p.state.is_valid())
        .max_by(|a, b| {
            let ua = servers.get(a.server_id).map(|e| e.usage_fraction()).unwrap_or(0.0);
            let ub = servers.get(b.server_id).map(|e| e.usage_fraction()).unwrap_or(0.0);
            ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
        })
    {
        let source_usage = servers.get(fullest_holder.server_id).map(|e| e.usage_fraction()).unwrap_or(0.0);
        let source_label = servers.label_of(fullest_holder.server_id);
        let emptiest = servers
            .iter()
            .filter(|(sid, e)| {
                e.connected
                    && !chunk.parts.iter().any(|p| p.server_id == **sid)
                    && (rebalance.rebalance_across_labels || e.label == source_label)
            })
            .min_by(|(_, a), (_, b)| a.usage_fraction().partial_cmp(&b.usage_fraction()).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((sid, dest_entry)) = emptiest {
            if source_usage - dest_entry.usage_fraction() > rebalance.acceptable_difference {
                actions.push(WorkerAction::Replicate { chunk: id, part_type: fullest_holder.part_type, dest: *sid });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPart;
    use crate::goal::Goal;
    use dfs_proto::types::Addr;
    use dfs_proto::Status;
    use std::net::Ipv4Addr;

    fn server(db: &mut ChunkServerDb, n: u8) -> ServerId {
        db.register(Addr::new(Ipv4Addr::new(10, 0, 0, n as u8), 9422), "l".into(), 1, 2).unwrap()
    }

    #[test]
    fn gc_action_emitted_for_unreferenced_chunk() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        table.remove_goal_reference(id, "2x").ok();
        // chunk dropped entirely once its last reference goes; re-create
        // with a dangling part but zero goal references to exercise GC.
        let id = table.create("2x");
        table.get_mut(id).unwrap().goal_counters.clear();

        let db = ChunkServerDb::new();
        let goals = HashMap::new();
        let mut worker = ChunkWorkerState::new();
        let budget = TickBudget { hash_steps: 10, hash_cps: 10, endangered_priority: 0 };
        let (outcome, actions) = worker.step(&table, &db, &goals, budget, 2);
        assert_eq!(outcome, StepOutcome::Done);
        assert!(actions.contains(&WorkerAction::GcEmpty { chunk: id }));
    }

    #[test]
    fn replicates_missing_parts_up_to_the_per_tick_cap() {
        let mut table = ChunkTable::new();
        let id = table.create("2x");
        let mut db = ChunkServerDb::new();
        let s1 = server(&mut db, 1);
        server(&mut db, 2);
        server(&mut db, 3);
        table.got_replicate_status(id, s1, ChunkPartType::standard(), 1, Status::Ok).unwrap();

        let mut goals = HashMap::new();
        goals.insert("2x".to_string(), Goal::standard("2x", 2));
        table.recompute_all_availability(&goals, &db);

        let mut worker = ChunkWorkerState::new();
        let budget = TickBudget { hash_steps: 10, hash_cps: 10, endangered_priority: 0 };
        let (_, actions) = worker.step(&table, &db, &goals, budget, 1);
        let replicate_count = actions.iter().filter(|a| matches!(a, WorkerAction::Replicate { .. })).count();
        assert_eq!(replicate_count, 1);
    }

    #[test]
    fn yields_when_bucket_exceeds_budget() {
        let mut table = ChunkTable::new();
        for _ in 0..5 {
            table.create("2x");
        }
        let db = ChunkServerDb::new();
        let goals = HashMap::new();
        let mut worker = ChunkWorkerState::new();
        let budget = TickBudget { hash_steps: 2, hash_cps: 2, endangered_priority: 0 };
        let (outcome, _) = worker.step(&table, &db, &goals, budget, 2);
        assert_eq!(outcome, StepOutcome::Yielded);
    }

    #[test]
    fn deletes_a_redundant_part_when_over_goal() {
        let mut table = ChunkTable::new();
        let id = table.create("1x");
        let mut db = ChunkServerDb::new();
        let s1 = server(&mut db, 1);
        let s2 = server(&mut db, 2);
        table.got_replicate_status(id, s1, ChunkPartType::standard(), 1, Status::Ok).unwrap();
        table.got_replicate_status(id, s2, ChunkPartType::standard(), 1, Status::Ok).unwrap();

        let mut goals = HashMap::new();
        goals.insert("1x".to_string(), Goal::standard("1x", 1));
        table.recompute_all_availability(&goals, &db);

        let mut worker = ChunkWorkerState::new();
        let budget = TickBudget { hash_steps: 10, hash_cps: 10, endangered_priority: 0 };
        let (_, actions) = worker.step(&table, &db, &goals, budget, 2);
        assert!(actions.iter().any(|a| matches!(a, WorkerAction::Delete { chunk, .. } if *chunk == id)));
    }

    #[test]
    fn degenerate_over_goal_chunk_keeps_both_parts() {
        let mut table = ChunkTable::new();
        let id = table.create("1x");
        let mut db = ChunkServerDb::new();
        let s1 = server(&mut db, 1);
        // Two copies of the same standard part, both reported by the same
        // server: a degenerate layout, not genuine over-goal redundancy.
        table.got_replicate_status(id, s1, ChunkPartType::standard(), 1, Status::Ok).unwrap();
        table.got_replicate_status(id, s1, ChunkPartType::standard(), 1, Status::Ok).unwrap();

        let mut goals = HashMap::new();
        goals.insert("1x".to_string(), Goal::standard("1x", 1));
        table.recompute_all_availability(&goals, &db);
        assert!(table.get(id).unwrap().availability.redundant_count > 0);

        let mut worker = ChunkWorkerState::new();
        let budget = TickBudget { hash_steps: 10, hash_cps: 10, endangered_priority: 0 };
        let (_, actions) = worker.step(&table, &db, &goals, budget, 2);
        assert!(!actions.iter().any(|a| matches!(a, WorkerAction::Delete { chunk, .. } if *chunk == id)));
    }
}
