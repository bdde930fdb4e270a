//! End-to-end scenario across the chunk table, chunkserver db, goal
//! calculator and chunk worker: a chunk created under-goal gets replicated,
//! then a chunk over-goal gets trimmed back down. No networking involved -
//! `dfs_master::net` is a thin I/O shell around exactly this sequence of
//! calls.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use dfs_master::{ChunkServerDb, ChunkTable, Goal};
use dfs_master::worker::{ChunkWorkerState, StepOutcome, TickBudget, WorkerAction};
use dfs_proto::types::{Addr, ChunkPartType};
use dfs_proto::Status;

fn register(db: &mut ChunkServerDb, octet: u8) -> dfs_proto::types::ServerId {
    db.register(Addr::new(Ipv4Addr::new(10, 0, 0, octet), 9422), "default".into(), 100, 2).unwrap()
}

#[test]
fn under_goal_chunk_gets_replicated_then_settles_safe() {
    let mut table = ChunkTable::new();
    let mut servers = ChunkServerDb::new();
    let a = register(&mut servers, 1);
    register(&mut servers, 2);
    register(&mut servers, 3);

    let mut goals = HashMap::new();
    goals.insert("2x".to_string(), Goal::standard("2x", 2));

    let id = table.create("2x");
    table.add_pending_part(id, a, ChunkPartType::standard(), 1).unwrap();
    table.got_create_status(id, a, Status::Ok).unwrap();
    table.recompute_all_availability(&goals, &servers);

    let mut worker = ChunkWorkerState::new();
    let budget = TickBudget { hash_steps: 10, hash_cps: 10, endangered_priority: 5 };

    let (outcome, actions) = worker.step(&table, &servers, &goals, budget, 2);
    assert_eq!(outcome, StepOutcome::Done);
    let dest = actions.iter().find_map(|a| match a {
        WorkerAction::Replicate { chunk, dest, .. } if *chunk == id => Some(*dest),
        _ => None,
    });
    let dest = dest.expect("worker should have requested a replica for the under-goal chunk");
    assert_ne!(dest, a);

    // The replication completes; the chunk should now read as Safe and the
    // worker should stop asking for more copies.
    table
        .got_replicate_status(id, dest, ChunkPartType::standard(), 1, Status::Ok)
        .unwrap();
    table.recompute_all_availability(&goals, &servers);

    let (_, actions) = worker.step(&table, &servers, &goals, budget, 2);
    assert!(!actions.iter().any(|a| matches!(a, WorkerAction::Replicate { chunk, .. } if *chunk == id)));
}

#[test]
fn over_goal_chunk_is_trimmed_back_to_the_requirement() {
    let mut table = ChunkTable::new();
    let mut servers = ChunkServerDb::new();
    let a = register(&mut servers, 1);
    let b = register(&mut servers, 2);
    let c = register(&mut servers, 3);

    let mut goals = HashMap::new();
    goals.insert("1x".to_string(), Goal::standard("1x", 1));

    let id = table.create("1x");
    for server in [a, b, c] {
        table
            .got_replicate_status(id, server, ChunkPartType::standard(), 1, Status::Ok)
            .unwrap();
    }
    table.recompute_all_availability(&goals, &servers);
    assert_eq!(table.get(id).unwrap().availability.redundant_count, 2);

    let mut worker = ChunkWorkerState::new();
    let budget = TickBudget { hash_steps: 10, hash_cps: 10, endangered_priority: 0 };
    let (_, actions) = worker.step(&table, &servers, &goals, budget, 2);

    let deletes: Vec<_> = actions
        .iter()
        .filter(|a| matches!(a, WorkerAction::Delete { chunk, .. } if *chunk == id))
        .collect();
    assert_eq!(deletes.len(), 1, "deletion is rationed to the per-tick allowance, not all at once");
}
