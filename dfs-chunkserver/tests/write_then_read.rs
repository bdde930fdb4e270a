//! Drives the connection state machine and the on-disk store together, the
//! way `server.rs` would: a chain-write session creates a chunk via the
//! job pool, and the committed bytes read back match what was sent.

use std::sync::Arc;

use dfs_chunkserver::conn::{ConnAction, Connection};
use dfs_chunkserver::jobpool::JobPool;
use dfs_chunkserver::store::ChunkStore;
use dfs_proto::types::{ChunkPartType, SliceType};
use dfs_proto::Status;

fn part() -> ChunkPartType {
    ChunkPartType { slice: SliceType::Standard, part: 0 }
}

#[tokio::test]
async fn single_hop_write_commits_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let jobs = JobPool::new(4, tx);

    let mut conn = Connection::new();
    conn.begin_write(None);

    let block_data = vec![0xABu8; 1024];
    let crc = dfs_tools::crc::crc32(0, &block_data);

    let actions = conn.accept_block(1, 1, part(), 0, 42);
    assert_eq!(actions.len(), 1);
    assert!(matches!(actions[0], ConnAction::WriteBlockLocal { .. }));

    store.create(1, 1, part()).unwrap();
    let data_for_job = block_data.clone();
    let store_for_job = store.clone();
    jobs.submit(42, 0, move || {
        store_for_job
            .write_full(1, 1, part(), &[(data_for_job, crc)])
            .map(|_| Status::Ok)
            .unwrap_or(Status::CrcMismatch)
    })
    .await;

    let result = rx.recv().await.unwrap();
    assert!(result.status.is_ok());
    let done = conn.on_block_done(result.write_id, result.block, result.status);
    assert!(matches!(done[0], ConnAction::ReplyStatus { status: Status::Ok, .. }));
    assert!(conn.can_honor_write_end());

    let end_actions = conn.on_write_end();
    assert!(end_actions.is_empty(), "quiescent write-end needs no reply");

    let (read_back, read_crc) = store.read_block(1, 1, part(), 0).unwrap();
    assert_eq!(read_back, block_data);
    assert_eq!(read_crc, crc);
}
