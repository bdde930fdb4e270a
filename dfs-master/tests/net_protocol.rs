//! Drives the master's real listen socket with `dfs_client::MasterClient`
//! over the wire, exercising the `FUSE_WRITE_CHUNK`/`FUSE_WRITE_CHUNK_END`/
//! `FUSE_TRUNCATE` dispatch in `dfs_master::net` end to end (§6, §8
//! scenarios 1-2), rather than calling `chunks_table` directly as
//! `chunk_lifecycle.rs` does.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dfs_client::MasterClient;
use dfs_master::net::{self, MasterState, Shared};
use dfs_master::{Goal, MasterConfig};
use dfs_proto::types::Addr;
use dfs_proto::Status;
use tokio::net::TcpListener;

async fn start_master(goal: Goal, server_count: u8) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = MasterConfig::default();
    config.listen = addr.to_string();
    config.default_goal = goal.name.clone();

    let shared = Arc::new(Shared { state: MasterState::default(), config });
    shared.state.goals.lock().await.insert(goal.name.clone(), goal);
    {
        let mut servers = shared.state.servers.lock().await;
        for octet in 1..=server_count {
            servers
                .register(Addr::new(Ipv4Addr::new(10, 0, 0, octet), 9422), "default".into(), 100, 2)
                .unwrap();
        }
    }

    let handle = tokio::spawn(async move {
        let _ = net::run(shared).await;
    });
    // give the listener a moment to bind before the client connects.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr.to_string(), handle)
}

#[tokio::test]
async fn write_chunk_returns_a_chain_sized_to_the_goal() {
    let (listen, _master) = start_master(Goal::standard("2x", 2), 3).await;

    let mut client = MasterClient::connect(&listen).await.unwrap();
    let reply = client.open_for_write(7, 0, None).await.unwrap();

    assert_ne!(reply.chunk_id, 0);
    assert_ne!(reply.lockid, 0);
    assert_eq!(reply.locations.len(), 2);

    client.end_write(reply.chunk_id, reply.lockid, 7, 4096).await.unwrap();
}

#[tokio::test]
async fn write_chunk_fails_closed_when_no_chunkservers_are_registered() {
    let (listen, _master) = start_master(Goal::standard("2x", 2), 0).await;

    let mut client = MasterClient::connect(&listen).await.unwrap();
    let reply = client.open_for_write(7, 0, None).await.unwrap();

    assert_eq!(reply.chunk_id, 0);
    assert_eq!(reply.lockid, 0);
}

#[tokio::test]
async fn reopening_the_same_file_index_reuses_the_chunk_and_bumps_its_version() {
    let (listen, _master) = start_master(Goal::standard("1x", 1), 2).await;

    let mut client = MasterClient::connect(&listen).await.unwrap();
    let first = client.open_for_write(9, 0, None).await.unwrap();
    client.end_write(first.chunk_id, first.lockid, 9, 1024).await.unwrap();

    let second = client.open_for_write(9, 0, None).await.unwrap();
    assert_eq!(second.chunk_id, first.chunk_id);
    assert_eq!(second.chunk_version, first.chunk_version + 1);
}

#[tokio::test]
async fn truncating_a_parity_goal_comes_back_delayed() {
    let ec_goal = Goal {
        name: "ec".into(),
        slices: vec![dfs_master::goal::SliceGoal {
            slice: dfs_proto::types::SliceType::Ec { data_k: 2, parity_m: 1 },
            label_counts: vec![("*".into(), 3)],
        }],
    };
    let (listen, _master) = start_master(ec_goal, 3).await;

    let mut client = MasterClient::connect(&listen).await.unwrap();
    let opened = client.open_for_write(11, 0, None).await.unwrap();
    client.end_write(opened.chunk_id, opened.lockid, 11, 4096).await.unwrap();

    let reply = client.truncate(11, 400).await.unwrap();
    assert_eq!(reply.status, Status::Delayed);
    assert_eq!(reply.chunk_id, opened.chunk_id);

    client.end_truncate(11, 400, reply.lockid).await.unwrap();
}
