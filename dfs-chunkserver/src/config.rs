//! `ChunkserverConfig`: per-process tuning knobs, threaded explicitly
//! instead of read from global `cfg_*` state (§1.3's redesign flag, mirror
//! of `dfs_master::config::MasterConfig`).

use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "0.0.0.0:9422".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/dfs-chunkserver".to_string()
}

fn default_label() -> String {
    String::new()
}

fn default_weight() -> u32 {
    100
}

fn default_network_workers() -> usize {
    4
}

fn default_hdd_workers_per_network_worker() -> usize {
    4
}

fn default_bgjobs_per_network_worker() -> usize {
    1000
}

fn default_cssserv_timeout_secs() -> u64 {
    10
}

fn default_connect_retry_limit() -> u32 {
    10
}

fn default_connect_retry_base_ms() -> u64 {
    200
}

fn default_replication_bandwidth_kbps() -> u64 {
    0
}

fn default_replication_batch_blocks() -> u32 {
    50
}

fn default_read_plan_wave_timeout_ms() -> u64 {
    1500
}

fn default_read_plan_total_timeout_ms() -> u64 {
    10_000
}

fn default_connection_pool_idle_secs() -> u64 {
    3
}

fn default_protocol_version() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkserverConfig {
    pub listen: String,
    pub master_addr: String,
    pub data_dir: String,
    pub label: String,
    pub weight: u32,
    pub network_workers: usize,
    pub hdd_workers_per_network_worker: usize,
    pub bgjobs_per_network_worker: usize,
    pub cssserv_timeout_secs: u64,
    pub connect_retry_limit: u32,
    pub connect_retry_base_ms: u64,
    pub replication_bandwidth_kbps: u64,
    pub replication_batch_blocks: u32,
    pub read_plan_wave_timeout_ms: u64,
    pub read_plan_total_timeout_ms: u64,
    pub connection_pool_idle_secs: u64,
    /// Advertised in this process's own `HELLO` when it connects out to a
    /// peer (master registration, chain forwarding). Does not affect how an
    /// inbound connection is served - that dialect comes from the peer's
    /// own `HELLO`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

impl Default for ChunkserverConfig {
    fn default() -> Self {
        ChunkserverConfig {
            listen: default_listen(),
            master_addr: String::new(),
            data_dir: default_data_dir(),
            label: default_label(),
            weight: default_weight(),
            network_workers: default_network_workers(),
            hdd_workers_per_network_worker: default_hdd_workers_per_network_worker(),
            bgjobs_per_network_worker: default_bgjobs_per_network_worker(),
            cssserv_timeout_secs: default_cssserv_timeout_secs(),
            connect_retry_limit: default_connect_retry_limit(),
            connect_retry_base_ms: default_connect_retry_base_ms(),
            replication_bandwidth_kbps: default_replication_bandwidth_kbps(),
            replication_batch_blocks: default_replication_batch_blocks(),
            read_plan_wave_timeout_ms: default_read_plan_wave_timeout_ms(),
            read_plan_total_timeout_ms: default_read_plan_total_timeout_ms(),
            connection_pool_idle_secs: default_connection_pool_idle_secs(),
            protocol_version: default_protocol_version(),
        }
    }
}

/// Job-queue fill fraction past which the acceptor refuses new connections
/// (§4.3 "Background job pool").
pub const JOB_QUEUE_REJECT_FRACTION: f64 = 0.9;
