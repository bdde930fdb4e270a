//! `MasterConfig`: the worker-loop tuning knobs the original reads from
//! global `cfg_getuint32`/`cfg_ranged_get` state, turned into fields on an
//! explicit struct threaded through the worker instead (§1.3's "global
//! mutable state -> subsystem handle" redesign flag).

use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "0.0.0.0:9421".to_string()
}

fn default_hash_steps() -> u32 {
    1
}

fn default_hash_cps() -> u32 {
    u32::MAX
}

fn default_operations_delay_init() -> u32 {
    300
}

fn default_operations_delay_disconnect() -> u32 {
    3600
}

fn default_endangered_chunks_priority() -> f64 {
    0.0
}

fn default_acceptable_difference() -> f64 {
    0.1
}

fn default_max_write_repl() -> u32 {
    2
}

fn default_tmp_max_del_frac() -> f64 {
    0.001
}

fn default_tmp_max_del_frac_cap() -> f64 {
    0.05
}

fn default_session_sustain_secs() -> u32 {
    86400
}

fn default_lock_timeout() -> u32 {
    120
}

fn default_goal_name() -> String {
    "default".to_string()
}

fn default_protocol_version() -> u32 {
    3
}

fn default_chunkserver_op_timeout_secs() -> u64 {
    5
}

fn default_replicate_op_timeout_secs() -> u64 {
    60
}

/// `tmp_max_del_frac` starts small and doubles each tick a deletion
/// backlog persists, capped at `tmp_max_del_frac_cap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen: String,
    pub hash_steps: u32,
    pub hash_cps: u32,
    pub operations_delay_init: u32,
    pub operations_delay_disconnect: u32,
    pub endangered_chunks_priority: f64,
    pub acceptable_difference: f64,
    pub max_write_repl: u32,
    pub tmp_max_del_frac: f64,
    pub tmp_max_del_frac_cap: f64,
    pub session_sustain_secs: u32,
    pub lock_timeout: u32,
    pub avoid_same_ip: bool,
    pub rebalance_across_labels: bool,
    /// Name of the goal newly-created files are opened under when the
    /// namespace layer (out of scope, §1) hasn't assigned one explicitly.
    #[serde(default = "default_goal_name")]
    pub default_goal: String,
    /// Where to persist the session table between restarts. `None`
    /// disables persistence: every mount reconnects as a fresh session.
    #[serde(default)]
    pub session_sidecar_path: Option<String>,
    /// Advertised in this process's own `HELLO` when it opens a chunk-op
    /// connection to a chunkserver.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// How long to wait for a chunkserver's `CHUNK_OP_STATUS` reply before
    /// giving up on the synchronous round trip and queuing the op as
    /// delayed (§4.1).
    #[serde(default = "default_chunkserver_op_timeout_secs")]
    pub chunkserver_op_timeout_secs: u64,
    /// How long a background `REPLICATE` dispatch waits for the destination
    /// chunkserver's `REPLICATE_STATUS` reply. Generous relative to
    /// `chunkserver_op_timeout_secs` because the destination spends this
    /// window actually pulling and reconstructing chunk data, not just
    /// acking a local metadata change.
    #[serde(default = "default_replicate_op_timeout_secs")]
    pub replicate_op_timeout_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            listen: default_listen(),
            hash_steps: default_hash_steps(),
            hash_cps: default_hash_cps(),
            operations_delay_init: default_operations_delay_init(),
            operations_delay_disconnect: default_operations_delay_disconnect(),
            endangered_chunks_priority: default_endangered_chunks_priority(),
            acceptable_difference: default_acceptable_difference(),
            max_write_repl: default_max_write_repl(),
            tmp_max_del_frac: default_tmp_max_del_frac(),
            tmp_max_del_frac_cap: default_tmp_max_del_frac_cap(),
            session_sustain_secs: default_session_sustain_secs(),
            lock_timeout: default_lock_timeout(),
            avoid_same_ip: true,
            rebalance_across_labels: false,
            default_goal: default_goal_name(),
            session_sidecar_path: None,
            protocol_version: default_protocol_version(),
            chunkserver_op_timeout_secs: default_chunkserver_op_timeout_secs(),
            replicate_op_timeout_secs: default_replicate_op_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.max_write_repl, 2);
        assert_eq!(cfg.lock_timeout, 120);
        assert_eq!(cfg.acceptable_difference, 0.1);
    }

    #[test]
    fn deserializes_partial_toml_with_defaults_filled_in() {
        let cfg: MasterConfig = toml::from_str("listen = \"127.0.0.1:9421\"\n").unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9421");
        assert_eq!(cfg.max_write_repl, 2);
    }
}
