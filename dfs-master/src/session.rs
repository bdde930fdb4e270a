//! Per-mount session state and the delayed-chunk-op queue (data model §3).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use dfs_proto::types::{ChunkId, Inode, LockId};

pub type SessionId = u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub read_only: bool,
    pub map_all_uid: bool,
    pub dynamic_ip: bool,
    pub meta_only: bool,
}

/// One hour's worth of per-operation counters, rotated at the top of the
/// hour (current becomes previous, current resets).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpCounters {
    pub counts: [u64; 16],
}

impl OpCounters {
    pub fn bump(&mut self, op: usize) {
        if let Some(slot) = self.counts.get_mut(op) {
            *slot += 1;
        }
    }
}

/// What kind of master<->chunkserver work a [`DelayedChunkOp`] is waiting
/// on, so the single reply can be keyed back to the right client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayedOpKind {
    Create,
    Modify,
    Truncate,
}

/// A client request whose reply must wait on a chunkserver ack, queued on
/// the session that issued it (§3). `messageid` lets the client correlate
/// the eventual reply to its original request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedChunkOp {
    pub chunkid: ChunkId,
    pub messageid: u32,
    pub inode: Inode,
    pub file_length: u64,
    pub lockid: LockId,
    pub kind: DelayedOpKind,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub peer_ip: Ipv4Addr,
    pub flags: SessionFlags,
    pub root_inode: Inode,
    pub goal_min: u8,
    pub goal_max: u8,
    pub trashtime_min: u32,
    pub trashtime_max: u32,
    pub open_files: Vec<Inode>,
    pub current_hour: OpCounters,
    pub previous_hour: OpCounters,
    /// Secondary-group cache: high bit of the key flags "this is a cache
    /// id, look up the real group list" rather than a literal gid.
    pub group_cache: HashMap<u32, Vec<u32>>,
    pub delayed_ops: Vec<DelayedChunkOp>,
    /// Unix timestamp of the last request seen on this session; drives
    /// expiry after the configured sustain window.
    pub last_seen: u32,
}

impl Session {
    pub fn new(session_id: SessionId, peer_ip: Ipv4Addr, root_inode: Inode, now: u32) -> Self {
        Session {
            session_id,
            peer_ip,
            flags: SessionFlags::default(),
            root_inode,
            goal_min: 1,
            goal_max: 9,
            trashtime_min: 0,
            trashtime_max: u32::MAX,
            open_files: Vec::new(),
            current_hour: OpCounters::default(),
            previous_hour: OpCounters::default(),
            group_cache: HashMap::new(),
            delayed_ops: Vec::new(),
            last_seen: now,
        }
    }

    pub fn touch(&mut self, now: u32) {
        self.last_seen = now;
    }

    pub fn is_expired(&self, now: u32, sustain_secs: u32) -> bool {
        now.saturating_sub(self.last_seen) > sustain_secs
    }

    pub fn rotate_hour(&mut self) {
        self.previous_hour = std::mem::take(&mut self.current_hour);
    }

    pub fn queue_delayed_op(&mut self, op: DelayedChunkOp) {
        self.delayed_ops.push(op);
    }

    /// Takes (and removes) the queued op for `chunkid`, once its ack
    /// arrives — exactly one reply per queued op (§3).
    pub fn take_delayed_op(&mut self, chunkid: ChunkId) -> Option<DelayedChunkOp> {
        let pos = self.delayed_ops.iter().position(|op| op.chunkid == chunkid)?;
        Some(self.delayed_ops.remove(pos))
    }
}

pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable { sessions: HashMap::new(), next_id: 1 }
    }

    pub fn create(&mut self, peer_ip: Ipv4Addr, root_inode: Inode, now: u32) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, Session::new(id, peer_ip, root_inode, now));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Drops every session that's been silent longer than `sustain_secs`.
    pub fn expire(&mut self, now: u32, sustain_secs: u32) {
        self.sessions.retain(|_, s| !s.is_expired(now, sustain_secs));
    }

    /// Serializes the whole table to `path` as JSON, mirroring
    /// `pbs_datastore`'s sidecar-state pattern: the in-memory table stays
    /// the source of truth, this file only lets a restarted master recover
    /// it instead of forcing every mount to reconnect from scratch.
    pub fn save_sidecar(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = SessionTableSnapshot {
            next_id: self.next_id,
            sessions: self.sessions.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Loads a table previously written by [`Self::save_sidecar`]. A
    /// missing file is not an error — a fresh master with no prior sidecar
    /// just starts with an empty table.
    pub fn load_sidecar(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(SessionTable::new());
        }
        let bytes = std::fs::read(path)?;
        let snapshot: SessionTableSnapshot = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
        let sessions = snapshot.sessions.into_iter().map(|s| (s.session_id, s)).collect();
        Ok(SessionTable { sessions, next_id: snapshot.next_id })
    }
}

#[derive(Serialize, Deserialize)]
struct SessionTableSnapshot {
    next_id: SessionId,
    sessions: Vec<Session>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_op_is_taken_exactly_once() {
        let mut session = Session::new(1, Ipv4Addr::new(127, 0, 0, 1), 1, 0);
        session.queue_delayed_op(DelayedChunkOp {
            chunkid: 42,
            messageid: 1,
            inode: 1,
            file_length: 0,
            lockid: 0,
            kind: DelayedOpKind::Create,
        });
        assert!(session.take_delayed_op(42).is_some());
        assert!(session.take_delayed_op(42).is_none());
    }

    #[test]
    fn expired_sessions_are_pruned() {
        let mut table = SessionTable::new();
        let id = table.create(Ipv4Addr::new(127, 0, 0, 1), 1, 0);
        table.expire(1000, 100);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn touching_a_session_resets_its_expiry_clock() {
        let mut table = SessionTable::new();
        let id = table.create(Ipv4Addr::new(127, 0, 0, 1), 1, 0);
        table.get_mut(id).unwrap().touch(50);
        table.expire(100, 100);
        assert!(table.get(id).is_some());
    }

    #[test]
    fn sidecar_round_trips_sessions_and_delayed_ops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let mut table = SessionTable::new();
        let id = table.create(Ipv4Addr::new(127, 0, 0, 1), 1, 0);
        table.get_mut(id).unwrap().queue_delayed_op(DelayedChunkOp {
            chunkid: 7,
            messageid: 1,
            inode: 3,
            file_length: 0,
            lockid: 0,
            kind: DelayedOpKind::Truncate,
        });
        table.save_sidecar(&path).unwrap();

        let loaded = SessionTable::load_sidecar(&path).unwrap();
        let session = loaded.get(id).unwrap();
        assert_eq!(session.peer_ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(session.delayed_ops.len(), 1);
        assert_eq!(session.delayed_ops[0].chunkid, 7);
    }

    #[test]
    fn loading_a_missing_sidecar_yields_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let table = SessionTable::load_sidecar(&path).unwrap();
        assert!(table.get(1).is_none());
    }
}
