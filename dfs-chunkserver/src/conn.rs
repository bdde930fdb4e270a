//! Per-connection write/read state machine (§4.3).
//!
//! This module only *decides*: given the packets a connection has seen, it
//! produces the actions the caller (the worker task in `server.rs`) must
//! carry out - store I/O, forwarding a write down the replication chain, or
//! sending a reply. Keeping decisions here and I/O in `server.rs` makes the
//! chain-forwarding and `WRITE_END` ordering rules testable without a
//! socket, the same separation `dfs_master::worker` uses for replication
//! decisions.

use std::collections::HashSet;

use dfs_proto::types::{Addr, ChunkId, ChunkPartType, Version, WriteId};
use dfs_proto::Status;

/// Connection-level state. A single TCP connection cycles through these as
/// it serves one read or one write-chain role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Read,
    GetBlock,
    WriteLast,
    Connecting,
    WriteInit,
    WriteFwd,
    WriteFinish,
    Close,
    CloseWait,
    Closed,
}

/// One block write still in flight to the next link in the chain, or to
/// local disk, that hasn't been acknowledged yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingWrite {
    pub write_id: WriteId,
    pub block: u32,
}

/// A decision this connection wants carried out. `server.rs` executes these
/// against the real socket/store and feeds results back via `on_*`.
#[derive(Debug, Clone)]
pub enum ConnAction {
    WriteBlockLocal { id: ChunkId, version: Version, part: ChunkPartType, block: u32, write_id: WriteId },
    ForwardBlock { to: Addr, id: ChunkId, version: Version, part: ChunkPartType, block: u32, write_id: WriteId },
    ConnectNext { to: Addr },
    ReplyStatus { write_id: WriteId, status: Status },
    ReadBlock { id: ChunkId, version: Version, part: ChunkPartType, block: u32 },
    CloseSocket,
}

/// Chain write session state for one (chunk, part) being written through
/// this connection.
#[derive(Debug, Clone, Default)]
struct WriteSession {
    next_hop: Option<Addr>,
    partially_completed_writes: HashSet<PendingWrite>,
    output_queue_len: usize,
    saw_write_end: bool,
}

impl WriteSession {
    fn is_quiescent(&self) -> bool {
        self.partially_completed_writes.is_empty() && self.output_queue_len == 0
    }
}

pub struct Connection {
    state: ConnState,
    write: WriteSession,
}

impl Connection {
    pub fn new() -> Self {
        Connection { state: ConnState::Idle, write: WriteSession::default() }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// A read request arrived: the connection moves to `Read` for the whole
    /// streamed reply (no further inbound is accepted mid-stream per §4.3's
    /// state table) and stays there until `finish_read`.
    pub fn begin_read(&mut self) -> Vec<ConnAction> {
        self.state = ConnState::Read;
        Vec::new()
    }

    pub fn read_block(&self, id: ChunkId, version: Version, part: ChunkPartType, block: u32) -> ConnAction {
        ConnAction::ReadBlock { id, version, part, block }
    }

    /// Final `READ_STATUS` sent; returns to `Idle` per the state table.
    pub fn finish_read(&mut self) {
        self.state = ConnState::Idle;
    }

    /// `GET_CHUNK_BLOCKS` arrived (CS<->CS listing, §4.3's `GetBlock` state).
    pub fn begin_get_blocks(&mut self) -> Vec<ConnAction> {
        self.state = ConnState::GetBlock;
        Vec::new()
    }

    pub fn finish_get_blocks(&mut self) {
        self.state = ConnState::Idle;
    }

    /// A write-chain init packet arrived, naming the remaining hops in
    /// decreasing chunkserver-version order (§6). `None` next hop means
    /// this connection is the last link.
    pub fn begin_write(&mut self, next_hop: Option<Addr>) -> Vec<ConnAction> {
        self.write = WriteSession { next_hop, ..WriteSession::default() };
        if let Some(to) = next_hop {
            self.state = ConnState::Connecting;
            vec![ConnAction::ConnectNext { to }]
        } else {
            self.state = ConnState::WriteInit;
            Vec::new()
        }
    }

    pub fn on_connected(&mut self) {
        self.state = ConnState::WriteInit;
    }

    /// A data block arrived to be written. It is written locally and, if
    /// there is a next hop, forwarded before the local write is
    /// acknowledged back up the chain.
    pub fn accept_block(
        &mut self,
        id: ChunkId,
        version: Version,
        part: ChunkPartType,
        block: u32,
        write_id: WriteId,
    ) -> Vec<ConnAction> {
        self.state = ConnState::WriteFwd;
        self.write.partially_completed_writes.insert(PendingWrite { write_id, block });
        let mut actions = vec![ConnAction::WriteBlockLocal { id, version, part, block, write_id }];
        if let Some(to) = self.write.next_hop {
            self.write.output_queue_len += 1;
            actions.push(ConnAction::ForwardBlock { to, id, version, part, block, write_id });
        }
        actions
    }

    /// The local disk write (and, if forwarding, the downstream status)
    /// both completed for this block; replies upstream and clears the
    /// pending marker.
    pub fn on_block_done(&mut self, write_id: WriteId, block: u32, status: Status) -> Vec<ConnAction> {
        self.write.partially_completed_writes.remove(&PendingWrite { write_id, block });
        if self.write.next_hop.is_some() {
            self.write.output_queue_len = self.write.output_queue_len.saturating_sub(1);
        }
        vec![ConnAction::ReplyStatus { write_id, status }]
    }

    /// `WRITE_END` arrived. `WRITE_END` received mid-transfer (with
    /// outstanding block writes) is fatal: the
    /// connection goes straight to `WriteFinish` without waiting, since a
    /// client that sends END before all block acks return has violated the
    /// protocol. Only a `WRITE_END` seen with a fully quiescent session is
    /// the clean-finish path.
    pub fn on_write_end(&mut self) -> Vec<ConnAction> {
        self.write.saw_write_end = true;
        self.state = ConnState::WriteFinish;
        if self.write.is_quiescent() {
            Vec::new()
        } else {
            vec![ConnAction::ReplyStatus { write_id: 0, status: Status::Disconnected }]
        }
    }

    /// True once this connection is allowed to honor a pending
    /// `WRITE_END`: no write job running locally, nothing partially
    /// completed, nothing still queued to the next hop.
    pub fn can_honor_write_end(&self) -> bool {
        self.write.is_quiescent()
    }

    pub fn begin_close(&mut self) {
        self.state = ConnState::Close;
    }

    pub fn close_wait(&mut self) {
        self.state = ConnState::CloseWait;
    }

    pub fn closed(&mut self) -> Vec<ConnAction> {
        self.state = ConnState::Closed;
        vec![ConnAction::CloseSocket]
    }

    pub fn reset_to_idle(&mut self) {
        self.state = ConnState::Idle;
        self.write = WriteSession::default();
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_proto::types::SliceType;

    fn part() -> ChunkPartType {
        ChunkPartType { slice: SliceType::Standard, part: 0 }
    }

    #[test]
    fn last_link_skips_connecting_state() {
        let mut conn = Connection::new();
        let actions = conn.begin_write(None);
        assert!(actions.is_empty());
        assert_eq!(conn.state(), ConnState::WriteInit);
    }

    #[test]
    fn middle_link_connects_before_write_init() {
        let mut conn = Connection::new();
        let to = Addr { ip: "10.0.0.2".parse().unwrap(), port: 9422 };
        let actions = conn.begin_write(Some(to));
        assert_eq!(conn.state(), ConnState::Connecting);
        assert!(matches!(actions[0], ConnAction::ConnectNext { .. }));
        conn.on_connected();
        assert_eq!(conn.state(), ConnState::WriteInit);
    }

    #[test]
    fn accepting_a_block_forwards_before_local_ack() {
        let mut conn = Connection::new();
        let to = Addr { ip: "10.0.0.2".parse().unwrap(), port: 9422 };
        conn.begin_write(Some(to));
        conn.on_connected();
        let actions = conn.accept_block(1, 1, part(), 0, 42);
        assert!(matches!(actions[0], ConnAction::WriteBlockLocal { .. }));
        assert!(matches!(actions[1], ConnAction::ForwardBlock { .. }));
        assert!(!conn.can_honor_write_end());
    }

    #[test]
    fn write_end_with_outstanding_block_is_fatal() {
        let mut conn = Connection::new();
        conn.begin_write(None);
        conn.accept_block(1, 1, part(), 0, 42);
        let actions = conn.on_write_end();
        assert_eq!(conn.state(), ConnState::WriteFinish);
        assert!(actions.iter().any(|a| matches!(a, ConnAction::ReplyStatus { status: Status::Disconnected, .. })));
    }

    #[test]
    fn write_end_when_quiescent_is_clean() {
        let mut conn = Connection::new();
        conn.begin_write(None);
        let actions = conn.accept_block(1, 1, part(), 0, 42);
        assert!(!actions.is_empty());
        conn.on_block_done(42, 0, Status::Ok);
        assert!(conn.can_honor_write_end());
        let actions = conn.on_write_end();
        assert!(actions.is_empty());
    }

    #[test]
    fn block_done_clears_pending_marker() {
        let mut conn = Connection::new();
        conn.begin_write(None);
        conn.accept_block(1, 1, part(), 3, 7);
        assert!(!conn.can_honor_write_end());
        conn.on_block_done(7, 3, Status::Ok);
        assert!(conn.can_honor_write_end());
    }
}
