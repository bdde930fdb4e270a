//! Network glue: binds the listen socket for chunkserver/client connections,
//! dispatches the `FUSE_WRITE_CHUNK`/`FUSE_TRUNCATE` request family (§6) into
//! `chunks_table`/`placement`/`session`, and drives the chunk worker's tick
//! loop. The master<->chunkserver legs of those operations (`CREATE`,
//! `SET_VERSION`, `DUPLICATE`, `TRUNCATE`, `DUPTRUNC`) are real round trips
//! over `ChunkOpPacket`/`ChunkOpStatusPacket` (`dispatch_chunk_op`), bounded
//! by `chunkserver_op_timeout_secs`; an op that doesn't ack in time is
//! queued on the requesting session as a `DelayedChunkOp` and finished later
//! by a detached retry task rather than blocking the client's reply.
//!
//! The worker tick's `Replicate` actions go out the same way, over
//! `ReplicatePacket`/`ReplicateStatusPacket` (`dispatch_replicate_op`), but
//! always as a detached task: replication has no requesting client to delay
//! an ack for, so the tick loop fires it and moves on rather than holding
//! the chunk table lock across the round trip.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use dfs_proto::frame::FrameCodec;
use dfs_proto::packets::{
    ChunkLocation, ChunkOpKind, ChunkOpPacket, ChunkOpStatusPacket, FuseTruncateEndPacket,
    FuseTruncatePacket, FuseTruncateReplyPacket, FuseWriteChunkEndPacket, FuseWriteChunkPacket,
    FuseWriteChunkReplyPacket, HelloPacket, PacketType, ReplicatePacket, ReplicateStatusPacket,
    ReplicationSource,
};
use dfs_proto::types::{Addr, ChunkId, ChunkPartType, Inode, LockId, ServerId};
use dfs_proto::Status;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::chunks_table::ChunkTable;
use crate::chunkserver_db::ChunkServerDb;
use crate::config::MasterConfig;
use crate::errors::ChunkError;
use crate::goal::Goal;
use crate::placement::{self, Candidate};
use crate::session::{DelayedChunkOp, DelayedOpKind, SessionId, SessionTable};
use crate::worker::{ChunkWorkerState, TickBudget, WorkerAction};

/// All mutable master state, each behind its own lock so the tick loop and
/// the connection handlers never block each other more than necessary.
/// Every caller locks in the order the fields are declared here, so the
/// tick loop and connection dispatch can never deadlock against each other.
#[derive(Default)]
pub struct MasterState {
    pub chunks: Mutex<ChunkTable>,
    pub servers: Mutex<ChunkServerDb>,
    pub goals: Mutex<HashMap<String, Goal>>,
    pub sessions: Mutex<SessionTable>,
    /// `(inode, chunk index) -> chunk id`, the minimal slice of the
    /// out-of-scope namespace layer (§1) this daemon needs to resolve a
    /// `FUSE_WRITE_CHUNK`/`FUSE_TRUNCATE` request to a chunk.
    pub files: Mutex<HashMap<(Inode, u32), ChunkId>>,
    pub worker: Mutex<ChunkWorkerState>,
}

pub struct Shared {
    pub state: MasterState,
    pub config: MasterConfig,
}

fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

/// Runs the master until the listener or tick loop errors out: the accept
/// loop and the worker tick loop run concurrently for as long as the
/// process is up.
pub async fn run(shared: Arc<Shared>) -> Result<()> {
    shared
        .state
        .goals
        .lock()
        .await
        .entry(shared.config.default_goal.clone())
        .or_insert_with(|| Goal::standard(&shared.config.default_goal, 2));

    if let Some(path) = &shared.config.session_sidecar_path {
        match SessionTable::load_sidecar(std::path::Path::new(path)) {
            Ok(table) => *shared.state.sessions.lock().await = table,
            Err(err) => log::warn!("failed to load session sidecar {path}: {err}"),
        }
    }

    let tick_shared = shared.clone();
    let ticker = tokio::spawn(async move { tick_loop(tick_shared).await });

    tokio::select! {
        result = accept_loop(shared) => result,
        _ = ticker => Ok(()),
    }
}

/// Binds the listen socket and hands every accepted connection to its own
/// task. Diverges like `dfs_chunkserver::server::run`'s accept loop; only
/// returns (via `?`) if the listener itself errors out.
async fn accept_loop(shared: Arc<Shared>) -> Result<()> {
    let listener = TcpListener::bind(&shared.config.listen)
        .await
        .with_context(|| format!("failed to bind {}", shared.config.listen))?;
    log::info!("dfs_master::net listening on {}", shared.config.listen);

    loop {
        let (socket, peer) = listener.accept().await.context("accept failed")?;
        log::debug!("accepted connection from {peer}");
        tokio::spawn(serve_connection(socket, peer, shared.clone()));
    }
}

/// Ticks the chunk worker at a fixed cadence, applying its per-tick budget
/// from the loaded config and dispatching the `Replicate` actions it
/// produces as detached `REPLICATE` round trips (`Delete`/`VersionBump`/
/// `GcEmpty` are logged only; a standalone daemon with no `DELETE`/
/// `SET_VERSION` request of its own to drive them is out of scope here).
async fn tick_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let budget = TickBudget {
        hash_steps: shared.config.hash_steps,
        hash_cps: shared.config.hash_cps,
        endangered_priority: (shared.config.endangered_chunks_priority
            * shared.config.hash_steps as f64)
            .round() as u32,
    };
    loop {
        interval.tick().await;
        let mut chunks = shared.state.chunks.lock().await;
        let servers = shared.state.servers.lock().await;
        let goals = shared.state.goals.lock().await;
        let mut worker = shared.state.worker.lock().await;
        let rebalance = crate::worker::RebalanceTuning {
            acceptable_difference: shared.config.acceptable_difference,
            rebalance_across_labels: shared.config.rebalance_across_labels,
        };
        let (outcome, actions) = worker.step_with_rebalance(
            &chunks,
            &servers,
            &goals,
            budget,
            shared.config.max_write_repl,
            rebalance,
        );

        let mut replicate_jobs = Vec::new();
        for action in &actions {
            if let WorkerAction::Replicate { chunk, part_type, dest } = action {
                if let Some((op, addr)) = prepare_replicate(&mut chunks, &servers, *chunk, *part_type, *dest) {
                    replicate_jobs.push((*dest, op, addr));
                }
            }
        }
        drop((chunks, servers, goals, worker));

        for (dest, op, addr) in replicate_jobs {
            tokio::spawn(dispatch_replicate(shared.clone(), dest, op, addr));
        }

        {
            let mut sessions = shared.state.sessions.lock().await;
            sessions.expire(now_secs(), shared.config.session_sustain_secs);
            if let Some(path) = &shared.config.session_sidecar_path {
                if let Err(err) = sessions.save_sidecar(std::path::Path::new(path)) {
                    log::warn!("failed to persist session sidecar {path}: {err}");
                }
            }
        }

        if !actions.is_empty() {
            log::debug!("worker tick ({outcome:?}) produced {} action(s)", actions.len());
            for action in &actions {
                log_action(action);
            }
        }
    }
}

/// Builds the `REPLICATE` order for one `WorkerAction::Replicate`: the
/// sources are every currently-valid part of the chunk, resolved to their
/// servers' addresses. Marks `dest` busy for `part_type` first so the next
/// tick's candidate selection (which excludes any server already holding a
/// part of the chunk, busy or valid) won't pick the same destination again
/// while this order is still in flight.
fn prepare_replicate(
    chunks: &mut ChunkTable,
    servers: &ChunkServerDb,
    chunk_id: ChunkId,
    part_type: ChunkPartType,
    dest: ServerId,
) -> Option<(ReplicatePacket, Addr)> {
    let dest_addr = servers.get(dest)?.addr;
    let (version, sources) = {
        let chunk = chunks.get(chunk_id).ok()?;
        let version = chunk.version;
        let sources: Vec<ReplicationSource> = chunk
            .parts
            .iter()
            .filter(|p| p.state.is_valid())
            .filter_map(|p| servers.get(p.server_id).map(|e| ReplicationSource { addr: e.addr, part_type: p.part_type }))
            .collect();
        (version, sources)
    };
    if sources.is_empty() {
        return None;
    }
    chunks.add_pending_part(chunk_id, dest, part_type, version).ok()?;
    Some((ReplicatePacket { chunk_id, version, part_type, sources }, dest_addr))
}

/// Sends a prepared `REPLICATE` order and settles its outcome against the
/// chunk table once the destination chunkserver acks (or the round trip
/// times out). Runs detached from the tick that queued it.
async fn dispatch_replicate(shared: Arc<Shared>, dest: ServerId, op: ReplicatePacket, addr: Addr) {
    let status = loop {
        let status = dispatch_replicate_op(addr, &op, &shared.config).await;
        if status != Status::Waiting {
            break status;
        }
    };
    let mut chunks = shared.state.chunks.lock().await;
    chunks.clear_pending_part(op.chunk_id, dest, op.part_type);
    let _ = chunks.got_replicate_status(op.chunk_id, dest, op.part_type, op.version, status);
}

/// One `REPLICATE` round trip: HELLO, the order itself, then its
/// `REPLICATE_STATUS` reply, bounded by `replicate_op_timeout_secs`.
async fn dispatch_replicate_op(addr: Addr, op: &ReplicatePacket, config: &MasterConfig) -> Status {
    let attempt = async {
        let stream = TcpStream::connect((addr.ip, addr.port)).await.map_err(|_| Status::CantConnect)?;
        let mut framed: Framed<TcpStream, FrameCodec> =
            Framed::new(stream, FrameCodec::new(dfs_proto::types::MAX_CHUNK_SIZE + 1024));
        framed
            .send(HelloPacket { protocol_version: config.protocol_version }.encode().into_frame())
            .await
            .map_err(|_| Status::Disconnected)?;
        framed.send(op.encode().into_frame()).await.map_err(|_| Status::Disconnected)?;
        match framed.next().await {
            Some(Ok(frame)) if PacketType::try_from_u32(frame.packet_type) == Some(PacketType::ReplicateStatus) => {
                ReplicateStatusPacket::decode(frame.payload).map(|pkt| pkt.status).map_err(|_| Status::Disconnected)
            }
            _ => Err(Status::Disconnected),
        }
    };

    match tokio::time::timeout(Duration::from_secs(config.replicate_op_timeout_secs), attempt).await {
        Ok(Ok(status)) | Ok(Err(status)) => status,
        Err(_) => Status::Waiting,
    }
}

fn log_action(action: &WorkerAction) {
    match action {
        WorkerAction::Replicate { chunk, dest, .. } => {
            log::trace!("replicate chunk {chunk} to server {dest}")
        }
        WorkerAction::Delete { chunk, server, .. } => {
            log::trace!("delete chunk {chunk} from server {server}")
        }
        WorkerAction::VersionBump { chunk } => log::trace!("bump version of chunk {chunk}"),
        WorkerAction::GcEmpty { chunk } => log::trace!("garbage collect chunk {chunk}"),
    }
}

async fn serve_connection(socket: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let mut framed = Framed::new(socket, FrameCodec::new(dfs_proto::types::MAX_CHUNK_SIZE + 1024));
    let peer_ip = match peer.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let session_id = shared.state.sessions.lock().await.create(peer_ip, 1, now_secs());

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(err) => {
                log::debug!("frame decode error, closing connection: {err}");
                break;
            }
        };
        if let Some(session) = shared.state.sessions.lock().await.get_mut(session_id) {
            session.touch(now_secs());
        }

        let reply = match PacketType::try_from_u32(frame.packet_type) {
            Some(PacketType::FuseWriteChunk) => {
                match FuseWriteChunkPacket::decode(frame.payload) {
                    Ok(req) => Some(handle_write_chunk(&shared, session_id, req).await.encode()),
                    Err(err) => {
                        log::debug!("malformed FUSE_WRITE_CHUNK: {err}");
                        break;
                    }
                }
            }
            Some(PacketType::FuseWriteChunkEnd) => {
                match FuseWriteChunkEndPacket::decode(frame.payload) {
                    Ok(req) => {
                        handle_write_chunk_end(&shared, req).await;
                        None
                    }
                    Err(err) => {
                        log::debug!("malformed FUSE_WRITE_CHUNK_END: {err}");
                        break;
                    }
                }
            }
            Some(PacketType::FuseTruncate) => match FuseTruncatePacket::decode(frame.payload) {
                Ok(req) => Some(handle_truncate(&shared, session_id, req).await.encode()),
                Err(err) => {
                    log::debug!("malformed FUSE_TRUNCATE: {err}");
                    break;
                }
            },
            Some(PacketType::FuseTruncateEnd) => {
                match FuseTruncateEndPacket::decode(frame.payload) {
                    Ok(req) => {
                        handle_truncate_end(&shared, req).await;
                        None
                    }
                    Err(err) => {
                        log::debug!("malformed FUSE_TRUNCATE_END: {err}");
                        break;
                    }
                }
            }
            // Read/write/get-chunk-blocks/prefetch/test-chunk all run
            // between client and chunkserver directly (§6); the master
            // never sees them, so an arrival here is a protocol error.
            other => {
                log::debug!("unexpected packet type {:?} on master connection, closing", other);
                break;
            }
        };

        if let Some(reply) = reply {
            if framed.send(reply.into_frame()).await.is_err() {
                break;
            }
        }
    }
}

/// Builds the candidate list the placement engine needs out of every
/// currently-connected chunkserver (§4.2).
fn candidates(servers: &ChunkServerDb) -> Vec<Candidate> {
    servers
        .iter()
        .filter(|(_, e)| e.connected)
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
        .collect()
}

/// Expands a goal's slice families into the per-part types
/// `choose_servers_for_new_chunk` implicitly picked servers for, in the same
/// slice-then-label order so zipping with its result lines parts up
/// correctly.
fn part_types_for_goal(goal: &Goal) -> Vec<ChunkPartType> {
    goal.slices
        .iter()
        .flat_map(|slice_goal| {
            (0..slice_goal.required_count() as u8)
                .map(move |part| ChunkPartType { slice: slice_goal.slice, part })
        })
        .collect()
}

fn fresh_lockid() -> LockId {
    loop {
        let id: LockId = rand::thread_rng().gen();
        if id >= 2 {
            return id;
        }
    }
}

fn locations_for(chunk_id: ChunkId, chunks: &ChunkTable, servers: &ChunkServerDb) -> Vec<ChunkLocation> {
    match chunks.get(chunk_id) {
        Ok(chunk) => chunk
            .parts
            .iter()
            .filter(|p| p.state.is_valid() || p.state.is_busy())
            .filter_map(|p| {
                let entry = servers.get(p.server_id)?;
                Some(ChunkLocation {
                    addr: entry.addr,
                    part_type: p.part_type,
                    chunkserver_version: entry.version,
                })
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Sends one chunk-lifecycle command to the chunkserver at `addr` and waits
/// for its ack, bounded by `chunkserver_op_timeout_secs`. A connect failure
/// or malformed reply comes back as [`Status::Disconnected`]/
/// [`Status::CantConnect`]; a reply that doesn't arrive in time comes back
/// as [`Status::Waiting`] so the caller can fall back to the delayed-op
/// queue instead of blocking the client indefinitely.
async fn dispatch_chunk_op(addr: Addr, op: ChunkOpPacket, config: &MasterConfig) -> Status {
    let attempt = async {
        let stream = TcpStream::connect((addr.ip, addr.port)).await.map_err(|_| Status::CantConnect)?;
        let mut framed: Framed<TcpStream, FrameCodec> =
            Framed::new(stream, FrameCodec::new(dfs_proto::types::MAX_CHUNK_SIZE + 1024));
        framed
            .send(HelloPacket { protocol_version: config.protocol_version }.encode().into_frame())
            .await
            .map_err(|_| Status::Disconnected)?;
        framed.send(op.encode().into_frame()).await.map_err(|_| Status::Disconnected)?;
        match framed.next().await {
            Some(Ok(frame)) if PacketType::try_from_u32(frame.packet_type) == Some(PacketType::ChunkOpStatus) => {
                ChunkOpStatusPacket::decode(frame.payload).map(|pkt| pkt.status).map_err(|_| Status::Disconnected)
            }
            _ => Err(Status::Disconnected),
        }
    };

    match tokio::time::timeout(Duration::from_secs(config.chunkserver_op_timeout_secs), attempt).await {
        Ok(Ok(status)) | Ok(Err(status)) => status,
        Err(_) => Status::Waiting,
    }
}

fn apply_got_status(chunks: &mut ChunkTable, kind: ChunkOpKind, id: ChunkId, server_id: ServerId, status: Status) {
    let _ = match kind {
        ChunkOpKind::Create => chunks.got_create_status(id, server_id, status),
        ChunkOpKind::Duplicate => chunks.got_duplicate_status(id, server_id, status),
        ChunkOpKind::SetVersion => chunks.got_setversion_status(id, server_id, status),
        ChunkOpKind::Truncate => chunks.got_truncate_status(id, server_id, status),
        ChunkOpKind::DupTrunc => chunks.got_duptrunc_status(id, server_id, status),
        ChunkOpKind::Delete => chunks.got_delete_status(id, server_id, status),
    };
}

fn delayed_kind_for(kind: ChunkOpKind) -> DelayedOpKind {
    match kind {
        ChunkOpKind::Create => DelayedOpKind::Create,
        ChunkOpKind::SetVersion | ChunkOpKind::Duplicate => DelayedOpKind::Modify,
        ChunkOpKind::Truncate | ChunkOpKind::DupTrunc => DelayedOpKind::Truncate,
        ChunkOpKind::Delete => DelayedOpKind::Modify,
    }
}

/// Runs one chunk op to completion against `server_id`/`addr`, settling the
/// result against `chunks_table` either synchronously (the common case) or,
/// if it times out, by queuing a [`DelayedChunkOp`] on `session_id` and
/// finishing the job from a detached task once the chunkserver finally acks.
async fn run_chunk_op(
    shared: &Arc<Shared>,
    chunks: &mut ChunkTable,
    session_id: SessionId,
    server_id: ServerId,
    addr: Option<Addr>,
    op: ChunkOpPacket,
    inode: Inode,
    lockid: LockId,
) -> Status {
    let Some(addr) = addr else {
        apply_got_status(chunks, op.kind, op.chunk_id, server_id, Status::CantConnect);
        return Status::CantConnect;
    };

    let status = dispatch_chunk_op(addr, op, &shared.config).await;
    if status != Status::Waiting {
        apply_got_status(chunks, op.kind, op.chunk_id, server_id, status);
        return status;
    }

    if let Some(session) = shared.state.sessions.lock().await.get_mut(session_id) {
        session.queue_delayed_op(DelayedChunkOp {
            chunkid: op.chunk_id,
            messageid: 0,
            inode,
            file_length: 0,
            lockid,
            kind: delayed_kind_for(op.kind),
        });
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        let final_status = loop {
            let status = dispatch_chunk_op(addr, op, &shared.config).await;
            if status != Status::Waiting {
                break status;
            }
        };
        let mut chunks = shared.state.chunks.lock().await;
        apply_got_status(&mut chunks, op.kind, op.chunk_id, server_id, final_status);
        drop(chunks);
        if let Some(session) = shared.state.sessions.lock().await.get_mut(session_id) {
            session.take_delayed_op(op.chunk_id);
        }
    });
    Status::Waiting
}

/// Allocates (or reopens) the chunk backing `(inode, index)`, places its
/// parts, and returns the chain + lockid the client should write to.
async fn handle_write_chunk(
    shared: &Arc<Shared>,
    session_id: SessionId,
    req: FuseWriteChunkPacket,
) -> FuseWriteChunkReplyPacket {
    let now = now_secs();
    let mut chunks = shared.state.chunks.lock().await;
    let mut servers = shared.state.servers.lock().await;
    let goals = shared.state.goals.lock().await;
    let mut files = shared.state.files.lock().await;

    let key = (req.inode, req.index);
    let existing = files.get(&key).copied();

    let chunk_id = match existing {
        None => {
            let goal = match goals.get(&shared.config.default_goal) {
                Some(g) => g.clone(),
                None => return error_write_reply(Status::NoChunkservers),
            };
            let id = chunks.create(&shared.config.default_goal);
            let mut cands = candidates(&servers);
            match placement::choose_servers_for_new_chunk(
                &mut cands,
                &goal,
                0,
                shared.config.avoid_same_ip,
            ) {
                Ok(picked) => {
                    let part_types = part_types_for_goal(&goal);
                    for (server_id, part_type) in picked.into_iter().zip(part_types) {
                        let _ = chunks.add_pending_part(id, server_id, part_type, 1);
                        let addr = servers.get(server_id).map(|e| e.addr);
                        let op = ChunkOpPacket {
                            kind: ChunkOpKind::Create,
                            chunk_id: id,
                            part_type,
                            new_version: 1,
                            old_version: 0,
                            copy_from: 0,
                            length: 0,
                        };
                        let status =
                            run_chunk_op(shared, &mut chunks, session_id, server_id, addr, op, req.inode, 0).await;
                        if status.is_ok() {
                            bump_chunks_created(&mut servers, server_id);
                        }
                    }
                }
                Err(err) => {
                    let _ = chunks.remove_goal_reference(id, &shared.config.default_goal);
                    return error_write_reply(err.into());
                }
            }
            id
        }
        Some(id) => {
            let exclusively_owned = chunks.get(id).map(|c| c.file_count() <= 1).unwrap_or(true);
            let old_version = chunks.get(id).map(|c| c.version).unwrap_or(1);
            let old_valid_parts: Vec<_> = chunks
                .get(id)
                .map(|c| c.parts.iter().filter(|p| p.state.is_valid()).map(|p| (p.server_id, p.part_type)).collect())
                .unwrap_or_default();

            match chunks.multi_modify(id, req.lockid.unwrap_or(0), now, exclusively_owned) {
                Ok(result) => {
                    let lockid = req.lockid.unwrap_or(0);
                    if result.new_chunk_id == id {
                        for (server_id, part_type) in old_valid_parts {
                            let addr = servers.get(server_id).map(|e| e.addr);
                            let op = ChunkOpPacket {
                                kind: ChunkOpKind::SetVersion,
                                chunk_id: id,
                                part_type,
                                new_version: result.new_version,
                                old_version,
                                copy_from: 0,
                                length: 0,
                            };
                            let _ =
                                run_chunk_op(shared, &mut chunks, session_id, server_id, addr, op, req.inode, lockid)
                                    .await;
                        }
                    } else {
                        files.insert(key, result.new_chunk_id);
                        for (server_id, part_type) in old_valid_parts {
                            let _ = chunks.add_pending_part(result.new_chunk_id, server_id, part_type, 1);
                            let addr = servers.get(server_id).map(|e| e.addr);
                            let op = ChunkOpPacket {
                                kind: ChunkOpKind::Duplicate,
                                chunk_id: result.new_chunk_id,
                                part_type,
                                new_version: 1,
                                old_version,
                                copy_from: id,
                                length: 0,
                            };
                            let _ =
                                run_chunk_op(shared, &mut chunks, session_id, server_id, addr, op, req.inode, lockid)
                                    .await;
                        }
                    }
                    result.new_chunk_id
                }
                Err(err) => return error_write_reply(err.into()),
            }
        }
    };

    files.insert(key, chunk_id);
    let lockid = fresh_lockid();
    if chunks.lock(chunk_id, lockid, now + shared.config.lock_timeout).is_err() {
        return error_write_reply(Status::ENoEnt);
    }

    let chunk_version = chunks.get(chunk_id).map(|c| c.version).unwrap_or(1);
    let locations = locations_for(chunk_id, &chunks, &servers);
    FuseWriteChunkReplyPacket { file_length: 0, chunk_id, chunk_version, lockid, locations }
}

fn bump_chunks_created(servers: &mut ChunkServerDb, server_id: ServerId) {
    if let Some(entry) = servers.get_mut(server_id) {
        entry.chunks_created += 1;
    }
}

fn error_write_reply(status: Status) -> FuseWriteChunkReplyPacket {
    // No chunk was usably allocated; signal failure with a zeroed,
    // lockless reply (a conformant client never finds a chunk id of 0).
    log::debug!("FUSE_WRITE_CHUNK failed: {status:?}");
    FuseWriteChunkReplyPacket { file_length: 0, chunk_id: 0, chunk_version: 0, lockid: 0, locations: Vec::new() }
}

async fn handle_write_chunk_end(shared: &Arc<Shared>, req: FuseWriteChunkEndPacket) {
    let mut chunks = shared.state.chunks.lock().await;
    if chunks.can_unlock(req.chunk_id, req.lockid).unwrap_or(false) {
        let _ = chunks.unlock(req.chunk_id, req.lockid);
    }
}

/// Opens `inode` for a truncate to `new_length`. Per §4.1/§6, truncating a
/// parity-bearing chunk comes back `Delayed`: the caller must pad the data
/// parts to a block boundary and follow up with `FUSE_TRUNCATE_END`.
async fn handle_truncate(
    shared: &Arc<Shared>,
    session_id: SessionId,
    req: FuseTruncatePacket,
) -> FuseTruncateReplyPacket {
    let now = now_secs();
    let mut chunks = shared.state.chunks.lock().await;
    let servers = shared.state.servers.lock().await;
    let mut files = shared.state.files.lock().await;

    // Truncate acts on the file's last chunk; with no namespace layer this
    // daemon tracks only index 0 per inode, matching the single-chunk
    // scenarios in §8.
    let key = (req.inode, 0u32);
    let Some(&chunk_id) = files.get(&key) else {
        return FuseTruncateReplyPacket {
            status: Status::ENoEnt,
            file_length: 0,
            chunk_id: 0,
            chunk_version: 0,
            lockid: 0,
            locations: Vec::new(),
        };
    };

    let exclusively_owned = chunks.get(chunk_id).map(|c| c.file_count() <= 1).unwrap_or(true);
    let old_version = chunks.get(chunk_id).map(|c| c.version).unwrap_or(1);
    let old_valid_parts: Vec<_> = chunks
        .get(chunk_id)
        .map(|c| c.parts.iter().filter(|p| p.state.is_valid()).map(|p| (p.server_id, p.part_type)).collect())
        .unwrap_or_default();
    let new_length = req.new_length as u32;
    match chunks.multi_truncate(chunk_id, 0, now, exclusively_owned) {
        Ok(result) => {
            if result.new_chunk_id == chunk_id {
                for (server_id, part_type) in old_valid_parts {
                    let addr = servers.get(server_id).map(|e| e.addr);
                    let op = ChunkOpPacket {
                        kind: ChunkOpKind::Truncate,
                        chunk_id,
                        part_type,
                        new_version: result.new_version,
                        old_version,
                        copy_from: 0,
                        length: new_length,
                    };
                    let _ = run_chunk_op(shared, &mut chunks, session_id, server_id, addr, op, req.inode, 0).await;
                }
            } else {
                for (server_id, part_type) in old_valid_parts {
                    let _ = chunks.add_pending_part(result.new_chunk_id, server_id, part_type, 1);
                    let addr = servers.get(server_id).map(|e| e.addr);
                    let op = ChunkOpPacket {
                        kind: ChunkOpKind::DupTrunc,
                        chunk_id: result.new_chunk_id,
                        part_type,
                        new_version: 1,
                        old_version,
                        copy_from: chunk_id,
                        length: new_length,
                    };
                    let _ = run_chunk_op(shared, &mut chunks, session_id, server_id, addr, op, req.inode, 0).await;
                }
            }
            files.insert(key, result.new_chunk_id);
            let lockid = fresh_lockid();
            let _ = chunks.lock(result.new_chunk_id, lockid, now + shared.config.lock_timeout);
            FuseTruncateReplyPacket {
                status: Status::Ok,
                file_length: req.new_length,
                chunk_id: result.new_chunk_id,
                chunk_version: result.new_version,
                lockid,
                locations: locations_for(result.new_chunk_id, &chunks, &servers),
            }
        }
        Err(ChunkError::NotPossible) => {
            // Parity-bearing: tell the client to round-trip a write first.
            let lockid = fresh_lockid();
            let _ = chunks.lock(chunk_id, lockid, now + shared.config.lock_timeout);
            FuseTruncateReplyPacket {
                status: Status::Delayed,
                file_length: req.new_length,
                chunk_id,
                chunk_version: chunks.get(chunk_id).map(|c| c.version).unwrap_or(0),
                lockid,
                locations: locations_for(chunk_id, &chunks, &servers),
            }
        }
        Err(err) => FuseTruncateReplyPacket {
            status: err.into(),
            file_length: 0,
            chunk_id: 0,
            chunk_version: 0,
            lockid: 0,
            locations: Vec::new(),
        },
    }
}

async fn handle_truncate_end(shared: &Arc<Shared>, req: FuseTruncateEndPacket) {
    let mut chunks = shared.state.chunks.lock().await;
    let files = shared.state.files.lock().await;
    if let Some(&chunk_id) = files.get(&(req.inode, 0)) {
        if chunks.can_unlock(chunk_id, req.lockid).unwrap_or(false) {
            let _ = chunks.unlock(chunk_id, req.lockid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_state_defaults_are_empty() {
        let state = MasterState::default();
        assert!(state.chunks.try_lock().unwrap().is_empty());
    }

    /// Binds a throwaway listener that acks every `ChunkOpPacket` with
    /// `Status::Ok`, standing in for a real chunkserver in tests that only
    /// care about the master's placement/dispatch logic.
    async fn fake_chunkserver_ack() -> Addr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, FrameCodec::new(dfs_proto::types::MAX_CHUNK_SIZE + 1024));
                    while let Some(Ok(frame)) = framed.next().await {
                        if PacketType::try_from_u32(frame.packet_type) == Some(PacketType::ChunkOp) {
                            if let Ok(op) = ChunkOpPacket::decode(frame.payload) {
                                let reply = ChunkOpStatusPacket { chunk_id: op.chunk_id, status: Status::Ok };
                                if framed.send(reply.encode().into_frame()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        Addr::new(ip, addr.port())
    }

    #[tokio::test]
    async fn write_chunk_allocates_and_places_on_connected_servers() {
        let shared = Arc::new(Shared { state: MasterState::default(), config: MasterConfig::default() });
        shared
            .state
            .goals
            .lock()
            .await
            .insert(shared.config.default_goal.clone(), Goal::standard(&shared.config.default_goal, 2));
        {
            let mut servers = shared.state.servers.lock().await;
            for _ in 1..=3 {
                let addr = fake_chunkserver_ack().await;
                servers.register(addr, "default".into(), 100, 2).unwrap();
            }
        }

        let reply = handle_write_chunk(
            &shared,
            0,
            FuseWriteChunkPacket { chunk_id_hint: 0, index: 0, inode: 5, lockid: None },
        )
        .await;

        assert_ne!(reply.chunk_id, 0);
        assert_ne!(reply.lockid, 0);
        assert_eq!(reply.locations.len(), 2);
    }

    #[tokio::test]
    async fn write_chunk_fails_without_enough_chunkservers() {
        let shared = Arc::new(Shared { state: MasterState::default(), config: MasterConfig::default() });
        shared
            .state
            .goals
            .lock()
            .await
            .insert(shared.config.default_goal.clone(), Goal::standard(&shared.config.default_goal, 2));

        let reply = handle_write_chunk(
            &shared,
            0,
            FuseWriteChunkPacket { chunk_id_hint: 0, index: 0, inode: 5, lockid: None },
        )
        .await;

        assert_eq!(reply.chunk_id, 0);
        assert_eq!(reply.lockid, 0);
    }

    #[tokio::test]
    async fn write_chunk_on_an_ec_goal_places_parity_bearing_parts() {
        let ec_goal = Goal {
            name: "ec".into(),
            slices: vec![crate::goal::SliceGoal {
                slice: dfs_proto::types::SliceType::Ec { data_k: 2, parity_m: 1 },
                label_counts: vec![("*".into(), 3)],
            }],
        };
        let shared = Arc::new(Shared {
            state: MasterState::default(),
            config: MasterConfig { default_goal: "ec".into(), ..MasterConfig::default() },
        });
        shared.state.goals.lock().await.insert("ec".into(), ec_goal);
        {
            let mut servers = shared.state.servers.lock().await;
            for _ in 1..=3 {
                let addr = fake_chunkserver_ack().await;
                servers.register(addr, "default".into(), 100, 2).unwrap();
            }
        }

        let reply = handle_write_chunk(
            &shared,
            0,
            FuseWriteChunkPacket { chunk_id_hint: 0, index: 0, inode: 5, lockid: None },
        )
        .await;

        assert_eq!(reply.locations.len(), 3);
        let chunks = shared.state.chunks.lock().await;
        let chunk = chunks.get(reply.chunk_id).unwrap();
        assert!(chunk.parts.iter().all(|p| p.part_type.slice.is_parity_bearing()));
        let mut parts: Vec<u8> = chunk.parts.iter().map(|p| p.part_type.part).collect();
        parts.sort();
        assert_eq!(parts, vec![0, 1, 2]);
    }

    /// Binds a throwaway listener that acks every `ReplicatePacket` with
    /// `Status::Ok`, standing in for the destination chunkserver of a
    /// replication order.
    async fn fake_chunkserver_replicate_ack() -> Addr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, FrameCodec::new(dfs_proto::types::MAX_CHUNK_SIZE + 1024));
                    while let Some(Ok(frame)) = framed.next().await {
                        if PacketType::try_from_u32(frame.packet_type) == Some(PacketType::Replicate) {
                            if let Ok(op) = ReplicatePacket::decode(frame.payload) {
                                let reply = ReplicateStatusPacket { chunk_id: op.chunk_id, status: Status::Ok };
                                if framed.send(reply.encode().into_frame()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        Addr::new(ip, addr.port())
    }

    #[tokio::test]
    async fn replication_dispatch_lands_a_new_valid_part_and_clears_the_busy_placeholder() {
        let shared = Arc::new(Shared { state: MasterState::default(), config: MasterConfig::default() });
        let source_addr = fake_chunkserver_ack().await;
        let dest_addr = fake_chunkserver_replicate_ack().await;

        let (chunk_id, dest_id) = {
            let mut chunks = shared.state.chunks.lock().await;
            let mut servers = shared.state.servers.lock().await;
            let source_id = servers.register(source_addr, "default".into(), 100, 2).unwrap();
            let dest_id = servers.register(dest_addr, "default".into(), 100, 2).unwrap();
            let chunk_id = chunks.create(&shared.config.default_goal);
            chunks.add_pending_part(chunk_id, source_id, ChunkPartType::standard(), 1).unwrap();
            chunks.got_create_status(chunk_id, source_id, Status::Ok).unwrap();
            (chunk_id, dest_id)
        };

        let (op, addr) = {
            let mut chunks = shared.state.chunks.lock().await;
            let servers = shared.state.servers.lock().await;
            prepare_replicate(&mut chunks, &servers, chunk_id, ChunkPartType::standard(), dest_id).unwrap()
        };
        assert_eq!(addr, dest_addr);
        assert_eq!(op.sources.len(), 1);
        {
            let chunks = shared.state.chunks.lock().await;
            let chunk = chunks.get(chunk_id).unwrap();
            assert!(chunk.parts.iter().any(|p| p.server_id == dest_id && p.state.is_busy()));
        }

        dispatch_replicate(shared.clone(), dest_id, op, addr).await;

        let chunks = shared.state.chunks.lock().await;
        let chunk = chunks.get(chunk_id).unwrap();
        assert!(chunk.parts.iter().any(|p| p.server_id == dest_id && p.state.is_valid()));
        assert!(!chunk.parts.iter().any(|p| p.server_id == dest_id && p.state.is_busy()));
    }

    #[tokio::test]
    async fn prepare_replicate_skips_a_chunk_with_no_valid_source_parts() {
        let shared = Arc::new(Shared { state: MasterState::default(), config: MasterConfig::default() });
        let mut chunks = shared.state.chunks.lock().await;
        let mut servers = shared.state.servers.lock().await;
        let dest_id = servers.register(fake_chunkserver_ack().await, "default".into(), 100, 2).unwrap();
        let chunk_id = chunks.create(&shared.config.default_goal);

        assert!(prepare_replicate(&mut chunks, &servers, chunk_id, ChunkPartType::standard(), dest_id).is_none());
    }
}
