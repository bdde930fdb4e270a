//! Network acceptor: binds the listen socket and round-robins accepted
//! connections across a fixed pool of worker tasks, each owning its own
//! non-shared `HashMap` of live `Connection`s - no mutex is needed across
//! workers by construction (§5).
//!
//! Each connection's packet dispatch drives `conn::Connection`'s decisions
//! and carries them out against `store::ChunkStore` (via the worker's
//! `JobPool`, so disk I/O never blocks the async reactor) and, for a write
//! chain, a second connection opened to the next hop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dfs_proto::frame::FrameCodec;
use dfs_proto::packets::{
    ChunkOpKind, ChunkOpPacket, ChunkOpStatusPacket, GetChunkBlocksPacket,
    GetChunkBlocksStatusPacket, HelloPacket, PacketType, PrefetchPacket, ReadDataPacket,
    ReadPacket, ReadStatusPacket, ReplicatePacket, ReplicateStatusPacket, ReplicationSource,
    WriteDataPacket, WriteEndPacket, WriteInitPacket, WriteStatusPacket,
};
use dfs_proto::types::{Addr, Capabilities, ChunkId, ChunkPartType, ServerId, Version, BLOCK_SIZE, MAX_CHUNK_SIZE};
use dfs_proto::{Dialect, Status};
use dfs_tools::TokenBucket;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::config::ChunkserverConfig;
use crate::conn::{Connection, ConnAction};
use crate::jobpool::JobPool;
use crate::readplan::{ReadPlanCounters, ReadPlanExecutor};
use crate::replicator::{Replicator, SliceRecoveryPlanner};
use crate::store::ChunkStore;

type Conn = Framed<TcpStream, FrameCodec>;

/// Shared, read-mostly state every worker task needs a handle to.
pub struct Shared {
    pub store: Arc<ChunkStore>,
    pub config: ChunkserverConfig,
}

/// Runs the accept loop until the listener errors out. Each accepted
/// socket is handed to one of `config.network_workers` worker tasks,
/// chosen round robin.
pub async fn run(shared: Arc<Shared>) -> Result<()> {
    let listener = TcpListener::bind(&shared.config.listen)
        .await
        .with_context(|| format!("failed to bind {}", shared.config.listen))?;
    log::info!("dfs_chunkserver::server listening on {}", shared.config.listen);

    let mut senders = Vec::with_capacity(shared.config.network_workers);
    for worker_id in 0..shared.config.network_workers {
        let (tx, rx) = mpsc::channel::<TcpStream>(32);
        let shared = shared.clone();
        tokio::spawn(worker_loop(worker_id, shared, rx));
        senders.push(tx);
    }

    let mut next_worker = 0usize;
    loop {
        let (socket, peer) = listener.accept().await.context("accept failed")?;
        log::debug!("accepted connection from {peer}");
        let tx = &senders[next_worker % senders.len()];
        if tx.send(socket).await.is_err() {
            log::warn!("worker {next_worker} channel closed, dropping connection from {peer}");
        }
        next_worker += 1;
    }
}

/// One network worker: owns a private connection table (so no cross-worker
/// lock is needed, §5) and a disk job pool sized by
/// `hdd_workers_per_network_worker`. Incoming connections are refused
/// outright once the pool's fill fraction crosses `JOB_QUEUE_REJECT_FRACTION`.
async fn worker_loop(worker_id: usize, shared: Arc<Shared>, mut incoming: mpsc::Receiver<TcpStream>) {
    let (job_results_tx, _job_results_rx) = mpsc::channel(256);
    let jobs = Arc::new(JobPool::new(shared.config.hdd_workers_per_network_worker, job_results_tx));
    let live: Arc<Mutex<HashMap<SocketAddr, ()>>> = Arc::new(Mutex::new(HashMap::new()));

    while let Some(socket) = incoming.recv().await {
        if jobs.fill_fraction() >= crate::config::JOB_QUEUE_REJECT_FRACTION {
            log::warn!("worker {worker_id}: job pool {:.0}% full, rejecting connection", jobs.fill_fraction() * 100.0);
            drop(socket);
            continue;
        }
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!("worker {worker_id}: could not read peer addr: {err}");
                continue;
            }
        };
        live.lock().unwrap().insert(addr, ());
        let shared = shared.clone();
        let jobs = jobs.clone();
        let live = live.clone();
        tokio::spawn(async move {
            serve_connection(socket, shared, jobs).await;
            live.lock().unwrap().remove(&addr);
        });
    }
}

/// Drives one client connection end to end: negotiates a dialect off the
/// peer's `HELLO`, then dispatches each inbound packet into `Connection`'s
/// decisions and carries those decisions out against the local store and,
/// for a write chain, the next hop. A legacy peer asking for an XOR/EC part
/// is refused rather than served.
async fn serve_connection(socket: TcpStream, shared: Arc<Shared>, jobs: Arc<JobPool>) {
    let mut framed: Conn = Framed::new(socket, FrameCodec::new(MAX_CHUNK_SIZE + 4096));

    let (dialect, capabilities) = match negotiate_dialect(&mut framed).await {
        Ok(pair) => pair,
        Err(err) => {
            log::debug!("dialect negotiation failed, closing connection: {err}");
            return;
        }
    };

    let mut conn = Connection::new();
    let mut fwd: Option<Conn> = None;
    let mut write_ctx: Option<(ChunkId, Version, ChunkPartType)> = None;

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(err) => {
                log::debug!("frame decode error, closing connection: {err}");
                break;
            }
        };

        match PacketType::try_from_u32(frame.packet_type) {
            Some(PacketType::Read) => {
                let Ok(req) = ReadPacket::decode(frame.payload, dialect) else { break };
                if !capabilities.supports(req.part_type.slice) {
                    let _ = send(&mut framed, ReadStatusPacket { chunk_id: req.chunk_id, status: Status::NotPossible }.encode()).await;
                    break;
                }
                if handle_read(&mut framed, &mut conn, &shared, &jobs, req).await.is_err() {
                    break;
                }
            }
            Some(PacketType::WriteInit) => {
                let Ok(init) = WriteInitPacket::decode(frame.payload, dialect) else { break };
                if !capabilities.supports(init.part_type.slice) {
                    let _ = send(&mut framed, WriteStatusPacket { chunk_id: init.chunk_id, write_id: 0, status: Status::NotPossible }.encode()).await;
                    break;
                }
                write_ctx = Some((init.chunk_id, init.chunk_version, init.part_type));
                if handle_write_init(&mut conn, &mut fwd, &shared, &jobs, init).await.is_err() {
                    break;
                }
            }
            Some(PacketType::WriteData) => {
                let Ok(data) = WriteDataPacket::decode(frame.payload) else { break };
                let Some((_, version, part_type)) = write_ctx else { break };
                if handle_write_data(&mut framed, &mut conn, &mut fwd, &shared, &jobs, version, part_type, data)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(PacketType::WriteEnd) => {
                let Ok(end) = WriteEndPacket::decode(frame.payload) else { break };
                handle_write_end(&mut framed, &mut conn, &mut fwd, end).await;
                write_ctx = None;
            }
            Some(PacketType::GetChunkBlocks) => {
                let Ok(req) = GetChunkBlocksPacket::decode(frame.payload) else { break };
                if handle_get_chunk_blocks(&mut framed, &mut conn, &shared, &jobs, req).await.is_err() {
                    break;
                }
            }
            Some(PacketType::Prefetch) => {
                let Ok(req) = PrefetchPacket::decode(frame.payload) else { break };
                handle_prefetch(&shared, req);
            }
            Some(PacketType::ChunkOp) => {
                let Ok(op) = ChunkOpPacket::decode(frame.payload) else { break };
                let status = handle_chunk_op(&shared, &jobs, op).await;
                if send(&mut framed, ChunkOpStatusPacket { chunk_id: op.chunk_id, status }.encode())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(PacketType::Replicate) => {
                let Ok(op) = ReplicatePacket::decode(frame.payload) else { break };
                let chunk_id = op.chunk_id;
                let status = handle_replicate(&shared, &jobs, op).await;
                if send(&mut framed, ReplicateStatusPacket { chunk_id, status }.encode()).await.is_err() {
                    break;
                }
            }
            other => {
                log::debug!("unexpected packet type {other:?} in state {:?}", conn.state());
                break;
            }
        }
    }

    if let Some(mut f) = fwd.take() {
        let _ = f.close().await;
    }
    conn.begin_close();
    conn.close_wait();
    let _ = conn.closed();
}

async fn send(framed: &mut Conn, payload: dfs_proto::packets::RawPayload) -> std::io::Result<()> {
    framed.send(payload.into_frame()).await.map_err(std::io::Error::other)
}

/// Reads the peer's `HELLO` off a freshly accepted connection and derives
/// the [`Dialect`]/[`Capabilities`] pair everything else on this connection
/// is decoded and checked against (§5, testable property I-M).
async fn negotiate_dialect(framed: &mut Conn) -> std::io::Result<(Dialect, Capabilities)> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| std::io::Error::other("connection closed before HELLO"))?
        .map_err(std::io::Error::other)?;
    if PacketType::try_from_u32(frame.packet_type) != Some(PacketType::Hello) {
        return Err(std::io::Error::other("expected HELLO as first packet"));
    }
    let hello = HelloPacket::decode(frame.payload).map_err(std::io::Error::other)?;
    Ok((Dialect::from_version(hello.protocol_version), Capabilities::from_version(hello.protocol_version)))
}

/// Opens a connection to the next chain hop and completes its own `HELLO`,
/// advertising this process's configured protocol version.
async fn connect_and_say_hello(to: Addr, config: &ChunkserverConfig) -> std::io::Result<(Conn, Dialect)> {
    let stream = connect_with_retry(to, config).await?;
    let mut f: Conn = Framed::new(stream, FrameCodec::new(MAX_CHUNK_SIZE + 4096));
    send(&mut f, HelloPacket { protocol_version: config.protocol_version }.encode()).await?;
    Ok((f, Dialect::from_version(config.protocol_version)))
}

/// `READ` pipeline (§4.3): one 64 KiB block per disk job, each packet
/// carrying its own CRC, terminated by a `READ_STATUS`. `size == 0` skips
/// straight to the terminal status.
async fn handle_read(
    framed: &mut Conn,
    conn: &mut Connection,
    shared: &Shared,
    jobs: &JobPool,
    req: ReadPacket,
) -> std::io::Result<()> {
    conn.begin_read();

    if req.size == 0 {
        send(framed, ReadStatusPacket { chunk_id: req.chunk_id, status: Status::Ok }.encode()).await?;
        conn.finish_read();
        return Ok(());
    }

    let first_block = req.offset / BLOCK_SIZE;
    let last_block = (req.offset + req.size - 1) / BLOCK_SIZE;
    let mut status = Status::Ok;

    for block in first_block..=last_block {
        let _ = conn.read_block(req.chunk_id, req.chunk_version, req.part_type, block);
        let store = shared.store.clone();
        let (id, version, part_type) = (req.chunk_id, req.chunk_version, req.part_type);
        let result = jobs.run_blocking(move || store.read_block(id, version, part_type, block)).await;
        match result {
            Ok((data, crc)) => {
                let pkt = ReadDataPacket {
                    chunk_id: req.chunk_id,
                    offset: block * BLOCK_SIZE,
                    size: data.len() as u32,
                    crc,
                    data: Bytes::from(data),
                };
                send(framed, pkt.encode()).await?;
            }
            Err(err) => {
                status = err.into();
                break;
            }
        }
    }

    send(framed, ReadStatusPacket { chunk_id: req.chunk_id, status }.encode()).await?;
    conn.finish_read();
    Ok(())
}

/// `WRITE_INIT` (§4.3): connects to the next chain hop first (if any),
/// forwarding the remaining chain so the wire dialect stays newest-first,
/// then ensures the local part exists.
async fn handle_write_init(
    conn: &mut Connection,
    fwd: &mut Option<Conn>,
    shared: &Shared,
    jobs: &JobPool,
    init: WriteInitPacket,
) -> std::io::Result<()> {
    let next_hop = init.chain.first().copied();
    let remaining: Vec<Addr> = if init.chain.is_empty() { Vec::new() } else { init.chain[1..].to_vec() };

    for action in conn.begin_write(next_hop) {
        if let ConnAction::ConnectNext { to } = action {
            match connect_and_say_hello(to, &shared.config).await {
                Ok((mut f, dialect)) => {
                    let fwd_init = WriteInitPacket {
                        chunk_id: init.chunk_id,
                        chunk_version: init.chunk_version,
                        part_type: init.part_type,
                        chain: remaining.clone(),
                    };
                    send(&mut f, fwd_init.encode(dialect)).await?;
                    *fwd = Some(f);
                    conn.on_connected();
                }
                Err(err) => {
                    log::debug!("could not connect to next hop {to:?}: {err}");
                    return Err(err);
                }
            }
        }
    }

    let store = shared.store.clone();
    let (id, version, part_type) = (init.chunk_id, init.chunk_version, init.part_type);
    jobs.run_blocking(move || {
        let _ = store.create(id, version, part_type);
    })
    .await;
    Ok(())
}

/// `CHUNK_OP` (§4.1): the master-to-chunkserver leg of create/duplicate/
/// set-version/truncate/duptrunc/delete, run on the job pool like any other
/// disk access.
async fn handle_chunk_op(shared: &Shared, jobs: &JobPool, op: ChunkOpPacket) -> Status {
    let store = shared.store.clone();
    jobs.run_blocking(move || {
        let result = match op.kind {
            ChunkOpKind::Create => store.create(op.chunk_id, op.new_version, op.part_type),
            ChunkOpKind::SetVersion => {
                store.bump_version(op.chunk_id, op.old_version, op.new_version, op.part_type)
            }
            ChunkOpKind::Truncate => {
                store.truncate(op.chunk_id, op.old_version, op.new_version, op.part_type, op.length as u64)
            }
            ChunkOpKind::Duplicate => {
                store.duplicate(op.copy_from, op.old_version, op.chunk_id, op.new_version, op.part_type)
            }
            ChunkOpKind::DupTrunc => store
                .duplicate(op.copy_from, op.old_version, op.chunk_id, op.new_version, op.part_type)
                .and_then(|()| {
                    store.truncate(op.chunk_id, op.new_version, op.new_version, op.part_type, op.length as u64)
                }),
            ChunkOpKind::Delete => store.delete(op.chunk_id, op.old_version, op.part_type),
        };
        match result {
            Ok(()) => Status::Ok,
            Err(err) => err.into(),
        }
    })
    .await
}

/// `REPLICATE` (§4.4): rebuilds `op.part_type`, which this chunkserver is
/// missing, from whatever other parts of the chunk `op.sources` can supply.
/// Wave 1 pulls every source [`Replicator::sources_needed`] says is
/// minimally required; any source that errors or blows its per-wave timeout
/// is substituted, wave by wave, with a source that wasn't strictly needed
/// but happens to be available, bounded overall by `read_plan_total_timeout_ms`.
/// Each logical block is then handed to a [`ReadPlanExecutor`] to pick which
/// finished sources it actually needs and reconstruct from them, mirroring
/// the wave bookkeeping a client read would do; the reconstructed bytes are
/// paced through the bandwidth limiter the same as a single-source recovery
/// before landing on disk via `ChunkStore::write_full`.
async fn handle_replicate(shared: &Shared, jobs: &JobPool, op: ReplicatePacket) -> Status {
    let limiter =
        TokenBucket::new(shared.config.replication_bandwidth_kbps, BLOCK_SIZE as u64 * shared.config.replication_batch_blocks as u64);
    let replicator = Replicator::new(op.part_type.slice, &limiter, shared.config.replication_batch_blocks);
    let max_wait = Duration::from_secs(shared.config.cssserv_timeout_secs);
    let total_timeout = Duration::from_millis(shared.config.read_plan_total_timeout_ms);
    let deadline = tokio::time::Instant::now() + total_timeout;

    let available: Vec<u8> = op.sources.iter().map(|s| s.part_type.part).collect();
    let needed = match replicator.sources_needed(&available, op.part_type.part) {
        Ok(parts) => parts,
        Err(err) => return err.into(),
    };
    let mut spare: Vec<u8> = available.into_iter().filter(|p| !needed.contains(p)).collect();

    let mut fetched: HashMap<u8, Vec<(Vec<u8>, u32)>> = HashMap::new();
    for &part_index in &needed {
        let Some(source) = op.sources.iter().find(|s| s.part_type.part == part_index) else { continue };
        if let Ok(blocks) = fetch_part_blocks_with_timeout(source.addr, &shared.config, op.chunk_id, op.version, source.part_type).await {
            fetched.insert(part_index, blocks);
        }
    }
    while replicator.sources_needed(&fetched.keys().copied().collect::<Vec<_>>(), op.part_type.part).is_err() {
        if tokio::time::Instant::now() >= deadline || spare.is_empty() {
            return Status::Disconnected;
        }
        let part_index = spare.remove(0);
        let Some(source) = op.sources.iter().find(|s| s.part_type.part == part_index) else { continue };
        if let Ok(blocks) = fetch_part_blocks_with_timeout(source.addr, &shared.config, op.chunk_id, op.version, source.part_type).await {
            fetched.insert(part_index, blocks);
        }
    }

    let nblocks = fetched.values().map(|blocks| blocks.len()).min().unwrap_or(0);
    let mut rebuilt = Vec::with_capacity(nblocks);
    let mut counters = ReadPlanCounters::default();
    for block in 0..nblocks {
        let mut exec = ReadPlanExecutor::new(SliceRecoveryPlanner::new(op.part_type.slice), op.part_type.part);
        let first_wave: Vec<(ServerId, u8)> = needed.iter().enumerate().map(|(i, &p)| (i as ServerId, p)).collect();
        exec.start(&first_wave);
        for &(id, part) in &first_wave {
            if let Some(blocks) = fetched.get(&part).filter(|b| block < b.len()) {
                exec.on_data_block(id, blocks[block].0.clone());
            }
        }
        if !exec.ready() {
            let later_wave: Vec<(ServerId, u8)> = fetched
                .keys()
                .filter(|p| !needed.contains(p))
                .enumerate()
                .map(|(i, &p)| ((first_wave.len() + i) as ServerId, p))
                .collect();
            exec.add_wave(&later_wave);
            for &(id, part) in &later_wave {
                if let Some(blocks) = fetched.get(&part).filter(|b| block < b.len()) {
                    exec.on_data_block(id, blocks[block].0.clone());
                }
            }
        }
        if !exec.ready() {
            return Status::Disconnected;
        }
        let data = match replicator.recover_block(op.part_type.part, &exec.finished(), max_wait).await {
            Ok(data) => data,
            Err(err) => return err.into(),
        };
        let crc = dfs_tools::crc::crc32(0, &data);
        rebuilt.push((data, crc));

        let c = exec.counters();
        counters.total_executions += c.total_executions;
        counters.needed_wave1_plus += c.needed_wave1_plus;
        counters.rescued_by_later_wave += c.rescued_by_later_wave;
    }
    log::debug!(
        "replicate {}/{:?}: {} block reads, {} needed a later wave, {} rescued by one",
        op.chunk_id,
        op.part_type,
        counters.total_executions,
        counters.needed_wave1_plus,
        counters.rescued_by_later_wave,
    );

    let store = shared.store.clone();
    let (id, version, part_type) = (op.chunk_id, op.version, op.part_type);
    let result = jobs.run_blocking(move || store.write_full(id, version, part_type, &rebuilt)).await;
    match result {
        Ok(()) => Status::Ok,
        Err(err) => err.into(),
    }
}

/// Fetches one source's whole part, bounded by `read_plan_wave_timeout_ms` so
/// a stalled peer is abandoned in favor of a later wave rather than stalling
/// the whole replication.
async fn fetch_part_blocks_with_timeout(
    addr: Addr,
    config: &ChunkserverConfig,
    chunk_id: ChunkId,
    version: Version,
    part_type: ChunkPartType,
) -> std::io::Result<Vec<(Vec<u8>, u32)>> {
    let wave_timeout = Duration::from_millis(config.read_plan_wave_timeout_ms);
    match tokio::time::timeout(wave_timeout, fetch_part_blocks(addr, config, chunk_id, version, part_type)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::other("read-plan wave timeout waiting for source")),
    }
}

/// Reads one whole chunk part from a peer chunkserver: `GET_CHUNK_BLOCKS`
/// for the block count, then `READ` for the data, keeping each reply's
/// block/CRC pairing intact for [`handle_replicate`]'s reconstruction.
async fn fetch_part_blocks(
    addr: Addr,
    config: &ChunkserverConfig,
    chunk_id: ChunkId,
    version: Version,
    part_type: ChunkPartType,
) -> std::io::Result<Vec<(Vec<u8>, u32)>> {
    let (mut framed, dialect) = connect_and_say_hello(addr, config).await?;

    send(&mut framed, GetChunkBlocksPacket { chunk_id, chunk_version: version, part_type }.encode()).await?;
    let frame = recv(&mut framed).await?;
    if PacketType::try_from_u32(frame.packet_type) != Some(PacketType::GetChunkBlocksStatus) {
        return Err(std::io::Error::other("unexpected reply to GET_CHUNK_BLOCKS"));
    }
    let status_pkt = GetChunkBlocksStatusPacket::decode(frame.payload).map_err(std::io::Error::other)?;
    if !status_pkt.status.is_ok() {
        return Err(std::io::Error::other(format!("source refused GET_CHUNK_BLOCKS: {:?}", status_pkt.status)));
    }
    if status_pkt.nblocks == 0 {
        return Ok(Vec::new());
    }

    let size = status_pkt.nblocks as u32 * BLOCK_SIZE;
    send(
        &mut framed,
        ReadPacket { chunk_id, chunk_version: version, part_type, offset: 0, size }.encode(dialect),
    )
    .await?;

    let mut blocks = Vec::with_capacity(status_pkt.nblocks as usize);
    loop {
        let frame = recv(&mut framed).await?;
        match PacketType::try_from_u32(frame.packet_type) {
            Some(PacketType::ReadData) => {
                let pkt = ReadDataPacket::decode(frame.payload).map_err(std::io::Error::other)?;
                blocks.push((pkt.data.to_vec(), pkt.crc));
            }
            Some(PacketType::ReadStatus) => {
                let pkt = ReadStatusPacket::decode(frame.payload).map_err(std::io::Error::other)?;
                if !pkt.status.is_ok() {
                    return Err(std::io::Error::other(format!("source refused READ: {:?}", pkt.status)));
                }
                return Ok(blocks);
            }
            _ => return Err(std::io::Error::other("unexpected packet in READ reply")),
        }
    }
}

async fn recv(framed: &mut Conn) -> std::io::Result<dfs_proto::frame::RawFrame> {
    match framed.next().await {
        Some(frame) => frame,
        None => Err(std::io::Error::other("connection closed early")),
    }
}

/// `WRITE_DATA`: local disk write and forward to the next hop
/// both happen before an upstream ack is produced; a middle link's ack
/// joins both the local completion and the downstream `WRITE_STATUS`.
#[allow(clippy::too_many_arguments)]
async fn handle_write_data(
    framed: &mut Conn,
    conn: &mut Connection,
    fwd: &mut Option<Conn>,
    shared: &Shared,
    jobs: &JobPool,
    version: Version,
    part_type: ChunkPartType,
    data: WriteDataPacket,
) -> std::io::Result<()> {
    let actions = conn.accept_block(data.chunk_id, version, part_type, data.block as u32, data.write_id);

    let mut local_status = Status::Ok;
    let mut downstream_status = Status::Ok;

    for action in actions {
        match action {
            ConnAction::WriteBlockLocal { id, version, part, block, .. } => {
                let store = shared.store.clone();
                let bytes = data.data.to_vec();
                let crc = data.crc;
                local_status = jobs
                    .run_blocking(move || match store.write_block(id, version, part, block, &bytes, crc) {
                        Ok(()) => Status::Ok,
                        Err(err) => err.into(),
                    })
                    .await;
            }
            ConnAction::ForwardBlock { id, block, write_id, .. } => {
                let Some(f) = fwd.as_mut() else { continue };
                let fwd_pkt = WriteDataPacket {
                    chunk_id: id,
                    write_id,
                    block: block as u16,
                    offset: data.offset,
                    size: data.size,
                    crc: data.crc,
                    data: data.data.clone(),
                };
                if send(f, fwd_pkt.encode()).await.is_err() {
                    downstream_status = Status::Disconnected;
                    continue;
                }
                match f.next().await {
                    Some(Ok(reply)) => match WriteStatusPacket::decode(reply.payload) {
                        Ok(status_pkt) => downstream_status = status_pkt.status,
                        Err(_) => downstream_status = Status::Disconnected,
                    },
                    _ => downstream_status = Status::Disconnected,
                }
            }
            _ => {}
        }
    }

    let combined = if !local_status.is_ok() {
        local_status
    } else if !downstream_status.is_ok() {
        downstream_status
    } else {
        Status::Ok
    };
    for action in conn.on_block_done(data.write_id, data.block as u32, combined) {
        if let ConnAction::ReplyStatus { write_id, status } = action {
            send(framed, WriteStatusPacket { chunk_id: data.chunk_id, write_id, status }.encode()).await?;
        }
    }
    Ok(())
}

/// `WRITE_END` (§5's chain-ack ordering rule): only honored once every
/// local write and downstream ack for this session has landed; otherwise
/// fatal.
async fn handle_write_end(framed: &mut Conn, conn: &mut Connection, fwd: &mut Option<Conn>, end: WriteEndPacket) {
    let quiescent = conn.can_honor_write_end();
    for action in conn.on_write_end() {
        if let ConnAction::ReplyStatus { write_id, status } = action {
            let _ = send(framed, WriteStatusPacket { chunk_id: end.chunk_id, write_id, status }.encode()).await;
        }
    }
    if quiescent {
        if let Some(f) = fwd.as_mut() {
            let _ = send(f, WriteEndPacket { chunk_id: end.chunk_id }.encode()).await;
        }
        conn.reset_to_idle();
    }
}

/// `GET_CHUNK_BLOCKS` (CS<->CS listing ahead of a replication read, §4.4).
async fn handle_get_chunk_blocks(
    framed: &mut Conn,
    conn: &mut Connection,
    shared: &Shared,
    jobs: &JobPool,
    req: GetChunkBlocksPacket,
) -> std::io::Result<()> {
    conn.begin_get_blocks();
    let store = shared.store.clone();
    let (id, part) = (req.chunk_id, req.part_type);
    let meta = jobs.run_blocking(move || store.meta(id, part.part)).await;
    let (nblocks, status) = match meta {
        Some(m) if m.version == req.chunk_version => (m.block_count as u16, Status::Ok),
        Some(_) => (0, Status::WrongVersion),
        None => (0, Status::WrongChunkId),
    };
    send(
        framed,
        GetChunkBlocksStatusPacket {
            chunk_id: req.chunk_id,
            chunk_version: req.chunk_version,
            part_type: req.part_type,
            nblocks,
            status,
        }
        .encode(),
    )
    .await?;
    conn.finish_get_blocks();
    Ok(())
}

/// Best-effort prefetch: warms the store's read path without a reply, only
/// ever issued by clients whose advertised version supports it (§4.3).
fn handle_prefetch(shared: &Shared, req: PrefetchPacket) {
    let store = shared.store.clone();
    tokio::spawn(async move {
        let first_block = req.offset / BLOCK_SIZE;
        let last_block = if req.size == 0 { first_block } else { (req.offset + req.size - 1) / BLOCK_SIZE };
        for block in first_block..=last_block {
            let store = store.clone();
            let (id, version, part_type) = (req.chunk_id, req.chunk_version, req.part_type);
            let _ = tokio::task::spawn_blocking(move || store.read_block(id, version, part_type, block)).await;
        }
    });
}

/// Opens a non-blocking TCP connection to the next chain hop, retrying with
/// exponential backoff per §4.3/§5 (`connect_retry_limit` attempts starting
/// at `connect_retry_base_ms`).
async fn connect_with_retry(to: Addr, config: &ChunkserverConfig) -> std::io::Result<TcpStream> {
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(config.connect_retry_base_ms);
    loop {
        match TcpStream::connect((to.ip, to.port)).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                attempt += 1;
                if attempt >= config.connect_retry_limit {
                    return Err(err);
                }
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
}
