//! A direct connection to a single chunkserver, speaking the same framed
//! wire protocol `dfs_chunkserver::conn` decodes server-side. Used by
//! integration tests to drive a write chain or a read without a real FUSE
//! mount in front of it - the same role `pbs_client::BackupWriter`/
//! `BackupReader` play for the HTTP/H2 side of the original crate.

use bytes::Bytes;
use dfs_proto::frame::FrameCodec;
use dfs_proto::packets::{
    HelloPacket, ReadDataPacket, ReadPacket, ReadStatusPacket, WriteDataPacket, WriteEndPacket,
    WriteInitPacket, WriteStatusPacket,
};
use dfs_proto::types::{Addr, ChunkId, ChunkPartType, Version, WriteId, BLOCK_SIZE};
use dfs_proto::{Dialect, Status};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::errors::{ClientError, ClientResult};

/// A chunk's contents read back in full, block checksums already verified.
pub struct ReadChunk {
    pub data: Vec<u8>,
}

pub struct ChunkserverClient {
    framed: Framed<TcpStream, FrameCodec>,
    dialect: Dialect,
}

impl ChunkserverClient {
    pub async fn connect(addr: Addr, dialect: Dialect) -> ClientResult<Self> {
        let stream = TcpStream::connect((addr.ip, addr.port)).await?;
        let mut framed = Framed::new(stream, FrameCodec::new(BLOCK_SIZE + 4096));
        let protocol_version = match dialect {
            Dialect::Legacy => 0,
            Dialect::LizardFs => 3,
        };
        framed
            .send(HelloPacket { protocol_version }.encode().into_frame())
            .await?;
        Ok(ChunkserverClient { framed, dialect })
    }

    /// Writes `data` to `chunk_id`/`chunk_version` as a chain write:
    /// `chain` names the remaining hops past this connection (empty for a
    /// single-chunkserver write), mirroring
    /// [`dfs_chunkserver::conn::Connection::begin_write`]'s ordering.
    pub async fn write_chunk(
        &mut self,
        chunk_id: ChunkId,
        chunk_version: Version,
        part_type: ChunkPartType,
        chain: Vec<Addr>,
        data: &[u8],
    ) -> ClientResult<()> {
        self.send(WriteInitPacket { chunk_id, chunk_version, part_type, chain }.encode(self.dialect))
            .await?;

        for (block, bytes) in data.chunks(BLOCK_SIZE as usize).enumerate() {
            let write_id: WriteId = block as u32 + 1;
            let crc = dfs_tools::crc::crc32(0, bytes);
            self.send(
                WriteDataPacket {
                    chunk_id,
                    write_id,
                    block: block as u16,
                    offset: 0,
                    size: bytes.len() as u32,
                    crc,
                    data: Bytes::copy_from_slice(bytes),
                }
                .encode(),
            )
            .await?;

            let status = self.recv_write_status(write_id).await?;
            if !status.is_ok() {
                return Err(ClientError::Remote(status));
            }
        }

        self.send(WriteEndPacket { chunk_id }.encode()).await?;
        Ok(())
    }

    /// Reads `size` bytes at `offset` from `chunk_id`/`chunk_version`,
    /// collecting the server's stream of `ReadDataPacket`s until the
    /// trailing `ReadStatusPacket` arrives.
    pub async fn read_chunk(
        &mut self,
        chunk_id: ChunkId,
        chunk_version: Version,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    ) -> ClientResult<ReadChunk> {
        self.send(ReadPacket { chunk_id, chunk_version, part_type, offset, size }.encode(self.dialect))
            .await?;

        let mut data = Vec::with_capacity(size as usize);
        loop {
            let frame = self.next_frame().await?;
            match dfs_proto::packets::PacketType::try_from_u32(frame.packet_type) {
                Some(dfs_proto::packets::PacketType::ReadData) => {
                    let pkt = ReadDataPacket::decode(frame.payload)?;
                    let crc = dfs_tools::crc::crc32(0, &pkt.data);
                    if crc != pkt.crc {
                        return Err(ClientError::Remote(Status::CrcMismatch));
                    }
                    data.extend_from_slice(&pkt.data);
                }
                Some(dfs_proto::packets::PacketType::ReadStatus) => {
                    let pkt = ReadStatusPacket::decode(frame.payload)?;
                    if !pkt.status.is_ok() {
                        return Err(ClientError::Remote(pkt.status));
                    }
                    return Ok(ReadChunk { data });
                }
                _ => return Err(ClientError::UnexpectedPacketType(frame.packet_type)),
            }
        }
    }

    async fn recv_write_status(&mut self, expected_write_id: WriteId) -> ClientResult<Status> {
        let frame = self.next_frame().await?;
        if dfs_proto::packets::PacketType::try_from_u32(frame.packet_type)
            != Some(dfs_proto::packets::PacketType::WriteStatus)
        {
            return Err(ClientError::UnexpectedPacketType(frame.packet_type));
        }
        let pkt = WriteStatusPacket::decode(frame.payload)?;
        if pkt.write_id != expected_write_id {
            return Err(ClientError::UnexpectedPacketType(frame.packet_type));
        }
        Ok(pkt.status)
    }

    async fn send(&mut self, payload: dfs_proto::packets::RawPayload) -> ClientResult<()> {
        self.framed.send(payload.into_frame()).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> ClientResult<dfs_proto::frame::RawFrame> {
        match self.framed.next().await {
            Some(frame) => Ok(frame?),
            None => Err(ClientError::ClosedEarly),
        }
    }
}
