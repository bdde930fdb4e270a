//! Typed packet payloads for the packet families in the external
//! interfaces table, plus the dialect-aware encode/decode glue.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::status::Status;
use crate::types::{
    payload_version, Addr, ChunkId, ChunkPartType, Dialect, Inode, LockId, ServerId, SliceType,
    Version, WriteId,
};

/// Wire tag for every packet family this core implements.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Read = 1,
    ReadData = 2,
    ReadStatus = 3,
    WriteInit = 4,
    WriteData = 5,
    WriteStatus = 6,
    WriteEnd = 7,
    GetChunkBlocks = 8,
    GetChunkBlocksStatus = 9,
    FuseWriteChunk = 10,
    FuseWriteChunkReply = 11,
    FuseWriteChunkEnd = 12,
    FuseTruncate = 13,
    FuseTruncateEnd = 14,
    Prefetch = 15,
    TestChunk = 16,
    FuseTruncateReply = 17,
    /// First packet on every fresh connection: advertises the sender's
    /// protocol version so the receiver can pick a [`Dialect`] and derive
    /// [`crate::types::Capabilities`] before anything else is decoded.
    Hello = 18,
    /// Master-to-chunkserver chunk lifecycle command (§4.1: create,
    /// duplicate, set version, truncate, duptrunc, delete).
    ChunkOp = 19,
    ChunkOpStatus = 20,
    /// Master-to-chunkserver replication order (§4.4): rebuild a missing
    /// part of a chunk by pulling the other parts from the listed sources.
    Replicate = 21,
    ReplicateStatus = 22,
}

impl PacketType {
    pub fn try_from_u32(v: u32) -> Option<PacketType> {
        use PacketType::*;
        Some(match v {
            1 => Read,
            2 => ReadData,
            3 => ReadStatus,
            4 => WriteInit,
            5 => WriteData,
            6 => WriteStatus,
            7 => WriteEnd,
            8 => GetChunkBlocks,
            9 => GetChunkBlocksStatus,
            10 => FuseWriteChunk,
            11 => FuseWriteChunkReply,
            12 => FuseWriteChunkEnd,
            13 => FuseTruncate,
            14 => FuseTruncateEnd,
            15 => Prefetch,
            16 => TestChunk,
            17 => FuseTruncateReply,
            18 => Hello,
            19 => ChunkOp,
            20 => ChunkOpStatus,
            21 => Replicate,
            22 => ReplicateStatus,
            _ => return None,
        })
    }

    /// The payload-version constant a LizardFS-dialect packet of this type
    /// carries.
    fn payload_version_for(self, part: Option<SliceType>) -> u32 {
        match part {
            Some(SliceType::Ec { .. }) | Some(SliceType::Ec2 { .. }) => {
                payload_version::EC_CHUNKS
            }
            _ => payload_version::STANDARD_AND_XOR_CHUNKS,
        }
    }
}

fn encode_part_type(buf: &mut BytesMut, pt: ChunkPartType) {
    match pt.slice {
        SliceType::Standard => {
            buf.put_u8(0);
            buf.put_u8(pt.part);
        }
        SliceType::Xor { level } => {
            buf.put_u8(1);
            buf.put_u8(level);
            buf.put_u8(pt.part);
        }
        SliceType::Ec { data_k, parity_m } => {
            buf.put_u8(2);
            buf.put_u8(data_k);
            buf.put_u8(parity_m);
            buf.put_u8(pt.part);
        }
        SliceType::Ec2 { data_k, parity_m } => {
            buf.put_u8(3);
            buf.put_u8(data_k);
            buf.put_u8(parity_m);
            buf.put_u8(pt.part);
        }
    }
}

fn decode_part_type(buf: &mut Bytes, packet_type: u32) -> Result<ChunkPartType, ProtoError> {
    need(buf, 1, packet_type)?;
    let tag = buf.get_u8();
    Ok(match tag {
        0 => {
            need(buf, 1, packet_type)?;
            ChunkPartType {
                slice: SliceType::Standard,
                part: buf.get_u8(),
            }
        }
        1 => {
            need(buf, 2, packet_type)?;
            let level = buf.get_u8();
            let part = buf.get_u8();
            ChunkPartType {
                slice: SliceType::Xor { level },
                part,
            }
        }
        2 => {
            need(buf, 3, packet_type)?;
            let data_k = buf.get_u8();
            let parity_m = buf.get_u8();
            let part = buf.get_u8();
            ChunkPartType {
                slice: SliceType::Ec { data_k, parity_m },
                part,
            }
        }
        3 => {
            need(buf, 3, packet_type)?;
            let data_k = buf.get_u8();
            let parity_m = buf.get_u8();
            let part = buf.get_u8();
            ChunkPartType {
                slice: SliceType::Ec2 { data_k, parity_m },
                part,
            }
        }
        other => {
            return Err(ProtoError::WrongPayloadVersion {
                packet_type,
                version: other as u32,
            })
        }
    })
}

fn encode_addr(buf: &mut BytesMut, addr: Addr) {
    buf.put_u32(u32::from(addr.ip));
    buf.put_u16(addr.port);
}

fn decode_addr(buf: &mut Bytes, packet_type: u32) -> Result<Addr, ProtoError> {
    need(buf, 6, packet_type)?;
    let ip = std::net::Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    Ok(Addr::new(ip, port))
}

fn need(buf: &Bytes, n: usize, packet_type: u32) -> Result<(), ProtoError> {
    if buf.len() < n {
        Err(ProtoError::Truncated {
            packet_type,
            need: n,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Writes the LizardFS-dialect `version:u32` payload prefix; a no-op under
/// the legacy dialect.
fn put_dialect_prefix(buf: &mut BytesMut, dialect: Dialect, version: u32) {
    if dialect == Dialect::LizardFs {
        buf.put_u32(version);
    }
}

fn take_dialect_prefix(
    buf: &mut Bytes,
    dialect: Dialect,
    packet_type: u32,
) -> Result<(), ProtoError> {
    if dialect == Dialect::LizardFs {
        need(buf, 4, packet_type)?;
        buf.get_u32();
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPacket {
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub part_type: ChunkPartType,
    pub offset: u32,
    pub size: u32,
}

impl ReadPacket {
    pub fn encode(&self, dialect: Dialect) -> RawPayload {
        let mut buf = BytesMut::new();
        put_dialect_prefix(
            &mut buf,
            dialect,
            PacketType::Read.payload_version_for(Some(self.part_type.slice)),
        );
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        encode_part_type(&mut buf, self.part_type);
        buf.put_u32(self.offset);
        buf.put_u32(self.size);
        RawPayload::new(PacketType::Read, buf.freeze())
    }

    pub fn decode(mut buf: Bytes, dialect: Dialect) -> Result<Self, ProtoError> {
        let pt = PacketType::Read as u32;
        take_dialect_prefix(&mut buf, dialect, pt)?;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        need(&buf, 8, pt)?;
        let offset = buf.get_u32();
        let size = buf.get_u32();
        Ok(ReadPacket {
            chunk_id,
            chunk_version,
            part_type,
            offset,
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadDataPacket {
    pub chunk_id: ChunkId,
    pub offset: u32,
    pub size: u32,
    pub crc: u32,
    pub data: Bytes,
}

impl ReadDataPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(20 + self.data.len());
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.offset);
        buf.put_u32(self.size);
        buf.put_u32(self.crc);
        buf.extend_from_slice(&self.data);
        RawPayload::new(PacketType::ReadData, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::ReadData as u32;
        need(&buf, 20, pt)?;
        let chunk_id = buf.get_u64();
        let offset = buf.get_u32();
        let size = buf.get_u32();
        let crc = buf.get_u32();
        need(&buf, size as usize, pt)?;
        let data = buf.copy_to_bytes(size as usize);
        Ok(ReadDataPacket {
            chunk_id,
            offset,
            size,
            crc,
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadStatusPacket {
    pub chunk_id: ChunkId,
    pub status: Status,
}

impl ReadStatusPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64(self.chunk_id);
        buf.put_u8(self.status as u8);
        RawPayload::new(PacketType::ReadStatus, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::ReadStatus as u32;
        need(&buf, 9, pt)?;
        let chunk_id = buf.get_u64();
        let status_byte = buf.get_u8();
        let status = Status::try_from_u8(status_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: status_byte as u32 })?;
        Ok(ReadStatusPacket { chunk_id, status })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteInitPacket {
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub part_type: ChunkPartType,
    /// Ordered by decreasing chunkserver protocol version, so the forwarded
    /// packet is in the newest dialect the next hop can parse.
    pub chain: Vec<Addr>,
}

impl WriteInitPacket {
    pub fn encode(&self, dialect: Dialect) -> RawPayload {
        let mut buf = BytesMut::new();
        put_dialect_prefix(
            &mut buf,
            dialect,
            PacketType::WriteInit.payload_version_for(Some(self.part_type.slice)),
        );
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        encode_part_type(&mut buf, self.part_type);
        buf.put_u32(self.chain.len() as u32);
        for addr in &self.chain {
            encode_addr(&mut buf, *addr);
        }
        RawPayload::new(PacketType::WriteInit, buf.freeze())
    }

    pub fn decode(mut buf: Bytes, dialect: Dialect) -> Result<Self, ProtoError> {
        let pt = PacketType::WriteInit as u32;
        take_dialect_prefix(&mut buf, dialect, pt)?;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        need(&buf, 4, pt)?;
        let count = buf.get_u32();
        let mut chain = Vec::with_capacity(count as usize);
        for _ in 0..count {
            chain.push(decode_addr(&mut buf, pt)?);
        }
        Ok(WriteInitPacket {
            chunk_id,
            chunk_version,
            part_type,
            chain,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteDataPacket {
    pub chunk_id: ChunkId,
    pub write_id: WriteId,
    pub block: u16,
    pub offset: u32,
    pub size: u32,
    pub crc: u32,
    pub data: Bytes,
}

impl WriteDataPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(26 + self.data.len());
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.write_id);
        buf.put_u16(self.block);
        buf.put_u32(self.offset);
        buf.put_u32(self.size);
        buf.put_u32(self.crc);
        buf.extend_from_slice(&self.data);
        RawPayload::new(PacketType::WriteData, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::WriteData as u32;
        need(&buf, 26, pt)?;
        let chunk_id = buf.get_u64();
        let write_id = buf.get_u32();
        let block = buf.get_u16();
        let offset = buf.get_u32();
        let size = buf.get_u32();
        let crc = buf.get_u32();
        need(&buf, size as usize, pt)?;
        let data = buf.copy_to_bytes(size as usize);
        Ok(WriteDataPacket {
            chunk_id,
            write_id,
            block,
            offset,
            size,
            crc,
            data,
        })
    }

    /// The 8-byte header copied verbatim into the forward mirror when this
    /// packet is relayed down a write chain.
    pub fn header(&self) -> [u8; 8] {
        let mut h = [0u8; 8];
        h[0..2].copy_from_slice(&self.block.to_be_bytes());
        h[2..6].copy_from_slice(&self.write_id.to_be_bytes());
        h[6..8].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        h
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteStatusPacket {
    pub chunk_id: ChunkId,
    pub write_id: WriteId,
    pub status: Status,
}

impl WriteStatusPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(13);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.write_id);
        buf.put_u8(self.status as u8);
        RawPayload::new(PacketType::WriteStatus, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::WriteStatus as u32;
        need(&buf, 13, pt)?;
        let chunk_id = buf.get_u64();
        let write_id = buf.get_u32();
        let status_byte = buf.get_u8();
        let status = Status::try_from_u8(status_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: status_byte as u32 })?;
        Ok(WriteStatusPacket {
            chunk_id,
            write_id,
            status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteEndPacket {
    pub chunk_id: ChunkId,
}

impl WriteEndPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.chunk_id);
        RawPayload::new(PacketType::WriteEnd, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::WriteEnd as u32;
        need(&buf, 8, pt)?;
        Ok(WriteEndPacket {
            chunk_id: buf.get_u64(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetChunkBlocksPacket {
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub part_type: ChunkPartType,
}

impl GetChunkBlocksPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        encode_part_type(&mut buf, self.part_type);
        RawPayload::new(PacketType::GetChunkBlocks, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::GetChunkBlocks as u32;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        Ok(GetChunkBlocksPacket {
            chunk_id,
            chunk_version,
            part_type,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetChunkBlocksStatusPacket {
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub part_type: ChunkPartType,
    pub nblocks: u16,
    pub status: Status,
}

impl GetChunkBlocksStatusPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(19);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        encode_part_type(&mut buf, self.part_type);
        buf.put_u16(self.nblocks);
        buf.put_u8(self.status as u8);
        RawPayload::new(PacketType::GetChunkBlocksStatus, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::GetChunkBlocksStatus as u32;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        need(&buf, 3, pt)?;
        let nblocks = buf.get_u16();
        let status_byte = buf.get_u8();
        let status = Status::try_from_u8(status_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: status_byte as u32 })?;
        Ok(GetChunkBlocksStatusPacket {
            chunk_id,
            chunk_version,
            part_type,
            nblocks,
            status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuseWriteChunkPacket {
    pub chunk_id_hint: ChunkId,
    pub index: u32,
    pub inode: Inode,
    pub lockid: Option<LockId>,
}

impl FuseWriteChunkPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(21);
        buf.put_u64(self.chunk_id_hint);
        buf.put_u32(self.index);
        buf.put_u32(self.inode);
        match self.lockid {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u32(id);
            }
            None => buf.put_u8(0),
        }
        RawPayload::new(PacketType::FuseWriteChunk, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::FuseWriteChunk as u32;
        need(&buf, 17, pt)?;
        let chunk_id_hint = buf.get_u64();
        let index = buf.get_u32();
        let inode = buf.get_u32();
        let has_lockid = buf.get_u8();
        let lockid = if has_lockid != 0 {
            need(&buf, 4, pt)?;
            Some(buf.get_u32())
        } else {
            None
        };
        Ok(FuseWriteChunkPacket {
            chunk_id_hint,
            index,
            inode,
            lockid,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLocation {
    pub addr: Addr,
    pub part_type: ChunkPartType,
    pub chunkserver_version: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuseWriteChunkReplyPacket {
    pub file_length: u64,
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub lockid: LockId,
    pub locations: Vec<ChunkLocation>,
}

impl FuseWriteChunkReplyPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::new();
        buf.put_u64(self.file_length);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        buf.put_u32(self.lockid);
        buf.put_u32(self.locations.len() as u32);
        for loc in &self.locations {
            encode_addr(&mut buf, loc.addr);
            encode_part_type(&mut buf, loc.part_type);
            buf.put_u32(loc.chunkserver_version);
        }
        RawPayload::new(PacketType::FuseWriteChunkReply, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::FuseWriteChunkReply as u32;
        need(&buf, 24, pt)?;
        let file_length = buf.get_u64();
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let lockid = buf.get_u32();
        need(&buf, 4, pt)?;
        let count = buf.get_u32();
        let mut locations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let addr = decode_addr(&mut buf, pt)?;
            let part_type = decode_part_type(&mut buf, pt)?;
            need(&buf, 4, pt)?;
            let chunkserver_version = buf.get_u32();
            locations.push(ChunkLocation {
                addr,
                part_type,
                chunkserver_version,
            });
        }
        Ok(FuseWriteChunkReplyPacket {
            file_length,
            chunk_id,
            chunk_version,
            lockid,
            locations,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuseWriteChunkEndPacket {
    pub chunk_id: ChunkId,
    pub lockid: LockId,
    pub inode: Inode,
    pub file_length: u64,
}

impl FuseWriteChunkEndPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.lockid);
        buf.put_u32(self.inode);
        buf.put_u64(self.file_length);
        RawPayload::new(PacketType::FuseWriteChunkEnd, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::FuseWriteChunkEnd as u32;
        need(&buf, 24, pt)?;
        Ok(FuseWriteChunkEndPacket {
            chunk_id: buf.get_u64(),
            lockid: buf.get_u32(),
            inode: buf.get_u32(),
            file_length: buf.get_u64(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuseTruncatePacket {
    pub inode: Inode,
    pub new_length: u64,
}

impl FuseTruncatePacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(self.inode);
        buf.put_u64(self.new_length);
        RawPayload::new(PacketType::FuseTruncate, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::FuseTruncate as u32;
        need(&buf, 12, pt)?;
        Ok(FuseTruncatePacket {
            inode: buf.get_u32(),
            new_length: buf.get_u64(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuseTruncateEndPacket {
    pub inode: Inode,
    pub new_length: u64,
    pub lockid: LockId,
}

impl FuseTruncateEndPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(self.inode);
        buf.put_u64(self.new_length);
        buf.put_u32(self.lockid);
        RawPayload::new(PacketType::FuseTruncateEnd, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::FuseTruncateEnd as u32;
        need(&buf, 16, pt)?;
        Ok(FuseTruncateEndPacket {
            inode: buf.get_u32(),
            new_length: buf.get_u64(),
            lockid: buf.get_u32(),
        })
    }
}

/// Reply to `FUSE_TRUNCATE`. `status == Delayed` means the caller must pad
/// the chunk named by `chunk_id`/`locations` to a block boundary and follow
/// up with `FUSE_TRUNCATE_END` before the truncation is considered applied
/// (§4.1 `multi_truncate`, parity-bearing-part case).
#[derive(Debug, Clone, PartialEq)]
pub struct FuseTruncateReplyPacket {
    pub status: Status,
    pub file_length: u64,
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub lockid: LockId,
    pub locations: Vec<ChunkLocation>,
}

impl FuseTruncateReplyPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::new();
        buf.put_u8(self.status as u8);
        buf.put_u64(self.file_length);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        buf.put_u32(self.lockid);
        buf.put_u32(self.locations.len() as u32);
        for loc in &self.locations {
            encode_addr(&mut buf, loc.addr);
            encode_part_type(&mut buf, loc.part_type);
            buf.put_u32(loc.chunkserver_version);
        }
        RawPayload::new(PacketType::FuseTruncateReply, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::FuseTruncateReply as u32;
        need(&buf, 25, pt)?;
        let status_byte = buf.get_u8();
        let status = Status::try_from_u8(status_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: status_byte as u32 })?;
        let file_length = buf.get_u64();
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let lockid = buf.get_u32();
        need(&buf, 4, pt)?;
        let count = buf.get_u32();
        let mut locations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let addr = decode_addr(&mut buf, pt)?;
            let part_type = decode_part_type(&mut buf, pt)?;
            need(&buf, 4, pt)?;
            let chunkserver_version = buf.get_u32();
            locations.push(ChunkLocation { addr, part_type, chunkserver_version });
        }
        Ok(FuseTruncateReplyPacket { status, file_length, chunk_id, chunk_version, lockid, locations })
    }
}

/// Best-effort, no reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchPacket {
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub part_type: ChunkPartType,
    pub offset: u32,
    pub size: u32,
}

impl PrefetchPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        encode_part_type(&mut buf, self.part_type);
        buf.put_u32(self.offset);
        buf.put_u32(self.size);
        RawPayload::new(PacketType::Prefetch, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::Prefetch as u32;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        need(&buf, 8, pt)?;
        let offset = buf.get_u32();
        let size = buf.get_u32();
        Ok(PrefetchPacket {
            chunk_id,
            chunk_version,
            part_type,
            offset,
            size,
        })
    }
}

/// Wrong-CRC notifier follow-up (§5/§8 scenario 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestChunkPacket {
    pub chunk_id: ChunkId,
    pub chunk_version: Version,
    pub part_type: ChunkPartType,
}

impl TestChunkPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.chunk_version);
        encode_part_type(&mut buf, self.part_type);
        RawPayload::new(PacketType::TestChunk, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::TestChunk as u32;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let chunk_version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        Ok(TestChunkPacket {
            chunk_id,
            chunk_version,
            part_type,
        })
    }
}

/// What a [`ChunkOpPacket`] asks the receiving chunkserver to do to one
/// chunk part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOpKind {
    Create,
    SetVersion,
    Truncate,
    Duplicate,
    DupTrunc,
    Delete,
}

impl ChunkOpKind {
    fn to_u8(self) -> u8 {
        match self {
            ChunkOpKind::Create => 0,
            ChunkOpKind::SetVersion => 1,
            ChunkOpKind::Truncate => 2,
            ChunkOpKind::Duplicate => 3,
            ChunkOpKind::DupTrunc => 4,
            ChunkOpKind::Delete => 5,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ChunkOpKind::Create,
            1 => ChunkOpKind::SetVersion,
            2 => ChunkOpKind::Truncate,
            3 => ChunkOpKind::Duplicate,
            4 => ChunkOpKind::DupTrunc,
            5 => ChunkOpKind::Delete,
            _ => return None,
        })
    }
}

/// Master-to-chunkserver chunk lifecycle command (§4.1). `old_version` and
/// `copy_from` are `0` when the kind doesn't use them; `length` is the new
/// byte length for `Truncate`/`DupTrunc`, ignored otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOpPacket {
    pub kind: ChunkOpKind,
    pub chunk_id: ChunkId,
    pub part_type: ChunkPartType,
    pub new_version: Version,
    pub old_version: Version,
    pub copy_from: ChunkId,
    pub length: u32,
}

impl ChunkOpPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(self.kind.to_u8());
        buf.put_u64(self.chunk_id);
        encode_part_type(&mut buf, self.part_type);
        buf.put_u32(self.new_version);
        buf.put_u32(self.old_version);
        buf.put_u64(self.copy_from);
        buf.put_u32(self.length);
        RawPayload::new(PacketType::ChunkOp, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::ChunkOp as u32;
        need(&buf, 9, pt)?;
        let kind_byte = buf.get_u8();
        let kind = ChunkOpKind::from_u8(kind_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: kind_byte as u32 })?;
        let chunk_id = buf.get_u64();
        let part_type = decode_part_type(&mut buf, pt)?;
        need(&buf, 16, pt)?;
        let new_version = buf.get_u32();
        let old_version = buf.get_u32();
        let copy_from = buf.get_u64();
        need(&buf, 4, pt)?;
        let length = buf.get_u32();
        Ok(ChunkOpPacket { kind, chunk_id, part_type, new_version, old_version, copy_from, length })
    }
}

/// Chunkserver's reply to a [`ChunkOpPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOpStatusPacket {
    pub chunk_id: ChunkId,
    pub status: Status,
}

impl ChunkOpStatusPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64(self.chunk_id);
        buf.put_u8(self.status as u8);
        RawPayload::new(PacketType::ChunkOpStatus, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::ChunkOpStatus as u32;
        need(&buf, 9, pt)?;
        let chunk_id = buf.get_u64();
        let status_byte = buf.get_u8();
        let status = Status::try_from_u8(status_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: status_byte as u32 })?;
        Ok(ChunkOpStatusPacket { chunk_id, status })
    }
}

/// One already-connected chunkserver a [`ReplicatePacket`] can be rebuilt
/// from: `addr` to dial, `part_type` is whichever part it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationSource {
    pub addr: Addr,
    pub part_type: ChunkPartType,
}

/// Master-to-chunkserver order to rebuild `part_type` of `chunk_id` at
/// `version` by pulling from `sources` (§4.4). The destination decides how
/// many of `sources` it actually needs to read from the slice family
/// `part_type` belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatePacket {
    pub chunk_id: ChunkId,
    pub version: Version,
    pub part_type: ChunkPartType,
    pub sources: Vec<ReplicationSource>,
}

impl ReplicatePacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::new();
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.version);
        encode_part_type(&mut buf, self.part_type);
        buf.put_u32(self.sources.len() as u32);
        for source in &self.sources {
            encode_addr(&mut buf, source.addr);
            encode_part_type(&mut buf, source.part_type);
        }
        RawPayload::new(PacketType::Replicate, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::Replicate as u32;
        need(&buf, 12, pt)?;
        let chunk_id = buf.get_u64();
        let version = buf.get_u32();
        let part_type = decode_part_type(&mut buf, pt)?;
        need(&buf, 4, pt)?;
        let count = buf.get_u32();
        let mut sources = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let addr = decode_addr(&mut buf, pt)?;
            let part_type = decode_part_type(&mut buf, pt)?;
            sources.push(ReplicationSource { addr, part_type });
        }
        Ok(ReplicatePacket { chunk_id, version, part_type, sources })
    }
}

/// Chunkserver's reply to a [`ReplicatePacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateStatusPacket {
    pub chunk_id: ChunkId,
    pub status: Status,
}

impl ReplicateStatusPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64(self.chunk_id);
        buf.put_u8(self.status as u8);
        RawPayload::new(PacketType::ReplicateStatus, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::ReplicateStatus as u32;
        need(&buf, 9, pt)?;
        let chunk_id = buf.get_u64();
        let status_byte = buf.get_u8();
        let status = Status::try_from_u8(status_byte)
            .ok_or(ProtoError::WrongPayloadVersion { packet_type: pt, version: status_byte as u32 })?;
        Ok(ReplicateStatusPacket { chunk_id, status })
    }
}

/// Connection bootstrap (§5): the very first frame either side sends,
/// carrying no dialect prefix of its own since the dialect isn't known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloPacket {
    pub protocol_version: u32,
}

impl HelloPacket {
    pub fn encode(&self) -> RawPayload {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.protocol_version);
        RawPayload::new(PacketType::Hello, buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        let pt = PacketType::Hello as u32;
        need(&buf, 4, pt)?;
        Ok(HelloPacket { protocol_version: buf.get_u32() })
    }
}

/// A packet-type tag paired with its still-encoded payload, ready to hand to
/// [`crate::frame::FrameCodec`].
pub struct RawPayload {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl RawPayload {
    fn new(packet_type: PacketType, payload: Bytes) -> Self {
        RawPayload {
            packet_type,
            payload,
        }
    }

    pub fn into_frame(self) -> crate::frame::RawFrame {
        crate::frame::RawFrame::new(self.packet_type as u32, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_packet_round_trips_both_dialects() {
        let pkt = ReadPacket {
            chunk_id: 7,
            chunk_version: 3,
            part_type: ChunkPartType::standard(),
            offset: 0,
            size: 65536,
        };
        for dialect in [Dialect::Legacy, Dialect::LizardFs] {
            let encoded = pkt.encode(dialect);
            let decoded = ReadPacket::decode(encoded.payload, dialect).unwrap();
            assert_eq!(pkt, decoded);
        }
    }

    #[test]
    fn hello_round_trips_and_implies_dialect() {
        let pkt = HelloPacket { protocol_version: 2 };
        let encoded = pkt.encode();
        let decoded = HelloPacket::decode(encoded.payload).unwrap();
        assert_eq!(pkt, decoded);
        assert_eq!(Dialect::from_version(decoded.protocol_version), Dialect::LizardFs);
        assert_eq!(Dialect::from_version(0), Dialect::Legacy);
    }

    #[test]
    fn chunk_op_round_trips() {
        let pkt = ChunkOpPacket {
            kind: ChunkOpKind::DupTrunc,
            chunk_id: 42,
            part_type: ChunkPartType::standard(),
            new_version: 3,
            old_version: 2,
            copy_from: 41,
            length: 65536,
        };
        let encoded = pkt.encode();
        let decoded = ChunkOpPacket::decode(encoded.payload).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn replicate_round_trips_with_multiple_sources() {
        let pkt = ReplicatePacket {
            chunk_id: 7,
            version: 2,
            part_type: ChunkPartType { slice: SliceType::Ec { data_k: 2, parity_m: 1 }, part: 2 },
            sources: vec![
                ReplicationSource {
                    addr: Addr::new(std::net::Ipv4Addr::new(10, 0, 0, 1), 9422),
                    part_type: ChunkPartType { slice: SliceType::Ec { data_k: 2, parity_m: 1 }, part: 0 },
                },
                ReplicationSource {
                    addr: Addr::new(std::net::Ipv4Addr::new(10, 0, 0, 2), 9422),
                    part_type: ChunkPartType { slice: SliceType::Ec { data_k: 2, parity_m: 1 }, part: 1 },
                },
            ],
        };
        let encoded = pkt.encode();
        let decoded = ReplicatePacket::decode(encoded.payload).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn ec_part_type_round_trips() {
        let pkt = WriteInitPacket {
            chunk_id: 1,
            chunk_version: 1,
            part_type: ChunkPartType {
                slice: SliceType::Ec {
                    data_k: 4,
                    parity_m: 2,
                },
                part: 5,
            },
            chain: vec![Addr::new(std::net::Ipv4Addr::new(10, 0, 0, 1), 9422)],
        };
        let encoded = pkt.encode(Dialect::LizardFs);
        let decoded = WriteInitPacket::decode(encoded.payload, Dialect::LizardFs).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn truncated_write_data_is_incomplete_not_error() {
        let pkt = WriteDataPacket {
            chunk_id: 1,
            write_id: 1,
            block: 0,
            offset: 0,
            size: 4,
            crc: 0,
            data: Bytes::from_static(b"data"),
        };
        let encoded = pkt.encode();
        let mut truncated = encoded.payload.clone();
        truncated.truncate(truncated.len() - 1);
        let err = WriteDataPacket::decode(truncated).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated { .. }));
    }

    #[test]
    fn fuse_truncate_reply_round_trips_with_delayed_status() {
        let pkt = FuseTruncateReplyPacket {
            status: Status::Delayed,
            file_length: 400,
            chunk_id: 9,
            chunk_version: 3,
            lockid: 77,
            locations: vec![ChunkLocation {
                addr: Addr::new(std::net::Ipv4Addr::new(10, 0, 0, 5), 9422),
                part_type: ChunkPartType { slice: SliceType::Ec { data_k: 4, parity_m: 2 }, part: 1 },
                chunkserver_version: 2,
            }],
        };
        let encoded = pkt.encode();
        let decoded = FuseTruncateReplyPacket::decode(encoded.payload).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn write_status_round_trips() {
        let pkt = WriteStatusPacket {
            chunk_id: 99,
            write_id: 2,
            status: Status::Ok,
        };
        let encoded = pkt.encode();
        let decoded = WriteStatusPacket::decode(encoded.payload).unwrap();
        assert_eq!(pkt, decoded);
    }
}
