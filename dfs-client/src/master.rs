//! A connection to the master for the `FUSE_WRITE_CHUNK`/`FUSE_TRUNCATE`
//! request/reply pairs (§4.5): open-for-write returns a chain and a
//! `lockid`; the client writes data to the chunkservers named in the reply
//! directly (via [`crate::chunkserver::ChunkserverClient`]) and reports
//! back with the matching `*_END` packet once done.

use dfs_proto::frame::FrameCodec;
use dfs_proto::packets::{
    FuseTruncateEndPacket, FuseTruncatePacket, FuseTruncateReplyPacket, FuseWriteChunkEndPacket,
    FuseWriteChunkPacket, FuseWriteChunkReplyPacket, PacketType,
};
use dfs_proto::types::{ChunkId, Inode, LockId};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::errors::{ClientError, ClientResult};

pub struct MasterClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl MasterClient {
    pub async fn connect(listen: &str) -> ClientResult<Self> {
        let stream = TcpStream::connect(listen).await?;
        let framed = Framed::new(stream, FrameCodec::default());
        Ok(MasterClient { framed })
    }

    /// Opens `inode` for a write at `index`, returning the allocated chunk
    /// and the chain of chunkservers to stream data to.
    pub async fn open_for_write(
        &mut self,
        inode: Inode,
        index: u32,
        lockid: Option<LockId>,
    ) -> ClientResult<FuseWriteChunkReplyPacket> {
        self.send(FuseWriteChunkPacket { chunk_id_hint: 0, index, inode, lockid }.encode())
            .await?;
        let frame = self.next_frame().await?;
        if PacketType::try_from_u32(frame.packet_type) != Some(PacketType::FuseWriteChunkReply) {
            return Err(ClientError::UnexpectedPacketType(frame.packet_type));
        }
        Ok(FuseWriteChunkReplyPacket::decode(frame.payload)?)
    }

    /// Reports a completed write back to the master, which unlocks the
    /// chunk and records the new file length.
    pub async fn end_write(
        &mut self,
        chunk_id: ChunkId,
        lockid: LockId,
        inode: Inode,
        file_length: u64,
    ) -> ClientResult<()> {
        self.send(FuseWriteChunkEndPacket { chunk_id, lockid, inode, file_length }.encode())
            .await
    }

    /// Requests truncation of `inode` to `new_length`. Per §4.5, a goal
    /// whose parts carry parity may come back `DELAYED`: the caller must
    /// first pad the data parts to a block boundary, then call
    /// [`Self::end_truncate`].
    pub async fn truncate(
        &mut self,
        inode: Inode,
        new_length: u64,
    ) -> ClientResult<FuseTruncateReplyPacket> {
        self.send(FuseTruncatePacket { inode, new_length }.encode()).await?;
        let frame = self.next_frame().await?;
        if PacketType::try_from_u32(frame.packet_type) != Some(PacketType::FuseTruncateReply) {
            return Err(ClientError::UnexpectedPacketType(frame.packet_type));
        }
        Ok(FuseTruncateReplyPacket::decode(frame.payload)?)
    }

    pub async fn end_truncate(
        &mut self,
        inode: Inode,
        new_length: u64,
        lockid: LockId,
    ) -> ClientResult<()> {
        self.send(FuseTruncateEndPacket { inode, new_length, lockid }.encode()).await
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
