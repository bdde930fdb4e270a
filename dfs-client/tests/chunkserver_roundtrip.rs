//! Drives `ChunkserverClient` against a hand-rolled fake chunkserver socket
//! (not `dfs_chunkserver::server`, which is still a minimal I/O stub) to
//! exercise the write-then-read round trip over the real wire framing.

use bytes::Bytes;
use dfs_proto::frame::FrameCodec;
use dfs_proto::packets::{
    PacketType, ReadDataPacket, ReadPacket, ReadStatusPacket, WriteDataPacket, WriteEndPacket,
    WriteInitPacket, WriteStatusPacket,
};
use dfs_proto::types::{Addr, ChunkPartType, SliceType};
use dfs_proto::{Dialect, Status};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use dfs_client::ChunkserverClient;

fn part() -> ChunkPartType {
    ChunkPartType { slice: SliceType::Standard, part: 0 }
}

/// Accepts one connection and plays a write chain: reads the init packet,
/// acks every data block, then reads the trailing write-end.
async fn fake_write_server(listener: TcpListener) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(socket, FrameCodec::new(1 << 20));

    let init_frame = framed.next().await.unwrap().unwrap();
    assert_eq!(
        PacketType::try_from_u32(init_frame.packet_type),
        Some(PacketType::WriteInit)
    );
    let init = WriteInitPacket::decode(init_frame.payload, Dialect::Legacy).unwrap();

    loop {
        let frame = framed.next().await.unwrap().unwrap();
        match PacketType::try_from_u32(frame.packet_type) {
            Some(PacketType::WriteData) => {
                let data = WriteDataPacket::decode(frame.payload).unwrap();
                let reply = WriteStatusPacket {
                    chunk_id: init.chunk_id,
                    write_id: data.write_id,
                    status: Status::Ok,
                };
                framed.send(reply.encode().into_frame()).await.unwrap();
            }
            Some(PacketType::WriteEnd) => {
                WriteEndPacket::decode(frame.payload).unwrap();
                break;
            }
            other => panic!("unexpected packet during write: {other:?}"),
        }
    }
}

/// Accepts one connection and replies to a read request with a single data
/// block followed by an ok status.
async fn fake_read_server(listener: TcpListener, payload: Vec<u8>) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(socket, FrameCodec::new(1 << 20));

    let frame = framed.next().await.unwrap().unwrap();
    assert_eq!(PacketType::try_from_u32(frame.packet_type), Some(PacketType::Read));
    let req = ReadPacket::decode(frame.payload, Dialect::Legacy).unwrap();

    let crc = dfs_tools::crc::crc32(0, &payload);
    let data_pkt = ReadDataPacket {
        chunk_id: req.chunk_id,
        offset: 0,
        size: payload.len() as u32,
        crc,
        data: Bytes::from(payload),
    };
    framed.send(data_pkt.encode().into_frame()).await.unwrap();

    let status_pkt = ReadStatusPacket { chunk_id: req.chunk_id, status: Status::Ok };
    framed.send(status_pkt.encode().into_frame()).await.unwrap();
}

#[tokio::test]
async fn write_chunk_round_trips_through_a_single_hop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(fake_write_server(listener));

    let mut client = ChunkserverClient::connect(
        Addr::new(match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        }, addr.port()),
        Dialect::Legacy,
    )
    .await
    .unwrap();

    let data = vec![0x42u8; 4096];
    client.write_chunk(7, 1, part(), Vec::new(), &data).await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn read_chunk_validates_crc_and_returns_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = vec![0x99u8; 2048];
    let server = tokio::spawn(fake_read_server(listener, payload.clone()));

    let mut client = ChunkserverClient::connect(
        Addr::new(match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        }, addr.port()),
        Dialect::Legacy,
    )
    .await
    .unwrap();

    let read = client.read_chunk(7, 1, part(), 0, payload.len() as u32).await.unwrap();
    assert_eq!(read.data, payload);

    server.await.unwrap();
}

#[tokio::test]
async fn connecting_to_a_closed_port_is_an_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = ChunkserverClient::connect(
        Addr::new(match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        }, addr.port()),
        Dialect::Legacy,
    )
    .await;
    assert!(result.is_err());
}
