//! Packet framing: `type:u32 length:u32 payload:length*u8`, big-endian.
//!
//! Implemented as a safe `tokio_util::codec::{Encoder,Decoder}` pair over
//! `bytes::{BytesMut,Buf,BufMut}` rather than a packed-struct/transmute
//! layout, so framing never needs `unsafe`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;

/// Header size: two big-endian `u32`s.
const HEADER_LEN: usize = 8;

/// An as-yet-undecoded packet: a type tag plus its raw payload bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub packet_type: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn new(packet_type: u32, payload: Bytes) -> Self {
        RawFrame {
            packet_type,
            payload,
        }
    }
}

/// Framing codec. Holds no dialect state itself — the dialect is a property
/// of how callers interpret `payload`, chosen once per connection the first
/// time a version-bearing packet type is observed (see `dfs-proto::types::Dialect`).
pub struct FrameCodec {
    max_frame_len: u32,
}

impl FrameCodec {
    pub fn new(max_frame_len: u32) -> Self {
        FrameCodec { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        // Largest legitimate payload is one data block plus a small header,
        // generously rounded up; callers needing chunk-sized batches frame
        // at the block level, never send a whole chunk in one packet.
        FrameCodec::new(crate::types::BLOCK_SIZE + 4096)
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = ProtoError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawFrame>, ProtoError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let packet_type = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if length > self.max_frame_len {
            return Err(ProtoError::TooLarge {
                len: length,
                max: self.max_frame_len,
            });
        }
        let total = HEADER_LEN + length as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length as usize).freeze();
        Ok(Some(RawFrame::new(packet_type, payload)))
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let len = frame.payload.len() as u32;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u32(frame.packet_type);
        dst.put_u32(len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_once_whole_frame_arrives() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(7);
        buf.put_u32(3);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"xyz");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.packet_type, 7);
        assert_eq!(&frame.payload[..], b"xyz");
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_oversize_length_before_allocating() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(1_000_000);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::TooLarge { .. }));
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(RawFrame::new(42, Bytes::from_static(b"hello")), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.packet_type, 42);
        assert_eq!(&frame.payload[..], b"hello");
    }
}
