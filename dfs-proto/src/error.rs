use thiserror::Error;

/// Failures that can occur while framing or decoding a packet. These never
/// carry user payload bytes in their `Display` impl (protocol errors must
/// not log user data, per the error handling design).
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("packet too large: {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: u32, max: u32 },

    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),

    #[error("truncated payload for packet type {packet_type}: need {need} bytes, have {have}")]
    Truncated {
        packet_type: u32,
        need: usize,
        have: usize,
    },

    #[error("unexpected payload version {version} for packet type {packet_type}")]
    WrongPayloadVersion { packet_type: u32, version: u32 },

    #[error("io error")]
    Io(#[from] std::io::Error),
}
