//! Status codes carried on the wire as a single byte.

/// Result code shared by every reply packet. The wire carries this as a raw
/// `u8`, so the round trip through [`Status::try_from`]/`as u8` must be
/// lossless.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("ok")]
    Ok = 0,
    #[error("operation not permitted")]
    EPerm = 1,
    #[error("no such chunk or file")]
    ENoEnt = 2,
    #[error("access denied")]
    EAccess = 3,
    #[error("already exists")]
    EExist = 4,
    #[error("invalid argument")]
    EInval = 5,
    #[error("resource busy")]
    EBusy = 6,
    #[error("no space left on chunkserver")]
    NoSpace = 7,
    #[error("not enough chunkservers to satisfy goal")]
    NoChunkservers = 8,
    #[error("chunk has no readable parts left")]
    ChunkLost = 9,
    #[error("wrong chunk id")]
    WrongChunkId = 10,
    #[error("wrong chunk version")]
    WrongVersion = 11,
    #[error("wrong offset")]
    WrongOffset = 12,
    #[error("wrong size")]
    WrongSize = 13,
    #[error("peer disconnected")]
    Disconnected = 14,
    #[error("can't connect to chunkserver")]
    CantConnect = 15,
    #[error("waiting for a delayed reply")]
    Waiting = 16,
    #[error("client must perform a follow-up operation first")]
    Delayed = 17,
    #[error("operation not possible in this configuration")]
    NotPossible = 18,
    #[error("quota exceeded")]
    Quota = 19,
    #[error("chunk is locked by another client")]
    Locked = 20,
    #[error("chunk is not locked")]
    NotLocked = 21,
    #[error("lock id does not match")]
    WrongLockId = 22,
    #[error("crc mismatch")]
    CrcMismatch = 23,
}

impl Status {
    pub fn try_from_u8(v: u8) -> Option<Status> {
        use Status::*;
        Some(match v {
            0 => Ok,
            1 => EPerm,
            2 => ENoEnt,
            3 => EAccess,
            4 => EExist,
            5 => EInval,
            6 => EBusy,
            7 => NoSpace,
            8 => NoChunkservers,
            9 => ChunkLost,
            10 => WrongChunkId,
            11 => WrongVersion,
            12 => WrongOffset,
            13 => WrongSize,
            14 => Disconnected,
            15 => CantConnect,
            16 => Waiting,
            17 => Delayed,
            18 => NotPossible,
            19 => Quota,
            20 => Locked,
            21 => NotLocked,
            22 => WrongLockId,
            23 => CrcMismatch,
            _ => return None,
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}
