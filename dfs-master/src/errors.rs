use dfs_proto::Status;
use thiserror::Error;

/// Per-module error enum for anything a caller of the chunk table might
/// match on. A single `From<ChunkError> for Status` centralizes the wire
/// translation so call sites return `Result<T, ChunkError>` internally and
/// only convert to a status byte at the point a reply is serialized.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    #[error("no such chunk")]
    NoSuchChunk,
    #[error("not enough chunkservers for the requested goal")]
    NoChunkservers,
    #[error("no chunkserver has free space for this goal")]
    NoSpace,
    #[error("quota exceeded")]
    Quota,
    #[error("chunk is locked by another client")]
    Locked,
    #[error("chunk is not locked")]
    NotLocked,
    #[error("wrong lock id")]
    WrongLockId,
    #[error("operation not possible on a parity-bearing part")]
    NotPossible,
    #[error("chunk has no readable parts left")]
    ChunkLost,
}

impl From<ChunkError> for Status {
    fn from(e: ChunkError) -> Status {
        match e {
            ChunkError::NoSuchChunk => Status::ENoEnt,
            ChunkError::NoChunkservers => Status::NoChunkservers,
            ChunkError::NoSpace => Status::NoSpace,
            ChunkError::Quota => Status::Quota,
            ChunkError::Locked => Status::Locked,
            ChunkError::NotLocked => Status::NotLocked,
            ChunkError::WrongLockId => Status::WrongLockId,
            ChunkError::NotPossible => Status::NotPossible,
            ChunkError::ChunkLost => Status::ChunkLost,
        }
    }
}

pub type ChunkResult<T> = Result<T, ChunkError>;
