//! Chunkserver-local error type, translated to wire `Status` at the one
//! seam that serializes responses (mirrors `dfs_master::errors`).

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CsError {
    #[error("no such chunk")]
    NoSuchChunk,
    #[error("chunk already exists")]
    ChunkExists,
    #[error("wrong chunk version")]
    WrongVersion,
    #[error("crc mismatch")]
    CrcMismatch,
    #[error("not enough disk space")]
    NoSpace,
    #[error("i/o error")]
    Io,
    #[error("chunk is busy")]
    Busy,
    #[error("client must perform a follow-up operation first")]
    Delayed,
    #[error("wrong offset")]
    WrongOffset,
    #[error("wrong size")]
    WrongSize,
}

impl From<CsError> for dfs_proto::Status {
    fn from(e: CsError) -> Self {
        match e {
            CsError::NoSuchChunk => dfs_proto::Status::WrongChunkId,
            CsError::ChunkExists => dfs_proto::Status::EExist,
            CsError::WrongVersion => dfs_proto::Status::WrongVersion,
            CsError::CrcMismatch => dfs_proto::Status::CrcMismatch,
            CsError::NoSpace => dfs_proto::Status::NoSpace,
            CsError::Io => dfs_proto::Status::EInval,
            CsError::Busy => dfs_proto::Status::EBusy,
            CsError::Delayed => dfs_proto::Status::Delayed,
            CsError::WrongOffset => dfs_proto::Status::WrongOffset,
            CsError::WrongSize => dfs_proto::Status::WrongSize,
        }
    }
}

pub type CsResult<T> = Result<T, CsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_onto_distinct_status_codes() {
        let mapped: Vec<dfs_proto::Status> = [
            CsError::NoSuchChunk,
            CsError::ChunkExists,
            CsError::WrongVersion,
            CsError::CrcMismatch,
            CsError::NoSpace,
            CsError::Io,
            CsError::Busy,
            CsError::Delayed,
            CsError::WrongOffset,
            CsError::WrongSize,
        ]
        .into_iter()
        .map(Into::into)
        .collect();
        assert!(!mapped.iter().any(|s| s.is_ok()));
    }
}
