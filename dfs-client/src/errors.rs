use dfs_proto::Status;
use thiserror::Error;

/// Failures a client call can surface. Distinct from [`dfs_proto::ProtoError`]
/// (a malformed wire message) and [`dfs_master::ChunkError`]/
/// [`dfs_chunkserver::CsError`] (rejected operations) - this is what the
/// *caller* of this crate sees, folding all three into one enum the way
/// `pbs_client::HttpClient`'s callers only ever see one error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] dfs_proto::ProtoError),

    #[error("unexpected packet type {0}")]
    UnexpectedPacketType(u32),

    #[error("peer closed the connection before finishing the operation")]
    ClosedEarly,

    #[error("remote returned {0:?}")]
    Remote(Status),
}

pub type ClientResult<T> = Result<T, ClientError>;
