//! Thin client library for driving a master and its chunkservers end to
//! end over the real wire protocol, without a FUSE mount in front of it.
//! Exists for integration tests; production clients speak the same
//! protocol through the kernel FUSE layer instead (out of scope, §1).

pub mod chunkserver;
pub mod errors;
pub mod master;

pub use chunkserver::{ChunkserverClient, ReadChunk};
pub use errors::{ClientError, ClientResult};
pub use master::MasterClient;
