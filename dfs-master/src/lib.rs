//! Master-side chunk metadata, placement and replication-worker logic.
//!
//! This crate models decisions only - it owns no socket and performs no
//! disk I/O. The daemon binary (`dfs-master`) is the thin layer that drives
//! a `tokio::select!` loop, feeding network events in and carrying the
//! `worker::WorkerAction`s this crate produces out to real chunkservers.

pub mod checksum;
pub mod chunk;
pub mod chunks_table;
pub mod chunkserver_db;
pub mod config;
pub mod errors;
pub mod goal;
pub mod net;
pub mod placement;
pub mod session;
pub mod worker;

pub use chunk::{AvailabilitySummary, Chunk};
pub use chunks_table::ChunkTable;
pub use chunkserver_db::ChunkServerDb;
pub use config::MasterConfig;
pub use errors::{ChunkError, ChunkResult};
pub use goal::{Availability, Goal};
pub use session::SessionTable;
pub use worker::{ChunkWorkerState, StepOutcome, TickBudget, WorkerAction};
