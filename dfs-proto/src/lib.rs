//! Wire protocol types, framing codec and packet (de)serializers shared by
//! the master, the chunkserver and the client.
//!
//! Two dialects coexist on the wire: legacy fixed layouts and a
//! self-describing "LizardFS" dialect carrying an extra `version: u32`
//! payload prefix. A connection commits to one dialect the first time a
//! version-bearing packet type is observed from its peer; see
//! [`types::Dialect`] and [`types::Capabilities`].

pub mod error;
pub mod frame;
pub mod packets;
pub mod status;
pub mod types;

pub use error::ProtoError;
pub use frame::{FrameCodec, RawFrame};
pub use status::Status;
pub use types::*;
