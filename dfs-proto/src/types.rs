//! Core identifiers and value types shared by every packet family.

use std::net::Ipv4Addr;

/// Unique id of a chunk, stable for the lifetime of the chunk (a modification
/// of a shared chunk allocates a new id instead of reusing this one).
pub type ChunkId = u64;

/// Per-chunk version, bumped by one on every `SET_VERSION`/`DUPLICATE`/
/// `TRUNCATE`/`DUPTRUNC`.
pub type Version = u32;

/// Authenticates a client's mutation requests for a specific chunk.
///
/// `0` means unlocked/force. `LEGACY_LOCKID` is reserved both for legacy
/// clients that don't speak the lockid protocol and as the "dummy" value
/// used when no real lock id applies — both meanings share this single
/// constant.
pub type LockId = u32;

/// See [`LockId`].
pub const LEGACY_LOCKID: LockId = 1;

/// No lock / force-unlock sentinel.
pub const UNLOCKED: LockId = 0;

pub type Inode = u32;

/// Per-write identifier used to join write-data / write-status along a chain.
pub type WriteId = u32;

/// Id of a chunkserver as known to the master's chunkserver database. Wire
/// format packs this into 13 bits; the in-memory type is a plain newtype.
pub type ServerId = u16;

/// Maximum number of chunkserver ids the 13-bit wire encoding can address.
pub const MAX_SERVERS: u32 = 1 << 13;

pub const BLOCK_SIZE: u32 = 65536;
pub const BLOCKS_PER_CHUNK: u32 = 1024;
pub const MAX_CHUNK_SIZE: u32 = BLOCK_SIZE * BLOCKS_PER_CHUNK;

/// A chunkserver network address, as carried in a `WRITE_INIT` chain or a
/// `FUSE_WRITE_CHUNK` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Addr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// The redundancy family a [`ChunkPartType`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceType {
    /// A full, independently readable copy.
    Standard,
    /// XOR parity group of `level` data+parity slices (2..=9).
    Xor { level: u8 },
    /// Reed-Solomon erasure coding group, `data_k` data parts plus
    /// `parity_m` parity parts.
    Ec { data_k: u8, parity_m: u8 },
    /// Second-generation EC dialect (same shape as [`SliceType::Ec`], kept
    /// as a distinct wire tag for forward compatibility).
    Ec2 { data_k: u8, parity_m: u8 },
}

impl SliceType {
    /// Number of parts required to have the whole slice family represented
    /// (data parts only for EC, both data+parity for Xor since a standard
    /// XOR slice needs every part present to reconstruct any one of them).
    pub fn part_count(&self) -> u8 {
        match *self {
            SliceType::Standard => 1,
            SliceType::Xor { level } => level,
            SliceType::Ec { data_k, parity_m } | SliceType::Ec2 { data_k, parity_m } => {
                data_k + parity_m
            }
        }
    }

    /// Number of data-bearing parts (as opposed to parity), used to derive
    /// per-part chunk lengths on truncate.
    pub fn data_part_count(&self) -> u8 {
        match *self {
            SliceType::Standard => 1,
            SliceType::Xor { level } => level - 1,
            SliceType::Ec { data_k, .. } | SliceType::Ec2 { data_k, .. } => data_k,
        }
    }

    /// True for slice types whose individual parts carry parity rather than
    /// raw data (truncation of these is refused unless explicitly allowed).
    pub fn is_parity_bearing(&self) -> bool {
        !matches!(self, SliceType::Standard)
    }
}

/// Selects one slice of a [`SliceType`] family: `part` indexes `0..part_count()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPartType {
    pub slice: SliceType,
    pub part: u8,
}

impl ChunkPartType {
    pub fn standard() -> Self {
        ChunkPartType {
            slice: SliceType::Standard,
            part: 0,
        }
    }

    pub fn is_parity(&self) -> bool {
        match self.slice {
            SliceType::Standard => false,
            SliceType::Xor { level } => self.part + 1 == level,
            SliceType::Ec { data_k, .. } | SliceType::Ec2 { data_k, .. } => self.part >= data_k,
        }
    }
}

/// Capability set derived once at connection registration from the peer's
/// advertised protocol version, so the encoder dispatches on flags rather
/// than re-inspecting each outbound packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub supports_xor: bool,
    pub supports_ec: bool,
    pub supports_ec2: bool,
    pub supports_lockids: bool,
}

impl Capabilities {
    /// Protocol versions are linear: each capability was introduced at (and
    /// implies) a minimum version.
    pub fn from_version(version: u32) -> Self {
        Capabilities {
            supports_xor: version >= 1,
            supports_lockids: version >= 1,
            supports_ec: version >= 2,
            supports_ec2: version >= 3,
        }
    }

    /// True when this peer can be given a chunk whose goal requires `slice`.
    pub fn supports(&self, slice: SliceType) -> bool {
        match slice {
            SliceType::Standard => true,
            SliceType::Xor { .. } => self.supports_xor,
            SliceType::Ec { .. } => self.supports_ec,
            SliceType::Ec2 { .. } => self.supports_ec2,
        }
    }
}

/// Which dialect a peer's packets are framed in, once observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Fixed per-type layouts, no embedded version field.
    Legacy,
    /// Self-describing payloads carrying a `version: u32` prefix.
    LizardFs,
}

impl Dialect {
    /// The dialect a `HELLO`'s advertised protocol version implies: version
    /// `0` is the original fixed-layout wire format, anything newer carries
    /// the self-describing prefix.
    pub fn from_version(version: u32) -> Self {
        if version >= 1 {
            Dialect::LizardFs
        } else {
            Dialect::Legacy
        }
    }
}

/// Per-packet-family version constants carried in the LizardFS dialect's
/// payload prefix.
pub mod payload_version {
    pub const STANDARD_AND_XOR_CHUNKS: u32 = 0;
    pub const EC_CHUNKS: u32 = 1;
}
