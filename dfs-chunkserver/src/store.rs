//! On-disk chunk storage for one data directory.
//!
//! Each chunk part is one file, path-sharded on the low byte of its id so a
//! single directory never holds every chunk on the server. Commits are
//! atomic: the new content is written to a sibling temp file and renamed
//! into place, matching `pbs_datastore::chunk_store::ChunkStore::insert_chunk`'s
//! use of `proxmox_sys::fs::replace_file`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dfs_proto::types::{ChunkId, ChunkPartType, Version, BLOCK_SIZE};
use proxmox_sys::fs::{create_path, replace_file, CreateOptions};

use crate::errors::{CsError, CsResult};

/// Metadata kept in memory per stored chunk part; the file on disk holds
/// only the raw block bytes.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub version: Version,
    pub block_count: u32,
    pub size_bytes: u64,
    pub crcs: Vec<u32>,
}

fn shard_dir(base: &Path, id: ChunkId) -> PathBuf {
    base.join(format!("{:02x}", (id & 0xff) as u8))
}

fn part_suffix(part: &ChunkPartType) -> String {
    use dfs_proto::types::SliceType::*;
    match part.slice {
        Standard => "std".to_string(),
        Xor { level } => format!("xor{level}"),
        Ec { data_k, parity_m } => format!("ec{data_k}_{parity_m}"),
        Ec2 { data_k, parity_m } => format!("ec2-{data_k}_{parity_m}"),
    }
}

fn chunk_file_name(id: ChunkId, version: Version, part: &ChunkPartType) -> String {
    format!("{:016x}-{:08x}.{}.{}", id, version, part_suffix(part), part.part)
}

/// File-backed store for the chunk parts assigned to this server.
pub struct ChunkStore {
    base: PathBuf,
    index: Mutex<HashMap<(ChunkId, u8), ChunkMeta>>,
}

impl ChunkStore {
    pub fn open(base: impl Into<PathBuf>) -> CsResult<Self> {
        let base = base.into();
        create_path(&base, None, Some(CreateOptions::new())).map_err(|_| CsError::Io)?;
        Ok(ChunkStore { base, index: Mutex::new(HashMap::new()) })
    }

    fn path_for(&self, id: ChunkId, version: Version, part: &ChunkPartType) -> PathBuf {
        shard_dir(&self.base, id).join(chunk_file_name(id, version, part))
    }

    pub fn has(&self, id: ChunkId, part: u8) -> bool {
        self.index.lock().unwrap().contains_key(&(id, part))
    }

    pub fn meta(&self, id: ChunkId, part: u8) -> Option<ChunkMeta> {
        self.index.lock().unwrap().get(&(id, part)).cloned()
    }

    /// Creates a brand new, empty chunk part. Fails with `ChunkExists` if
    /// already present.
    pub fn create(&self, id: ChunkId, version: Version, part: ChunkPartType) -> CsResult<()> {
        let mut index = self.index.lock().unwrap();
        if index.contains_key(&(id, part.part)) {
            return Err(CsError::ChunkExists);
        }
        let dir = shard_dir(&self.base, id);
        create_path(&dir, None, Some(CreateOptions::new())).map_err(|_| CsError::Io)?;
        let path = self.path_for(id, version, &part);
        replace_file(&path, &[], CreateOptions::new(), false).map_err(|_| CsError::Io)?;
        index.insert((id, part.part), ChunkMeta { version, block_count: 0, size_bytes: 0, crcs: Vec::new() });
        Ok(())
    }

    /// Overwrites the whole part's data atomically, validating block CRCs
    /// as it builds the new image.
    pub fn write_full(
        &self,
        id: ChunkId,
        version: Version,
        part: ChunkPartType,
        blocks: &[(Vec<u8>, u32)],
    ) -> CsResult<()> {
        let mut data = Vec::with_capacity(blocks.len() * BLOCK_SIZE as usize);
        let mut crcs = Vec::with_capacity(blocks.len());
        for (block, crc) in blocks {
            let computed = dfs_tools::crc::crc32(0, block);
            if computed != *crc {
                return Err(CsError::CrcMismatch);
            }
            data.extend_from_slice(block);
            crcs.push(*crc);
        }

        let dir = shard_dir(&self.base, id);
        create_path(&dir, None, Some(CreateOptions::new())).map_err(|_| CsError::Io)?;
        let path = self.path_for(id, version, &part);
        replace_file(&path, &data, CreateOptions::new(), false).map_err(|_| CsError::Io)?;

        let mut index = self.index.lock().unwrap();
        index.insert(
            (id, part.part),
            ChunkMeta { version, block_count: blocks.len() as u32, size_bytes: data.len() as u64, crcs },
        );
        Ok(())
    }

    /// Writes one block at `block`'s offset into an already-created part,
    /// extending the file and the cached CRC/length metadata as needed.
    /// Unlike [`Self::write_full`] this is the per-`WRITE_DATA`-packet path
    /// the connection state machine drives (§4.3): one block at a time,
    /// arriving in any order a retry might produce.
    pub fn write_block(
        &self,
        id: ChunkId,
        version: Version,
        part: ChunkPartType,
        block: u32,
        data: &[u8],
        crc: u32,
    ) -> CsResult<()> {
        if dfs_tools::crc::crc32(0, data) != crc {
            return Err(CsError::CrcMismatch);
        }
        let mut index = self.index.lock().unwrap();
        let meta = index.get(&(id, part.part)).cloned().ok_or(CsError::NoSuchChunk)?;
        if meta.version != version {
            return Err(CsError::WrongVersion);
        }
        let path = self.path_for(id, version, &part);
        let mut file_data = std::fs::read(&path).unwrap_or_default();
        let offset = block as usize * BLOCK_SIZE as usize;
        if file_data.len() < offset + data.len() {
            file_data.resize(offset + data.len(), 0);
        }
        file_data[offset..offset + data.len()].copy_from_slice(data);
        replace_file(&path, &file_data, CreateOptions::new(), false).map_err(|_| CsError::Io)?;

        let block_count = meta.block_count.max(block + 1);
        let mut crcs = meta.crcs;
        if crcs.len() < block_count as usize {
            crcs.resize(block_count as usize, 0);
        }
        crcs[block as usize] = crc;
        index.insert(
            (id, part.part),
            ChunkMeta { version, block_count, size_bytes: file_data.len() as u64, crcs },
        );
        Ok(())
    }

    /// Bumps the version label of an already-stored part without touching
    /// its data, by renaming to the new version's file name.
    pub fn bump_version(&self, id: ChunkId, old_version: Version, new_version: Version, part: ChunkPartType) -> CsResult<()> {
        let mut index = self.index.lock().unwrap();
        let meta = index.get(&(id, part.part)).ok_or(CsError::NoSuchChunk)?.clone();
        if meta.version != old_version {
            return Err(CsError::WrongVersion);
        }
        let old_path = self.path_for(id, old_version, &part);
        let new_path = self.path_for(id, new_version, &part);
        let data = std::fs::read(&old_path).map_err(|_| CsError::Io)?;
        replace_file(&new_path, &data, CreateOptions::new(), false).map_err(|_| CsError::Io)?;
        let _ = std::fs::remove_file(&old_path);
        index.insert((id, part.part), ChunkMeta { version: new_version, ..meta });
        Ok(())
    }

    /// Copies an existing part to a new chunk id/version without touching
    /// the source, the chunkserver side of copy-on-write duplication
    /// (§4.1 `multi_modify`'s non-exclusive path).
    pub fn duplicate(
        &self,
        src_id: ChunkId,
        src_version: Version,
        dst_id: ChunkId,
        dst_version: Version,
        part: ChunkPartType,
    ) -> CsResult<()> {
        let mut index = self.index.lock().unwrap();
        let meta = index.get(&(src_id, part.part)).cloned().ok_or(CsError::NoSuchChunk)?;
        if meta.version != src_version {
            return Err(CsError::WrongVersion);
        }
        if index.contains_key(&(dst_id, part.part)) {
            return Err(CsError::ChunkExists);
        }
        let src_path = self.path_for(src_id, src_version, &part);
        let data = std::fs::read(&src_path).map_err(|_| CsError::Io)?;
        let dir = shard_dir(&self.base, dst_id);
        create_path(&dir, None, Some(CreateOptions::new())).map_err(|_| CsError::Io)?;
        let dst_path = self.path_for(dst_id, dst_version, &part);
        replace_file(&dst_path, &data, CreateOptions::new(), false).map_err(|_| CsError::Io)?;
        index.insert((dst_id, part.part), ChunkMeta { version: dst_version, ..meta });
        Ok(())
    }

    /// Resizes an already-stored part to `new_length` bytes, landing under
    /// `new_version`; zero-extends on growth and recomputes the CRC of
    /// whatever final block the new length lands in.
    pub fn truncate(
        &self,
        id: ChunkId,
        old_version: Version,
        new_version: Version,
        part: ChunkPartType,
        new_length: u64,
    ) -> CsResult<()> {
        let mut index = self.index.lock().unwrap();
        let meta = index.get(&(id, part.part)).cloned().ok_or(CsError::NoSuchChunk)?;
        if meta.version != old_version {
            return Err(CsError::WrongVersion);
        }
        let old_path = self.path_for(id, old_version, &part);
        let mut data = std::fs::read(&old_path).unwrap_or_default();
        data.resize(new_length as usize, 0);

        let new_path = self.path_for(id, new_version, &part);
        replace_file(&new_path, &data, CreateOptions::new(), false).map_err(|_| CsError::Io)?;
        if old_version != new_version {
            let _ = std::fs::remove_file(&old_path);
        }

        let block_count = (data.len() as u32 + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let crcs = data.chunks(BLOCK_SIZE as usize).map(|b| dfs_tools::crc::crc32(0, b)).collect();
        index.insert(
            (id, part.part),
            ChunkMeta { version: new_version, block_count, size_bytes: data.len() as u64, crcs },
        );
        Ok(())
    }

    pub fn delete(&self, id: ChunkId, version: Version, part: ChunkPartType) -> CsResult<()> {
        let mut index = self.index.lock().unwrap();
        if index.remove(&(id, part.part)).is_none() {
            return Err(CsError::NoSuchChunk);
        }
        let path = self.path_for(id, version, &part);
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    pub fn read_block(&self, id: ChunkId, version: Version, part: ChunkPartType, block: u32) -> CsResult<(Vec<u8>, u32)> {
        let meta = {
            let index = self.index.lock().unwrap();
            index.get(&(id, part.part)).cloned().ok_or(CsError::NoSuchChunk)?
        };
        if meta.version != version {
            return Err(CsError::WrongVersion);
        }
        if block >= meta.block_count {
            return Err(CsError::WrongOffset);
        }
        let path = self.path_for(id, version, &part);
        let offset = block as u64 * BLOCK_SIZE as u64;
        let data = std::fs::read(&path).map_err(|_| CsError::Io)?;
        let start = offset as usize;
        let end = (start + BLOCK_SIZE as usize).min(data.len());
        Ok((data[start..end].to_vec(), meta.crcs[block as usize]))
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_proto::types::{ChunkPartType, SliceType};

    fn part() -> ChunkPartType {
        ChunkPartType { slice: SliceType::Standard, part: 0 }
    }

    #[test]
    fn create_then_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();

        let block = vec![0xabu8; BLOCK_SIZE as usize];
        let crc = dfs_tools::crc::crc32(0, &block);
        store.write_full(1, 1, part(), &[(block.clone(), crc)]).unwrap();

        let (read_back, read_crc) = store.read_block(1, 1, part(), 0).unwrap();
        assert_eq!(read_back, block);
        assert_eq!(read_crc, crc);
    }

    #[test]
    fn create_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        assert_eq!(store.create(1, 1, part()).unwrap_err(), CsError::ChunkExists);
    }

    #[test]
    fn write_with_wrong_crc_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        let block = vec![0u8; BLOCK_SIZE as usize];
        let err = store.write_full(1, 1, part(), &[(block, 0xdead_beef)]).unwrap_err();
        assert_eq!(err, CsError::CrcMismatch);
    }

    #[test]
    fn bump_version_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        let block = vec![7u8; BLOCK_SIZE as usize];
        let crc = dfs_tools::crc::crc32(0, &block);
        store.write_full(1, 1, part(), &[(block.clone(), crc)]).unwrap();

        store.bump_version(1, 1, 2, part()).unwrap();
        let (read_back, _) = store.read_block(1, 2, part(), 0).unwrap();
        assert_eq!(read_back, block);
        assert_eq!(store.meta(1, 0).unwrap().version, 2);
    }

    #[test]
    fn write_block_then_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();

        let block0 = vec![0x11u8; BLOCK_SIZE as usize];
        let block1 = vec![0x22u8; BLOCK_SIZE as usize];
        let crc0 = dfs_tools::crc::crc32(0, &block0);
        let crc1 = dfs_tools::crc::crc32(0, &block1);
        // out of order, as a retry might deliver them
        store.write_block(1, 1, part(), 1, &block1, crc1).unwrap();
        store.write_block(1, 1, part(), 0, &block0, crc0).unwrap();

        let (read0, read_crc0) = store.read_block(1, 1, part(), 0).unwrap();
        let (read1, read_crc1) = store.read_block(1, 1, part(), 1).unwrap();
        assert_eq!(read0, block0);
        assert_eq!(read_crc0, crc0);
        assert_eq!(read1, block1);
        assert_eq!(read_crc1, crc1);
    }

    #[test]
    fn write_block_rejects_wrong_crc() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        let block = vec![0u8; BLOCK_SIZE as usize];
        let err = store.write_block(1, 1, part(), 0, &block, 0xdead_beef).unwrap_err();
        assert_eq!(err, CsError::CrcMismatch);
    }

    #[test]
    fn duplicate_copies_data_to_a_new_chunk_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        let block = vec![9u8; BLOCK_SIZE as usize];
        let crc = dfs_tools::crc::crc32(0, &block);
        store.write_full(1, 1, part(), &[(block.clone(), crc)]).unwrap();

        store.duplicate(1, 1, 2, 1, part()).unwrap();
        let (read_back, _) = store.read_block(2, 1, part(), 0).unwrap();
        assert_eq!(read_back, block);
        assert!(store.has(1, 0));
    }

    #[test]
    fn truncate_shrinks_and_recomputes_the_final_crc() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        let block = vec![3u8; BLOCK_SIZE as usize];
        let crc = dfs_tools::crc::crc32(0, &block);
        store.write_full(1, 1, part(), &[(block, crc)]).unwrap();

        store.truncate(1, 1, 2, part(), 10).unwrap();
        let meta = store.meta(1, 0).unwrap();
        assert_eq!(meta.size_bytes, 10);
        assert_eq!(meta.version, 2);
        let (read_back, read_crc) = store.read_block(1, 2, part(), 0).unwrap();
        assert_eq!(read_back.len(), 10);
        assert_eq!(read_crc, meta.crcs[0]);
    }

    #[test]
    fn delete_removes_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.create(1, 1, part()).unwrap();
        store.delete(1, 1, part()).unwrap();
        assert!(!store.has(1, 0));
    }
}
