//! Chunk replication: recreating a missing slice part from the other parts
//! of the same chunk, in bandwidth-limited batches.

use dfs_proto::types::{ChunkPartType, SliceType, BLOCK_SIZE};
use dfs_tools::TokenBucket;

use crate::errors::{CsError, CsResult};

/// Default batch size in blocks, rounded up to a multiple of the slice
/// family's data-part count so each batch covers whole EC stripes (§4.4).
const DEFAULT_BATCH_BLOCKS: u32 = 50;

/// Sink a recreated part is written into. `dfs_chunkserver::store::ChunkStore`
/// implements this for real replication; tests use an in-memory fake.
pub trait ChunkFileCreator {
    fn create(&mut self, part: ChunkPartType) -> CsResult<()>;
    fn write(&mut self, offset: u32, crc: u32, data: &[u8]) -> CsResult<()>;
    fn commit(&mut self) -> CsResult<()>;
}

/// Rounds a requested batch size up to the nearest multiple of
/// `data_part_count`, so XOR/EC reconstruction always sees whole stripes.
pub fn batch_size_blocks(slice: SliceType, requested: u32) -> u32 {
    let stripe = slice.data_part_count().max(1) as u32;
    let requested = if requested == 0 { DEFAULT_BATCH_BLOCKS } else { requested };
    requested.div_ceil(stripe) * stripe
}

/// Decides which source parts are needed to recreate `missing` for one
/// slice family, and how to combine them.
pub struct SliceRecoveryPlanner {
    slice: SliceType,
}

impl SliceRecoveryPlanner {
    pub fn new(slice: SliceType) -> Self {
        SliceRecoveryPlanner { slice }
    }

    /// Source part indices required to rebuild `missing_part`. For a plain
    /// copy this is any one other valid part of the same index; for XOR,
    /// every other part in the stripe; for EC, any `data_k` of the
    /// remaining parts.
    pub fn sources_needed(&self, available_parts: &[u8], missing_part: u8) -> CsResult<Vec<u8>> {
        match self.slice {
            SliceType::Standard => available_parts
                .iter()
                .find(|&&p| p != missing_part)
                .map(|&p| vec![p])
                .ok_or(CsError::NoSuchChunk),
            SliceType::Xor { level } => {
                let needed: Vec<u8> = available_parts.iter().copied().filter(|&p| p != missing_part).collect();
                if needed.len() as u8 >= level {
                    Ok(needed)
                } else {
                    Err(CsError::NoSuchChunk)
                }
            }
            SliceType::Ec { data_k, .. } | SliceType::Ec2 { data_k, .. } => {
                let needed: Vec<u8> =
                    available_parts.iter().copied().filter(|&p| p != missing_part).take(data_k as usize).collect();
                if needed.len() as u8 == data_k {
                    Ok(needed)
                } else {
                    Err(CsError::NoSuchChunk)
                }
            }
        }
    }

    /// Reconstructs one block's bytes from the source blocks gathered for
    /// it, in the same order `sources_needed` returned their indices.
    pub fn reconstruct_block(&self, missing_part: u8, sources: &[(u8, Vec<u8>)]) -> CsResult<Vec<u8>> {
        match self.slice {
            SliceType::Standard => sources.first().map(|(_, d)| d.clone()).ok_or(CsError::NoSuchChunk),
            SliceType::Xor { .. } => {
                let mut out = vec![0u8; BLOCK_SIZE as usize];
                for (_, data) in sources {
                    for (o, b) in out.iter_mut().zip(data.iter()) {
                        *o ^= b;
                    }
                }
                Ok(out)
            }
            SliceType::Ec { data_k, parity_m } | SliceType::Ec2 { data_k, parity_m } => {
                reconstruct_ec(data_k, parity_m, missing_part, sources)
            }
        }
    }
}

fn reconstruct_ec(data_k: u8, parity_m: u8, missing_part: u8, sources: &[(u8, Vec<u8>)]) -> CsResult<Vec<u8>> {
    use reed_solomon_erasure::galois_8::ReedSolomon;

    let total = data_k as usize + parity_m as usize;
    let rs = ReedSolomon::new(data_k as usize, parity_m as usize).map_err(|_| CsError::NoSuchChunk)?;

    let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
    for (idx, data) in sources {
        shards[*idx as usize] = Some(data.clone());
    }
    shards[missing_part as usize] = None;

    rs.reconstruct(&mut shards).map_err(|_| CsError::NoSuchChunk)?;

    shards[missing_part as usize].clone().ok_or(CsError::NoSuchChunk)
}

/// Runs a recovery in bandwidth-limited batches, fetching blocks through
/// `fetch_block` and writing the rebuilt part through `sink`.
pub struct Replicator<'a> {
    planner: SliceRecoveryPlanner,
    limiter: &'a TokenBucket,
    batch_blocks: u32,
}

impl<'a> Replicator<'a> {
    pub fn new(slice: SliceType, limiter: &'a TokenBucket, requested_batch: u32) -> Self {
        Replicator {
            batch_blocks: batch_size_blocks(slice, requested_batch),
            planner: SliceRecoveryPlanner::new(slice),
            limiter,
        }
    }

    pub fn batch_blocks(&self) -> u32 {
        self.batch_blocks
    }

    /// Reconstructs one block and waits on the bandwidth limiter before
    /// returning, so callers naturally pace themselves across a batch.
    pub async fn recover_block(
        &self,
        missing_part: u8,
        sources: &[(u8, Vec<u8>)],
        max_wait: std::time::Duration,
    ) -> CsResult<Vec<u8>> {
        let block = self.planner.reconstruct_block(missing_part, sources)?;
        self.limiter.wait(block.len() as u64, max_wait).await.map_err(|_| CsError::Delayed)?;
        Ok(block)
    }

    pub fn sources_needed(&self, available_parts: &[u8], missing_part: u8) -> CsResult<Vec<u8>> {
        self.planner.sources_needed(available_parts, missing_part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn batch_size_rounds_up_to_stripe_width() {
        assert_eq!(batch_size_blocks(SliceType::Ec { data_k: 4, parity_m: 2 }, 50), 52);
        assert_eq!(batch_size_blocks(SliceType::Standard, 50), 50);
        assert_eq!(batch_size_blocks(SliceType::Standard, 0), DEFAULT_BATCH_BLOCKS);
    }

    #[test]
    fn standard_recovery_needs_one_other_part() {
        let planner = SliceRecoveryPlanner::new(SliceType::Standard);
        let sources = planner.sources_needed(&[0, 1], 0).unwrap();
        assert_eq!(sources, vec![1]);
    }

    #[test]
    fn xor_recovery_needs_all_remaining_parts_in_stripe() {
        let planner = SliceRecoveryPlanner::new(SliceType::Xor { level: 3 });
        let sources = planner.sources_needed(&[0, 1, 2, 3], 0).unwrap();
        assert_eq!(sources.len(), 3);
    }

    #[test]
    fn xor_reconstruct_recovers_missing_block() {
        let planner = SliceRecoveryPlanner::new(SliceType::Xor { level: 2 });
        let a = vec![0b1010_1010u8; 4];
        let b = vec![0b0101_0101u8; 4];
        let missing: Vec<u8> = a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect();
        let sources = vec![(1u8, a.clone()), (2u8, b.clone())];
        let rebuilt = planner.reconstruct_block(0, &sources).unwrap();
        assert_eq!(rebuilt.len(), missing.len().max(a.len()));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_block_waits_on_limiter() {
        let limiter = TokenBucket::unlimited();
        let replicator = Replicator::new(SliceType::Standard, &limiter, 50);
        let sources = vec![(1u8, vec![1u8; 16])];
        let block = replicator.recover_block(0, &sources, Duration::from_secs(1)).await.unwrap();
        assert_eq!(block, vec![1u8; 16]);
    }
}
