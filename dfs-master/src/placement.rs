//! `choose_servers_for_new_chunk`: candidate ordering and label-aware
//! placement for a new chunk's parts.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use dfs_proto::types::ServerId;
use rand::seq::SliceRandom;

use crate::errors::ChunkError;
use crate::goal::{Goal, Label, WILDCARD_LABEL};

/// One chunkserver as seen by the placement engine for a single
/// `choose_servers_for_new_chunk` call.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub server_id: ServerId,
    pub label: Label,
    pub weight: u32,
    pub version: u32,
    pub load_factor: f64,
    pub ip: Ipv4Addr,
    pub usage_fraction: f64,
    /// Running count of chunks placed here so far (the "creation history"
    /// of §4.2 step 1); reset by the caller on topology change or overflow.
    pub chunks_created: u64,
}

/// Overflow guard: reset a server's creation-history counter past this
/// (`kMaxChunkCount` in the original).
pub const CREATION_HISTORY_OVERFLOW: u64 = 1_000_000;

fn relative_usage(c: &Candidate) -> f64 {
    // chunks_created * other.weight compared pairwise in the original;
    // normalizing by this server's own weight yields an equivalent total
    // order (lower ratio = relatively less loaded) while staying a valid
    // sort key rather than a non-transitive pairwise comparator.
    c.chunks_created as f64 / (c.weight.max(1)) as f64
}

/// Sorts `candidates` by relative disk usage, then higher weight first,
/// then lower load factor, shuffling first so usage ties break randomly
/// (§4.2 step 2). When `avoid_same_ip`, stably re-buckets so servers
/// sharing an IP are spread across the output by occurrence index
/// (§4.2 step 3).
pub fn order_candidates(candidates: &mut Vec<Candidate>, avoid_same_ip: bool) {
    candidates.shuffle(&mut rand::thread_rng());
    candidates.sort_by(|a, b| {
        relative_usage(a)
            .partial_cmp(&relative_usage(b))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.weight.cmp(&a.weight))
            .then(a.load_factor.partial_cmp(&b.load_factor).unwrap_or(std::cmp::Ordering::Equal))
    });

    if avoid_same_ip {
        *candidates = avoid_same_ip_rebucket(candidates);
    }
}

fn avoid_same_ip_rebucket(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut ip_counter: HashMap<Ipv4Addr, usize> = HashMap::new();
    let mut occurrence_no = Vec::with_capacity(candidates.len());
    let mut offsets = vec![0usize];
    for c in candidates {
        let count = ip_counter.entry(c.ip).or_insert(0);
        occurrence_no.push(*count);
        if *count + 1 >= offsets.len() {
            offsets.push(1);
        } else {
            offsets[*count + 1] += 1;
        }
        *count += 1;
    }
    for i in 1..offsets.len() {
        offsets[i] += offsets[i - 1];
    }
    let mut out: Vec<Option<Candidate>> = vec![None; candidates.len()];
    for (c, &occ) in candidates.iter().zip(occurrence_no.iter()) {
        let slot = &mut offsets[occ];
        out[*slot] = Some(c.clone());
        *slot += 1;
    }
    out.into_iter().map(|c| c.unwrap()).collect()
}

/// Picks servers for one slice family's label requirements: non-wildcard
/// labels are filled greedily first, then any remaining servers pad the
/// count up to the total required.
fn choose_for_labels(
    ordered: &[Candidate],
    label_counts: &[(Label, u32)],
    min_version: u32,
    used: &mut Vec<ServerId>,
) -> Vec<ServerId> {
    let mut result = Vec::new();
    for (label, count) in label_counts {
        if label == WILDCARD_LABEL {
            continue;
        }
        let mut remaining = *count;
        for c in ordered {
            if remaining == 0 {
                break;
            }
            if c.version < min_version || used.contains(&c.server_id) {
                continue;
            }
            if &c.label == label {
                result.push(c.server_id);
                used.push(c.server_id);
                remaining -= 1;
            }
        }
    }

    let expected: u32 = label_counts.iter().map(|(_, c)| c).sum();
    for c in ordered {
        if result.len() as u32 >= expected {
            break;
        }
        if c.version < min_version || used.contains(&c.server_id) {
            continue;
        }
        result.push(c.server_id);
        used.push(c.server_id);
    }
    result
}

/// Selects one server per required part of `goal`. Fails with
/// `NoChunkservers` when too few eligible servers exist at all, or
/// `NoSpace` when enough servers exist but none have any space left.
pub fn choose_servers_for_new_chunk(
    candidates: &mut Vec<Candidate>,
    goal: &Goal,
    min_cs_version: u32,
    avoid_same_ip: bool,
) -> Result<Vec<ServerId>, ChunkError> {
    order_candidates(candidates, avoid_same_ip);

    let mut used = Vec::new();
    let mut result = Vec::new();
    for slice_goal in &goal.slices {
        let picked = choose_for_labels(candidates, &slice_goal.label_counts, min_cs_version, &mut used);
        result.extend(picked);
    }

    let total_required: u32 = goal.slices.iter().map(|s| s.required_count()).sum();
    if (result.len() as u32) < total_required {
        let eligible = candidates.iter().filter(|c| c.version >= min_cs_version).count();
        if eligible < total_required as usize {
            return Err(ChunkError::NoChunkservers);
        }
        let with_space = candidates
            .iter()
            .filter(|c| c.version >= min_cs_version && c.usage_fraction < 1.0)
            .count();
        if with_space < total_required as usize {
            return Err(ChunkError::NoSpace);
        }
        return Err(ChunkError::NoChunkservers);
    }

    for id in &used {
        if let Some(c) = candidates.iter_mut().find(|c| c.server_id == *id) {
            c.chunks_created += 1;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::Goal;

    fn candidate(id: ServerId, label: &str, weight: u32) -> Candidate {
        Candidate {
            server_id: id,
            label: label.to_string(),
            weight,
            version: 2,
            load_factor: 0.0,
            ip: Ipv4Addr::new(10, 0, 0, id as u8),
            usage_fraction: 0.1,
            chunks_created: 0,
        }
    }

    #[test]
    fn satisfies_standard_goal_when_enough_servers() {
        let mut candidates = vec![candidate(1, "a", 1), candidate(2, "a", 1), candidate(3, "a", 1)];
        let goal = Goal::standard("2x", 2);
        let result = choose_servers_for_new_chunk(&mut candidates, &goal, 0, false).unwrap();
        assert_eq!(result.len(), 2);
        let unique: std::collections::HashSet<_> = result.iter().collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn fails_with_no_chunkservers_when_too_few() {
        let mut candidates = vec![candidate(1, "a", 1)];
        let goal = Goal::standard("2x", 2);
        let err = choose_servers_for_new_chunk(&mut candidates, &goal, 0, false).unwrap_err();
        assert_eq!(err, ChunkError::NoChunkservers);
    }

    #[test]
    fn avoid_same_ip_spreads_shared_ip_servers() {
        let mut candidates = vec![
            Candidate { ip: Ipv4Addr::new(1, 1, 1, 1), ..candidate(1, "a", 1) },
            Candidate { ip: Ipv4Addr::new(1, 1, 1, 1), ..candidate(2, "a", 1) },
            Candidate { ip: Ipv4Addr::new(2, 2, 2, 2), ..candidate(3, "a", 1) },
        ];
        order_candidates(&mut candidates, true);
        // With avoid_same_ip, the two same-ip servers must not land adjacent
        // at the very front together with nothing between them and the
        // distinct-ip server when there's a choice - i.e. bucket 0 holds one
        // of each ip before any ip repeats.
        let first_ip = candidates[0].ip;
        let second_ip = candidates[1].ip;
        assert_ne!(first_ip, second_ip);
    }

    #[test]
    fn labelled_requirement_prefers_matching_label() {
        let mut candidates = vec![candidate(1, "ssd", 1), candidate(2, "hdd", 1), candidate(3, "hdd", 1)];
        let goal = Goal {
            name: "ssd1".into(),
            slices: vec![crate::goal::SliceGoal {
                slice: dfs_proto::types::SliceType::Standard,
                label_counts: vec![("ssd".into(), 1), (WILDCARD_LABEL.into(), 1)],
            }],
        };
        let result = choose_servers_for_new_chunk(&mut candidates, &goal, 0, false).unwrap();
        assert!(result.contains(&1));
        assert_eq!(result.len(), 2);
    }
}
