//! Goals (named redundancy multisets) and the `ChunkCopiesCalculator` that
//! evaluates a chunk's current parts against a goal.

use std::collections::HashMap;

use dfs_proto::types::SliceType;

pub type Label = String;

/// Matches any label when used in a [`SliceGoal`]'s part-count map.
pub const WILDCARD_LABEL: &str = "*";

/// One independent way to have a full, reconstructible representation of a
/// chunk: either `n` plain copies, or one XOR/EC slice family. A [`Goal`]
/// can list more than one of these (e.g. "2 standard copies AND a 3-xor
/// group") — the chunk is readable as long as any one of them is intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceGoal {
    pub slice: SliceType,
    /// `(label, count)`; `WILDCARD_LABEL` matches any label and is always
    /// evaluated last, after non-wildcard labels are satisfied.
    pub label_counts: Vec<(Label, u32)>,
}

impl SliceGoal {
    pub fn standard(count: u32) -> Self {
        SliceGoal {
            slice: SliceType::Standard,
            label_counts: vec![(WILDCARD_LABEL.to_string(), count)],
        }
    }

    pub fn required_count(&self) -> u32 {
        self.label_counts.iter().map(|(_, c)| c).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goal {
    pub name: String,
    pub slices: Vec<SliceGoal>,
}

impl Goal {
    pub fn standard(name: &str, count: u32) -> Self {
        Goal {
            name: name.to_string(),
            slices: vec![SliceGoal::standard(count)],
        }
    }

    /// Merges several goals referenced by the same chunk (snapshot sharing,
    /// data model invariant I5) into one: the union of their slice families,
    /// each requirement raised to the max across the referenced goals.
    pub fn merge<'a>(goals: impl IntoIterator<Item = &'a Goal>) -> Goal {
        let mut by_slice: HashMap<SliceType, SliceGoal> = HashMap::new();
        for goal in goals {
            for slice_goal in &goal.slices {
                by_slice
                    .entry(slice_goal.slice)
                    .and_modify(|existing| {
                        if slice_goal.required_count() > existing.required_count() {
                            *existing = slice_goal.clone();
                        }
                    })
                    .or_insert_with(|| slice_goal.clone());
            }
        }
        Goal {
            name: "merged".to_string(),
            slices: by_slice.into_values().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Safe,
    Endangered,
    Lost,
}

impl Availability {
    fn worse(self, other: Availability) -> Availability {
        use Availability::*;
        match (self, other) {
            (Lost, _) | (_, Lost) => Lost,
            (Endangered, _) | (_, Endangered) => Endangered,
            _ => Safe,
        }
    }

    fn best(self, other: Availability) -> Availability {
        use Availability::*;
        match (self, other) {
            (Safe, _) | (_, Safe) => Safe,
            (Endangered, _) | (_, Endangered) => Endangered,
            _ => Lost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopiesSummary {
    pub state_is_safe: bool,
    pub state_is_lost: bool,
    pub missing_count: u32,
    pub redundant_count: u32,
    pub full_copies: u32,
}

impl CopiesSummary {
    pub fn state(&self) -> Availability {
        if self.state_is_lost {
            Availability::Lost
        } else if self.state_is_safe {
            Availability::Safe
        } else {
            Availability::Endangered
        }
    }
}

/// One valid, readable chunk part as seen by the placement/availability
/// logic (`Busy`/`TdBusy` parts are excluded before this is built, per the
/// `ChunkPart` invariant that those states must never be observed here).
#[derive(Debug, Clone, Copy)]
pub struct PartView<'a> {
    pub slice: SliceType,
    pub part: u8,
    pub label: &'a str,
}

/// Evaluates a chunk's valid parts against a (possibly merged) goal.
pub struct ChunkCopiesCalculator;

impl ChunkCopiesCalculator {
    pub fn compute(goal: &Goal, parts: &[PartView]) -> CopiesSummary {
        let mut overall: Option<Availability> = None;
        let mut missing_total = 0u32;
        let mut redundant_total = 0u32;
        let mut full_copies = 0u32;

        for slice_goal in &goal.slices {
            let have: u32 = parts.iter().filter(|p| p.slice == slice_goal.slice).count() as u32;
            let required = slice_goal.required_count();

            if slice_goal.slice == SliceType::Standard {
                full_copies += have;
            }

            let (state, missing, redundant) = match slice_goal.slice {
                SliceType::Standard => {
                    let missing = required.saturating_sub(have);
                    let redundant = have.saturating_sub(required);
                    let state = if have == 0 && required > 0 {
                        Availability::Lost
                    } else if have > required {
                        Availability::Safe
                    } else if have == required {
                        Availability::Endangered
                    } else {
                        Availability::Endangered
                    };
                    (state, missing, redundant)
                }
                SliceType::Xor { level } => {
                    let missing = (level as u32).saturating_sub(have);
                    let state = if have >= level as u32 {
                        Availability::Safe
                    } else if have + 1 >= level as u32 {
                        Availability::Endangered
                    } else {
                        Availability::Lost
                    };
                    (state, missing, 0)
                }
                SliceType::Ec { data_k, parity_m } | SliceType::Ec2 { data_k, parity_m } => {
                    let total = data_k as u32 + parity_m as u32;
                    let missing = total.saturating_sub(have);
                    let state = if have >= total {
                        Availability::Safe
                    } else if have > data_k as u32 {
                        Availability::Safe
                    } else if have == data_k as u32 {
                        Availability::Endangered
                    } else {
                        Availability::Lost
                    };
                    (state, missing, 0)
                }
            };

            missing_total += missing;
            redundant_total += redundant;
            overall = Some(match overall {
                None => state,
                Some(prev) => prev.best(state),
            });
        }

        let state = overall.unwrap_or(Availability::Lost);
        CopiesSummary {
            state_is_safe: matches!(state, Availability::Safe),
            state_is_lost: matches!(state, Availability::Lost),
            missing_count: missing_total,
            redundant_count: redundant_total,
            full_copies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_goal_safe_when_above_requirement() {
        let goal = Goal::standard("2x", 2);
        let parts = vec![
            PartView { slice: SliceType::Standard, part: 0, label: "a" },
            PartView { slice: SliceType::Standard, part: 0, label: "b" },
            PartView { slice: SliceType::Standard, part: 0, label: "c" },
        ];
        let summary = ChunkCopiesCalculator::compute(&goal, &parts);
        assert_eq!(summary.state(), Availability::Safe);
        assert_eq!(summary.redundant_count, 1);
        assert_eq!(summary.full_copies, 3);
    }

    #[test]
    fn standard_goal_endangered_at_exact_requirement() {
        let goal = Goal::standard("2x", 2);
        let parts = vec![
            PartView { slice: SliceType::Standard, part: 0, label: "a" },
            PartView { slice: SliceType::Standard, part: 0, label: "b" },
        ];
        let summary = ChunkCopiesCalculator::compute(&goal, &parts);
        assert_eq!(summary.state(), Availability::Endangered);
        assert_eq!(summary.missing_count, 0);
    }

    #[test]
    fn standard_goal_lost_with_zero_parts() {
        let goal = Goal::standard("2x", 2);
        let summary = ChunkCopiesCalculator::compute(&goal, &[]);
        assert_eq!(summary.state(), Availability::Lost);
        assert_eq!(summary.missing_count, 2);
    }

    #[test]
    fn ec_goal_tolerates_parity_loss() {
        let goal = Goal {
            name: "ec".into(),
            slices: vec![SliceGoal {
                slice: SliceType::Ec { data_k: 4, parity_m: 2 },
                label_counts: vec![(WILDCARD_LABEL.into(), 6)],
            }],
        };
        let parts: Vec<_> = (0..5)
            .map(|i| PartView { slice: SliceType::Ec { data_k: 4, parity_m: 2 }, part: i, label: "a" })
            .collect();
        let summary = ChunkCopiesCalculator::compute(&goal, &parts);
        assert_eq!(summary.state(), Availability::Safe);
    }

    #[test]
    fn merge_keeps_the_larger_requirement_per_slice() {
        let a = Goal::standard("small", 1);
        let b = Goal::standard("big", 3);
        let merged = Goal::merge([&a, &b]);
        assert_eq!(merged.slices.len(), 1);
        assert_eq!(merged.slices[0].required_count(), 3);
    }
}
