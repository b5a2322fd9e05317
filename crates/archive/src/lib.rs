//! Maintains the Pareto frontier and QD grid over `FullyEvaluated`
//! candidates (§4.6).
//!
//! Both structures update under one `std::sync::Mutex` critical section per
//! `insert`, matching the Orchestrator being the sole mutator while keeping
//! the type itself `Send + Sync` (§5: "Archive mutation is confined to the
//! Orchestrator").

use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use types::{ArchiveEntry, Candidate, QdBinKey, ShardResult, OBJECTIVE_NEG_COST, OBJECTIVE_QUALITY, OBJECTIVE_TOKENS};

/// The three boolean features packed into [`QdBinKey::flags_bitset`] (§6
/// `qd_flags`, a fixed set). Bit order is stable across a run so replays
/// reproduce identical bin assignments.
const FLAG_HAS_HEADER: u16 = 1 << 0;
const FLAG_MENTIONS_STEPS: u16 = 1 << 1;
const FLAG_HAS_EXAMPLE: u16 = 1 << 2;

/// Computes the QD-grid coordinates for a piece of candidate text (§4.6).
pub fn qd_bin_for(text: &str, qd_bins_length: u8, qd_bins_bullets: u8) -> QdBinKey {
    const LENGTH_BUCKET_WIDTH: usize = 80;

    let length_bucket = ((text.chars().count() / LENGTH_BUCKET_WIDTH) as u8).min(qd_bins_length.saturating_sub(1));

    let bullet_count = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('-') || trimmed.starts_with('*') || starts_with_numbered_item(trimmed)
        })
        .count();
    let bullet_bucket = (bullet_count as u8).min(qd_bins_bullets.saturating_sub(1));

    let lower = text.to_lowercase();
    let mut flags = 0u16;
    if text.lines().any(|line| line.trim_start().starts_with('#')) {
        flags |= FLAG_HAS_HEADER;
    }
    if lower.contains("step by step") || lower.contains("step-by-step") {
        flags |= FLAG_MENTIONS_STEPS;
    }
    if lower.contains("example") || lower.contains("e.g.") {
        flags |= FLAG_HAS_EXAMPLE;
    }

    QdBinKey {
        length_bucket,
        bullet_bucket,
        flags_bitset: flags,
    }
}

fn starts_with_numbered_item(line: &str) -> bool {
    let mut chars = line.chars();
    let mut saw_digit = false;
    for c in chars.by_ref() {
        if c.is_ascii_digit() {
            saw_digit = true;
        } else {
            return saw_digit && c == '.';
        }
    }
    false
}

fn objective_vector(shard: &ShardResult) -> [f64; 3] {
    [
        shard.objective(OBJECTIVE_QUALITY),
        shard.objective(OBJECTIVE_NEG_COST),
        -shard.objective(OBJECTIVE_TOKENS),
    ]
}

fn dominates(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x >= y) && a.iter().zip(b.iter()).any(|(x, y)| x > y)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub pareto_accepted: bool,
    pub qd_accepted: bool,
}

struct ArchiveInner {
    pareto: Vec<ArchiveEntry>,
    qd_grid: HashMap<QdBinKey, ArchiveEntry>,
    qd_bins_length: u8,
    qd_bins_bullets: u8,
    promote_objective: String,
}

pub struct Archive {
    inner: Mutex<ArchiveInner>,
}

impl Archive {
    pub fn new(qd_bins_length: u8, qd_bins_bullets: u8, promote_objective: String) -> Self {
        Self {
            inner: Mutex::new(ArchiveInner {
                pareto: Vec::new(),
                qd_grid: HashMap::new(),
                qd_bins_length,
                qd_bins_bullets,
                promote_objective,
            }),
        }
    }

    /// Updates the Pareto frontier and QD grid under one critical section
    /// (§4.6). Dominated Pareto incumbents are dropped on acceptance; a QD
    /// cell is replaced only when the newcomer's promotion objective is
    /// strictly greater.
    pub fn insert(&self, candidate: Candidate, shard_result: ShardResult) -> InsertOutcome {
        let mut inner = self.inner.lock().expect("archive mutex poisoned");
        let vector = objective_vector(&shard_result);

        let dominated_by_existing = inner.pareto.iter().any(|entry| dominates(&objective_vector(&entry.shard_result), &vector));

        let pareto_accepted = if dominated_by_existing {
            false
        } else {
            inner.pareto.retain(|entry| !dominates(&vector, &objective_vector(&entry.shard_result)));
            true
        };

        let qd_bin = qd_bin_for(&candidate.text, inner.qd_bins_length, inner.qd_bins_bullets);
        let promote_objective = inner.promote_objective.clone();
        let new_score = shard_result.objective(&promote_objective);

        let qd_accepted = match inner.qd_grid.get(&qd_bin) {
            Some(incumbent) if incumbent.shard_result.objective(&promote_objective) >= new_score => false,
            _ => true,
        };

        let mut entry = ArchiveEntry {
            candidate,
            shard_result,
            qd_bin,
            dominated: !pareto_accepted,
        };

        if pareto_accepted {
            inner.pareto.push(entry.clone());
        }
        if qd_accepted {
            entry.dominated = !pareto_accepted;
            inner.qd_grid.insert(qd_bin, entry);
        }

        InsertOutcome {
            pareto_accepted,
            qd_accepted,
        }
    }

    pub fn pareto_candidates(&self) -> Vec<ArchiveEntry> {
        self.inner.lock().expect("archive mutex poisoned").pareto.clone()
    }

    pub fn pareto_len(&self) -> usize {
        self.inner.lock().expect("archive mutex poisoned").pareto.len()
    }

    pub fn qd_populated_bins(&self) -> usize {
        self.inner.lock().expect("archive mutex poisoned").qd_grid.len()
    }

    /// Returns up to `k` QD elites, biased toward underpopulated length
    /// buckets so repeated sampling doesn't always draw from the densest
    /// region of the grid. Deterministic given `seed`.
    pub fn sample_qd(&self, k: usize, seed: u64) -> Vec<ArchiveEntry> {
        let inner = self.inner.lock().expect("archive mutex poisoned");
        if inner.qd_grid.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut per_length_bucket: HashMap<u8, usize> = HashMap::new();
        for key in inner.qd_grid.keys() {
            *per_length_bucket.entry(key.length_bucket).or_insert(0) += 1;
        }

        let mut entries: Vec<(ArchiveEntry, f64)> = inner
            .qd_grid
            .values()
            .map(|entry| {
                let density = per_length_bucket.get(&entry.qd_bin.length_bucket).copied().unwrap_or(1) as f64;
                (entry.clone(), 1.0 / density)
            })
            .collect();

        let mut rng = SmallRng::seed_from_u64(seed);
        entries.shuffle(&mut rng);
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.into_iter().take(k).map(|(entry, _)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use types::Origin;

    fn shard(quality: f64, neg_cost: f64, tokens: f64) -> ShardResult {
        let mut means = BTreeMap::new();
        means.insert(OBJECTIVE_QUALITY.to_string(), quality);
        means.insert(OBJECTIVE_NEG_COST.to_string(), neg_cost);
        means.insert(OBJECTIVE_TOKENS.to_string(), tokens);
        ShardResult {
            means,
            count: 1,
            failure_traces: vec![],
            structural_failures: 0,
            duration: Duration::from_secs(0),
        }
    }

    fn candidate(text: &str) -> Candidate {
        Candidate::new(text.to_string(), vec![], Origin::Seed, 1)
    }

    #[test]
    fn non_dominated_candidates_both_stay_in_the_frontier() {
        let archive = Archive::new(8, 6, "quality".into());
        archive.insert(candidate("a"), shard(0.9, -1.0, 10.0));
        archive.insert(candidate("b"), shard(0.5, -0.1, 5.0));
        assert_eq!(archive.pareto_len(), 2);
    }

    #[test]
    fn dominated_candidate_is_rejected_from_the_frontier() {
        let archive = Archive::new(8, 6, "quality".into());
        archive.insert(candidate("a"), shard(0.9, -0.1, 5.0));
        let outcome = archive.insert(candidate("b"), shard(0.1, -1.0, 50.0));
        assert!(!outcome.pareto_accepted);
        assert_eq!(archive.pareto_len(), 1);
    }

    #[test]
    fn inserting_a_dominating_candidate_evicts_the_incumbent() {
        let archive = Archive::new(8, 6, "quality".into());
        archive.insert(candidate("a"), shard(0.5, -1.0, 10.0));
        archive.insert(candidate("b"), shard(0.9, -0.1, 5.0));
        let frontier = archive.pareto_candidates();
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].candidate.fingerprint(), candidate("b").fingerprint());
    }

    #[test]
    fn qd_cell_only_replaced_by_strictly_better_score() {
        let archive = Archive::new(1, 1, "quality".into());
        archive.insert(candidate("same bucket one"), shard(0.5, -1.0, 1.0));
        let outcome = archive.insert(candidate("same bucket two"), shard(0.5, -1.0, 1.0));
        assert!(!outcome.qd_accepted);
        let better = archive.insert(candidate("same bucket three"), shard(0.9, -1.0, 1.0));
        assert!(better.qd_accepted);
    }

    #[test]
    fn sample_qd_respects_k() {
        let archive = Archive::new(8, 6, "quality".into());
        for i in 0..10 {
            archive.insert(candidate(&format!("candidate number {i} with some length")), shard(i as f64 / 10.0, -1.0, i as f64));
        }
        let sample = archive.sample_qd(3, 42);
        assert_eq!(sample.len(), 3);
    }
}
