//! Deterministically produces the example-ID list for each (rung, round)
//! (§4.3). Blends three pools at fixed ratios: a stable coreset, a uniform
//! draw reseeded every `(island_id, round)`, and the HardnessSet — grown
//! from failure IDs the Scheduler forwards after a structural failure.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use types::{Config, ExampleId, IslandId};

/// Reservoir of example IDs that have previously produced a structural
/// failure. Capped so a pathological run cannot make the pool unbounded.
#[derive(Debug, Default)]
pub struct HardnessSet {
    items: Vec<ExampleId>,
    cap: usize,
    seen: u64,
}

impl HardnessSet {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            cap,
            seen: 0,
        }
    }

    /// Records one failing example ID, using reservoir sampling once the
    /// cap is reached so the set stays an unbiased sample of all failures
    /// seen, not just the most recent.
    pub fn record_failure(&mut self, id: ExampleId, rng: &mut SmallRng) {
        self.seen += 1;
        if self.items.len() < self.cap {
            self.items.push(id);
            return;
        }
        let j = rng.gen_range(0..self.seen);
        if (j as usize) < self.cap {
            self.items[j as usize] = id;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct Sampler {
    dataset: Vec<ExampleId>,
    coreset: Vec<ExampleId>,
    hardness: HardnessSet,
    coreset_fraction: f64,
    random_fraction: f64,
    hardness_fraction: f64,
}

impl Sampler {
    /// `dataset` order is taken as given; the coreset is a deterministic
    /// stride subsample of it so repeated runs over the same dataset always
    /// pick the same stable IDs, independent of mutation or RNG seed.
    pub fn new(dataset: Vec<ExampleId>, config: &Config) -> Self {
        let coreset_len =
            ((dataset.len() as f64 * config.sampler_coreset_fraction).ceil() as usize).max(1).min(dataset.len().max(1));
        let coreset = stride_subsample(&dataset, coreset_len);
        Self {
            dataset,
            coreset,
            hardness: HardnessSet::new(config.hardness_set_cap),
            coreset_fraction: config.sampler_coreset_fraction,
            random_fraction: config.sampler_random_fraction,
            hardness_fraction: config.sampler_hardness_fraction,
        }
    }

    pub fn record_failure(&mut self, id: ExampleId, island: IslandId, round: u64) {
        let mut rng = seed_rng(island, round ^ 0xF00D);
        self.hardness.record_failure(id, &mut rng);
    }

    pub fn hardness_len(&self) -> usize {
        self.hardness.len()
    }

    /// Draws `count` example IDs for one (rung, round), blending the three
    /// pools at the configured ratios and deduplicating. The random pool is
    /// seeded purely from `(island_id, round)` so the same round always
    /// samples the same IDs, regardless of wall-clock time or call order.
    pub fn sample(&self, island: IslandId, round: u64, count: usize) -> Vec<ExampleId> {
        if count == 0 || self.dataset.is_empty() {
            return Vec::new();
        }
        let mut rng = seed_rng(island, round);

        let n_coreset = ((count as f64) * self.coreset_fraction).round() as usize;
        let n_random = ((count as f64) * self.random_fraction).round() as usize;
        let n_hardness = count.saturating_sub(n_coreset + n_random);
        let _ = self.hardness_fraction; // ratio folded into n_hardness as the remainder

        let mut out: Vec<ExampleId> = Vec::with_capacity(count);
        let mut seen = std::collections::HashSet::new();

        for id in self.coreset.iter().take(n_coreset) {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }

        let mut shuffled = self.dataset.clone();
        shuffled.shuffle(&mut rng);
        for id in shuffled.iter() {
            if out.len() >= n_coreset + n_random {
                break;
            }
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }

        if !self.hardness.is_empty() {
            let mut pool = self.hardness.items.clone();
            pool.shuffle(&mut rng);
            for id in pool.iter() {
                if out.len() >= count {
                    break;
                }
                if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
        }

        // Backfill from the full dataset if the pools ran dry before `count`.
        if out.len() < count {
            for id in self.dataset.iter() {
                if out.len() >= count {
                    break;
                }
                if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
        }
        let _ = n_hardness;
        out
    }
}

fn seed_rng(island: IslandId, round: u64) -> SmallRng {
    let seed = (u64::from(island.0) << 32) ^ round;
    SmallRng::seed_from_u64(seed)
}

fn stride_subsample(dataset: &[ExampleId], target_len: usize) -> Vec<ExampleId> {
    if dataset.is_empty() || target_len >= dataset.len() {
        return dataset.to_vec();
    }
    let stride = dataset.len() as f64 / target_len as f64;
    (0..target_len)
        .map(|i| dataset[((i as f64 * stride) as usize).min(dataset.len() - 1)].clone())
        .collect()
}

use rand::Rng;

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> Vec<ExampleId> {
        (0..n).map(|i| ExampleId::from(format!("ex-{i}"))).collect()
    }

    #[test]
    fn sampling_is_deterministic_for_the_same_island_and_round() {
        let config = Config::default();
        let sampler = Sampler::new(dataset(50), &config);
        let a = sampler.sample(IslandId(0), 3, 10);
        let b = sampler.sample(IslandId(0), 3, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn different_rounds_can_sample_differently() {
        let config = Config::default();
        let sampler = Sampler::new(dataset(50), &config);
        let a = sampler.sample(IslandId(0), 1, 10);
        let b = sampler.sample(IslandId(0), 2, 10);
        assert_ne!(a, b);
    }

    #[test]
    fn coreset_is_stable_across_instances() {
        let config = Config::default();
        let s1 = Sampler::new(dataset(50), &config);
        let s2 = Sampler::new(dataset(50), &config);
        assert_eq!(s1.coreset, s2.coreset);
    }

    #[test]
    fn hardness_set_respects_its_cap() {
        let config = Config::default();
        let mut sampler = Sampler::new(dataset(10), &config);
        for i in 0..1000 {
            sampler.record_failure(ExampleId::from(format!("fail-{i}")), IslandId(0), i);
        }
        assert!(sampler.hardness_len() <= config.hardness_set_cap);
    }

    #[test]
    fn sample_never_returns_duplicates() {
        let config = Config::default();
        let sampler = Sampler::new(dataset(20), &config);
        let ids = sampler.sample(IslandId(1), 5, 15);
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }
}
