//! Drives candidates through a fixed ladder of rungs of increasing shard
//! fraction (§4.5, ASHA). The rung ladder is a `coroutines::coroutine`
//! stream of per-rung batches, mirroring the teacher's
//! `automations::server::ready_tasks` use of the same primitive to build a
//! `Stream` of cohort-ready work the caller drains one item at a time.

use std::sync::Arc;

use evaluator::{CancelToken, Evaluator};
use fingerprint::Fingerprint;
use futures_core::Stream;
use types::{Candidate, Rung, ShardResult};

/// Per-candidate lifecycle (§4.5). `Promoted`/`Pruned` carry the rung index
/// they were decided at; `FullyEvaluated` is reached only from the top rung.
#[derive(Clone, Debug, PartialEq)]
pub enum CandidateState {
    Admitted,
    Racing(usize),
    Promoted(usize),
    Pruned(usize),
    FullyEvaluated,
}

/// One candidate racing through the ladder, with enough history to judge
/// the `eps_improve` promotion clause.
#[derive(Clone)]
pub struct RaceEntry {
    pub candidate: Candidate,
    pub state: CandidateState,
    prior_objective: Option<f64>,
}

impl RaceEntry {
    pub fn admitted(candidate: Candidate) -> Self {
        Self {
            candidate,
            state: CandidateState::Admitted,
            prior_objective: None,
        }
    }
}

/// The outcome of racing one candidate through one rung.
#[derive(Clone)]
pub struct RungOutcome {
    pub candidate: Candidate,
    pub fingerprint: Fingerprint,
    pub state: CandidateState,
    pub shard_result: ShardResult,
}

/// One rung's worth of outcomes, yielded by [`race_cohort`] as each rung
/// completes.
pub struct RungBatch {
    pub rung_index: usize,
    pub outcomes: Vec<RungOutcome>,
}

/// Races `cohort` through `rungs` in sequence, yielding a [`RungBatch`] per
/// rung. The caller (Orchestrator) drains the stream once per round;
/// candidates pruned at a rung do not appear in later batches.
pub fn race_cohort(
    evaluator: Arc<Evaluator>,
    rungs: Vec<Rung>,
    promote_objective: String,
    cancel: CancelToken,
    cohort: Vec<RaceEntry>,
) -> impl Stream<Item = RungBatch> {
    coroutines::coroutine(move |mut co| async move {
        let mut cohort = cohort;
        let top_rung = rungs.len().saturating_sub(1);

        for rung in rungs.iter() {
            if cohort.is_empty() {
                break;
            }

            let shard_futures = cohort
                .iter()
                .map(|entry| evaluator.evaluate(&entry.candidate, &rung.example_ids, &cancel));
            let shard_results = futures::future::join_all(shard_futures).await;

            let decisions = decide_promotions(&cohort, &shard_results, rung, &promote_objective, rung.index == top_rung);

            let mut batch = Vec::with_capacity(decisions.len());
            let mut survivors = Vec::with_capacity(decisions.len());
            for (entry, shard_result, new_state, promotion_value) in decisions {
                batch.push(RungOutcome {
                    candidate: entry.candidate.clone(),
                    fingerprint: entry.candidate.fingerprint(),
                    state: new_state.clone(),
                    shard_result: shard_result.clone(),
                });
                if matches!(new_state, CandidateState::Promoted(_)) {
                    survivors.push(RaceEntry {
                        candidate: entry.candidate,
                        state: new_state,
                        prior_objective: Some(promotion_value),
                    });
                }
            }

            cohort = survivors;
            () = co
                .yield_(RungBatch {
                    rung_index: rung.index,
                    outcomes: batch,
                })
                .await;
        }
    })
}

/// Tie-break total order (§4.5): higher `quality`, then higher `neg_cost`,
/// then lower fingerprint lexicographically. Computed over the whole cohort
/// at once, never incrementally, since promotion requires every cohort
/// member's result to be visible first.
fn tie_break_key(shard: &ShardResult, fingerprint: &Fingerprint) -> (std::cmp::Reverse<OrderedF64>, std::cmp::Reverse<OrderedF64>, String) {
    (
        std::cmp::Reverse(OrderedF64(shard.objective(types::OBJECTIVE_QUALITY))),
        std::cmp::Reverse(OrderedF64(shard.objective(types::OBJECTIVE_NEG_COST))),
        fingerprint.to_string(),
    )
}

#[derive(Clone, Copy, PartialEq)]
struct OrderedF64(f64);

impl Eq for OrderedF64 {}
impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[allow(clippy::type_complexity)]
fn decide_promotions(
    cohort: &[RaceEntry],
    shard_results: &[ShardResult],
    rung: &Rung,
    promote_objective: &str,
    is_top_rung: bool,
) -> Vec<(RaceEntry, ShardResult, CandidateState, f64)> {
    let mut order: Vec<usize> = (0..cohort.len()).collect();
    order.sort_by_key(|&i| tie_break_key(&shard_results[i], &cohort[i].candidate.fingerprint()));

    let cutoff = ((cohort.len() as f64) * rung.promotion_quantile).ceil() as usize;
    let cutoff = cutoff.min(cohort.len());
    let promoted_by_rank: std::collections::HashSet<usize> = order.iter().take(cutoff).copied().collect();

    cohort
        .iter()
        .cloned()
        .zip(shard_results.iter().cloned())
        .enumerate()
        .map(|(i, (entry, shard_result))| {
            let promotion_value = shard_result.objective(promote_objective);

            if shard_result.has_structural_failure() {
                return (entry, shard_result, CandidateState::Pruned(rung.index), promotion_value);
            }

            let improved_enough = entry
                .prior_objective
                .map(|prior| promotion_value - prior >= rung.eps_improve)
                .unwrap_or(false);

            let survives = promoted_by_rank.contains(&i) || improved_enough;

            let new_state = if !survives {
                CandidateState::Pruned(rung.index)
            } else if is_top_rung {
                CandidateState::FullyEvaluated
            } else {
                CandidateState::Promoted(rung.index + 1)
            };

            (entry, shard_result, new_state, promotion_value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cache::Cache;
    use evaluator::{cancel_pair, OracleError, RetryPolicy, TaskOracle};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use types::{Config, EvaluationResult, ExampleId, Origin};

    struct LengthOracle;

    #[async_trait]
    impl TaskOracle for LengthOracle {
        async fn score(&self, candidate: &Candidate, _id: &ExampleId) -> Result<EvaluationResult, OracleError> {
            let quality = if candidate.text.len() > 10 { 0.9 } else { 0.1 };
            let mut objectives = BTreeMap::new();
            objectives.insert("quality".to_string(), quality);
            objectives.insert("neg_cost".to_string(), -1.0);
            objectives.insert("tokens".to_string(), candidate.text.len() as f64);
            Ok(EvaluationResult {
                objectives,
                trace: None,
                failure: quality < 0.2,
            })
        }
    }

    fn rungs() -> Vec<Rung> {
        let cfg = Config::default();
        cfg.shards
            .iter()
            .enumerate()
            .map(|(i, _)| Rung {
                index: i,
                fraction: cfg.shards[i],
                example_ids: vec![ExampleId::from("ex-1"), ExampleId::from("ex-2")],
                promotion_quantile: 1.0 - cfg.cohort_quantile,
                eps_improve: cfg.eps_improve,
            })
            .collect()
    }

    #[tokio::test]
    async fn long_candidates_are_promoted_over_short_ones() {
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let evaluator = Arc::new(Evaluator::new(
            cache,
            Arc::new(LengthOracle),
            8,
            RetryPolicy::default(),
            1,
            Duration::from_secs(1),
        ));
        let (_handle, cancel) = cancel_pair();

        let cohort = vec![
            RaceEntry::admitted(Candidate::new("a short one".into(), vec![], Origin::Seed, 3)),
            RaceEntry::admitted(Candidate::new("x".into(), vec![], Origin::Seed, 1)),
        ];

        let stream = race_cohort(evaluator, rungs(), "quality".to_string(), cancel, cohort);
        tokio::pin!(stream);

        let mut last_batch: Option<RungBatch> = None;
        while let Some(batch) = stream.next().await {
            last_batch = Some(batch);
        }
        let last_batch = last_batch.unwrap();
        assert!(last_batch
            .outcomes
            .iter()
            .any(|o| matches!(o.state, CandidateState::FullyEvaluated)));
    }
}
