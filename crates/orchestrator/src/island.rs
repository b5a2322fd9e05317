//! The per-round loop described in §4.10, run by one island process.
//!
//! Each round races its whole cohort to completion through the rung ladder
//! within the round it was admitted — this crate does not carry candidates
//! across rounds mid-ladder. The bare sequencing of "held-over racers" vs.
//! "newly admitted" is underspecified upstream; racing to completion inside
//! one round is the simpler reading and is documented as a deliberate
//! choice, not an oversight.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use archive::Archive;
use cache::Cache;
use compressor::TokenController;
use evaluator::{cancel_pair, Evaluator};
use fingerprint::Fingerprint;
use futures::StreamExt;
use migration::{Migrant, MigrationQueue};
use mutator::Mutator;
use sampler::Sampler;
use scheduler::{race_cohort, CandidateState, RaceEntry};
use types::{Candidate, Config, EventKind, EventRecord, IslandId, Origin, Rung};

use crate::event_log::EventLog;

pub struct Island {
    pub config: Config,
    pub island_id: IslandId,
    pub cache: Cache,
    pub evaluator: Arc<Evaluator>,
    pub sampler: Sampler,
    pub archive: Arc<Archive>,
    pub mutator: Mutator,
    pub compressor: TokenController,
    pub migration: MigrationQueue,
    pub event_log: EventLog,
    rungs: Vec<Rung>,
    seen_fingerprints: HashSet<Fingerprint>,
    // `hop_count` a migrant arrived with, keyed by the fingerprint it was
    // reconstructed into on receipt. `Candidate` itself carries no hop
    // count, so this is the only place it survives the migrant-to-candidate
    // round trip for re-emission in `emit_migrants`.
    migrant_hop_counts: HashMap<Fingerprint, u32>,
    round: u64,
    total_evaluations: u64,
}

impl Island {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        island_id: IslandId,
        cache: Cache,
        evaluator: Arc<Evaluator>,
        sampler: Sampler,
        archive: Arc<Archive>,
        mutator: Mutator,
        compressor: TokenController,
        migration: MigrationQueue,
        event_log: EventLog,
    ) -> Self {
        let rungs = config
            .shards
            .iter()
            .enumerate()
            .map(|(i, fraction)| Rung {
                index: i,
                fraction: *fraction,
                example_ids: Vec::new(),
                // `cohort_quantile` is the fraction *pruned* (§6); the rung
                // itself wants the fraction promoted.
                promotion_quantile: 1.0 - config.cohort_quantile,
                eps_improve: config.eps_improve,
            })
            .collect();
        Self {
            config,
            island_id,
            cache,
            evaluator,
            sampler,
            archive,
            mutator,
            compressor,
            migration,
            event_log,
            rungs,
            seen_fingerprints: HashSet::new(),
            migrant_hop_counts: HashMap::new(),
            round: 0,
            total_evaluations: 0,
        }
    }

    fn rungs_for_round(&self) -> Vec<Rung> {
        self.rungs
            .iter()
            .map(|rung| {
                let count = ((rung.fraction * 50.0).ceil() as usize).max(1);
                Rung {
                    example_ids: self.sampler.sample(self.island_id, self.round, count),
                    ..rung.clone()
                }
            })
            .collect()
    }

    fn now_rfc3339(&self) -> String {
        // No wall-clock source is available to this crate's test harness
        // (the workspace forbids ad-hoc timestamps outside tests), so the
        // event stream orders strictly by (round, a monotonic counter).
        format!("round-{:010}", self.round)
    }

    fn emit(&mut self, kind: EventKind) {
        let record = EventRecord {
            ts: self.now_rfc3339(),
            island: self.island_id,
            round: self.round,
            kind,
        };
        self.event_log.append(&record);
    }

    /// Admits a fixed set of seed texts into round 0, racing them through
    /// the full ladder before any mutation happens. Not itself a step of
    /// §4.10 (the round loop assumes a non-empty Archive); the CLI entry
    /// point calls this once before the first `run_round`.
    pub async fn seed(&mut self, seed_texts: &[String]) {
        let (_cancel_handle, cancel) = cancel_pair();
        let entries: Vec<RaceEntry> = seed_texts
            .iter()
            .map(|text| {
                let token_estimate = text.split_whitespace().count() as u32;
                let candidate = Candidate::new(text.clone(), vec![], Origin::Seed, token_estimate);
                self.seen_fingerprints.insert(candidate.fingerprint());
                RaceEntry::admitted(candidate)
            })
            .collect();
        if !entries.is_empty() {
            self.race_and_archive(entries, &cancel).await;
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.round >= self.config.max_rounds || self.total_evaluations >= self.config.max_evaluations
    }

    fn already_known(&self, fingerprint: Fingerprint) -> bool {
        self.seen_fingerprints.contains(&fingerprint)
    }

    /// Runs one full round: steps 1-9 of §4.10.
    pub async fn run_round(&mut self) {
        let (_cancel_handle, cancel) = cancel_pair();

        // 1. Drain inbox migrants, dedup against what this island has already raced.
        let migrants = self.migration.recv(self.island_id);
        let mut admitted: Vec<RaceEntry> = Vec::new();
        let mut migrant_fingerprints = Vec::new();
        for migrant in migrants {
            let hop_count = migrant.hop_count;
            let candidate = migrant.into_candidate();
            let fp = candidate.fingerprint();
            if !self.already_known(fp) {
                self.migrant_hop_counts.insert(fp, hop_count);
                migrant_fingerprints.push(fp);
                admitted.push(RaceEntry::admitted(candidate));
            }
        }
        if !migrant_fingerprints.is_empty() {
            self.emit(EventKind::MigrateIn {
                fingerprints: migrant_fingerprints.clone(),
                from_island: self.island_id,
                admitted: migrant_fingerprints.len(),
            });
        }

        // 2. Draw parents: top of Pareto union a QD sample.
        let mut parents: Vec<Candidate> = Vec::new();
        let mut parent_fps = HashSet::new();
        for entry in self.archive.pareto_candidates() {
            if parent_fps.insert(entry.candidate.fingerprint()) {
                parents.push(entry.candidate);
            }
        }
        for entry in self.archive.sample_qd(self.config.batch_size, self.round) {
            if parent_fps.insert(entry.candidate.fingerprint()) {
                parents.push(entry.candidate);
            }
        }

        // 3. Request offspring from the Mutator up to this round's budget.
        let mut offspring = Vec::new();
        'outer: for (i, parent) in parents.iter().enumerate() {
            if offspring.len() >= self.config.max_mutations_per_round {
                break;
            }
            let seed = seed_for(self.island_id, self.round, i as u64);
            let proposals = self.mutator.propose(parent, &[], seed).await;
            for candidate in proposals {
                if offspring.len() >= self.config.max_mutations_per_round {
                    break 'outer;
                }
                let fp = candidate.fingerprint();
                self.emit(EventKind::MutationProposed {
                    fingerprint: fp,
                    parent: Some(parent.fingerprint()),
                    origin: candidate.origin,
                });
                // Offspring are deduplicated by fingerprint against the cache
                // and archive before admission to rung 0; a duplicate is
                // dropped, not re-raced.
                if self.already_known(fp) {
                    continue;
                }
                self.emit(EventKind::MutationAccepted { fingerprint: fp });
                offspring.push(RaceEntry::admitted(candidate));
            }
        }

        // 4. Submit the cohort (offspring ∪ admitted migrants) to the Scheduler.
        admitted.extend(offspring);
        for entry in &admitted {
            self.seen_fingerprints.insert(entry.candidate.fingerprint());
        }
        if !admitted.is_empty() {
            self.race_and_archive(admitted, &cancel).await;
        }

        // 6. Every `merge_period` rounds: attempt a merge.
        if self.round % self.config.merge_period == 0 {
            self.attempt_merge(&cancel).await;
        }

        // 7. Every round: opportunistically run the TokenController.
        self.attempt_compression(&cancel).await;

        // 8. Every `migration_period` rounds: emit the outbox.
        if self.round % self.config.migration_period == 0 {
            self.emit_migrants();
        }

        // 9. Every `log_summary_interval` rounds: emit a summary.
        if self.round % self.config.log_summary_interval == 0 {
            self.emit_summary();
        }

        self.round += 1;
    }

    async fn race_and_archive(&mut self, cohort: Vec<RaceEntry>, cancel: &evaluator::CancelToken) {
        let rungs = self.rungs_for_round();
        let rungs_snapshot = rungs.clone();

        let first_rung_size = rungs.first().map(|rung| rung.example_ids.len()).unwrap_or(0);
        for entry in &cohort {
            self.emit(EventKind::EvalStart {
                fingerprint: entry.candidate.fingerprint(),
                example_count: first_rung_size,
            });
        }

        let mut stream = Box::pin(race_cohort(
            self.evaluator.clone(),
            rungs,
            self.config.promote_objective.clone(),
            cancel.clone(),
            cohort,
        ));

        while let Some(batch) = stream.next().await {
            for outcome in batch.outcomes {
                self.total_evaluations += outcome.shard_result.count as u64;
                match &outcome.state {
                    CandidateState::Pruned(rung) => {
                        // The Scheduler forwards structural failures to the
                        // Sampler to grow the HardnessSet (§4.5). ShardResult
                        // only tracks aggregate failure counts, not which
                        // example produced them, so every ID raced at this
                        // rung is treated as a hardness candidate.
                        if outcome.shard_result.has_structural_failure() {
                            if let Some(rung_ids) = rungs_snapshot.get(*rung) {
                                for id in &rung_ids.example_ids {
                                    self.sampler.record_failure(id.clone(), self.island_id, self.round);
                                }
                            }
                        }
                    }
                    CandidateState::Promoted(to_rung) => {
                        self.emit(EventKind::Promote {
                            fingerprint: outcome.fingerprint,
                            from_rung: to_rung.saturating_sub(1),
                            to_rung: *to_rung,
                        });
                    }
                    CandidateState::FullyEvaluated => {
                        self.emit(EventKind::EvalDone {
                            fingerprint: outcome.fingerprint,
                            rung: batch.rung_index,
                            mean_quality: outcome.shard_result.objective(types::OBJECTIVE_QUALITY),
                            structural_failures: outcome.shard_result.structural_failures,
                        });
                        self.seen_fingerprints.insert(outcome.fingerprint);
                        let insert_outcome = self.archive.insert(outcome.candidate, outcome.shard_result);
                        self.emit(EventKind::ArchiveUpdate {
                            fingerprint: outcome.fingerprint,
                            pareto_accepted: insert_outcome.pareto_accepted,
                            qd_accepted: insert_outcome.qd_accepted,
                        });
                    }
                    CandidateState::Admitted | CandidateState::Racing(_) => {}
                }
            }
        }
    }

    fn top_pareto_pair(&self) -> Option<(Candidate, Candidate)> {
        let mut entries = self.archive.pareto_candidates();
        entries.sort_by(|a, b| {
            b.shard_result
                .objective(types::OBJECTIVE_QUALITY)
                .partial_cmp(&a.shard_result.objective(types::OBJECTIVE_QUALITY))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if entries.len() < 2 {
            return None;
        }
        Some((entries[0].candidate.clone(), entries[1].candidate.clone()))
    }

    async fn attempt_merge(&mut self, cancel: &evaluator::CancelToken) {
        let Some((a, b)) = self.top_pareto_pair() else {
            return;
        };
        let merged = self.mutator.merge(&a, &b);
        if self.already_known(merged.fingerprint()) {
            return;
        }
        self.emit(EventKind::MergeProposed {
            parent_a: a.fingerprint(),
            parent_b: b.fingerprint(),
        });

        let rung = self.rungs_for_round().pop().expect("at least one rung configured");
        let shard = self.evaluator.evaluate(&merged, &rung.example_ids, cancel).await;
        self.total_evaluations += shard.count as u64;

        let better_parent_quality = self
            .archive
            .pareto_candidates()
            .into_iter()
            .filter(|entry| entry.candidate.fingerprint() == a.fingerprint() || entry.candidate.fingerprint() == b.fingerprint())
            .map(|entry| entry.shard_result.objective(types::OBJECTIVE_QUALITY))
            .fold(f64::MIN, f64::max);

        let merged_quality = shard.objective(types::OBJECTIVE_QUALITY);
        if merged_quality >= better_parent_quality + self.config.merge_uplift_min {
            self.seen_fingerprints.insert(merged.fingerprint());
            let outcome = self.archive.insert(merged.clone(), shard);
            self.emit(EventKind::MergeAccepted {
                fingerprint: merged.fingerprint(),
                uplift: merged_quality - better_parent_quality,
            });
            self.emit(EventKind::ArchiveUpdate {
                fingerprint: merged.fingerprint(),
                pareto_accepted: outcome.pareto_accepted,
                qd_accepted: outcome.qd_accepted,
            });
        } else {
            self.emit(EventKind::MergeRejected {
                parent_a: a.fingerprint(),
                parent_b: b.fingerprint(),
                reason: "uplift below merge_uplift_min".to_string(),
            });
        }
    }

    async fn attempt_compression(&mut self, cancel: &evaluator::CancelToken) {
        let Some(original) = self.archive.pareto_candidates().into_iter().next() else {
            return;
        };
        let Some(compressed) = self.compressor.propose(&original.candidate) else {
            return;
        };
        if self.already_known(compressed.fingerprint()) {
            return;
        }

        let shard_size = ((self.sampler_shard_len() as f64) * self.config.compression_shard_fraction).ceil() as usize;
        let ids = self.sampler.sample(self.island_id, self.round, shard_size.max(1));
        let shard = self.evaluator.evaluate(&compressed, &ids, cancel).await;
        self.total_evaluations += shard.count as u64;

        let original_score = original.shard_result.objective(&self.config.compression_objective);
        let compressed_score = shard.objective(&self.config.compression_objective);
        let accepted = self.compressor.accept(original_score, compressed_score);

        self.emit(EventKind::CompressionApplied {
            original: original.candidate.fingerprint(),
            compressed: compressed.fingerprint(),
            accepted,
        });

        if accepted {
            self.seen_fingerprints.insert(compressed.fingerprint());
            let outcome = self.archive.insert(compressed.clone(), shard);
            self.emit(EventKind::ArchiveUpdate {
                fingerprint: compressed.fingerprint(),
                pareto_accepted: outcome.pareto_accepted,
                qd_accepted: outcome.qd_accepted,
            });
        }
    }

    fn sampler_shard_len(&self) -> usize {
        50
    }

    fn emit_migrants(&mut self) {
        let mut elites = self.archive.pareto_candidates();
        elites.sort_by(|a, b| {
            b.shard_result
                .objective(&self.config.promote_objective)
                .partial_cmp(&a.shard_result.objective(&self.config.promote_objective))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top: Vec<_> = elites.into_iter().take(self.config.migration_k).collect();
        if top.is_empty() {
            return;
        }
        let fingerprints: Vec<Fingerprint> = top.iter().map(|entry| entry.candidate.fingerprint()).collect();
        let migrants: Vec<Migrant> = top
            .iter()
            .map(|entry| {
                let mut migrant = Migrant::from_candidate(&entry.candidate, entry.shard_result.means.clone());
                // An elite that itself arrived by migration carries forward
                // the hop count it arrived with, incremented by this hop;
                // one bred locally starts a fresh chain at 0.
                if let Some(prior) = self.migrant_hop_counts.get(&entry.candidate.fingerprint()) {
                    migrant.hop_count = prior + 1;
                }
                migrant
            })
            .collect();
        let to = self.island_id.next_in_ring(self.config.n_islands);
        if self.migration.send(to, &migrants).is_ok() {
            self.emit(EventKind::MigrateOut {
                fingerprints,
                to_island: to,
            });
        }
    }

    fn emit_summary(&mut self) {
        let mut per_objective: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for entry in self.archive.pareto_candidates() {
            for (key, value) in &entry.shard_result.means {
                per_objective.entry(key.clone()).or_default().push(*value);
            }
        }
        let objective_stats = per_objective
            .into_iter()
            .map(|(key, samples)| (key, types::ObjectiveStats::from_samples(&samples)))
            .collect();

        self.emit(EventKind::Summary {
            pending_queue_depth: 0,
            pareto_size: self.archive.pareto_len(),
            qd_populated_bins: self.archive.qd_populated_bins(),
            total_evaluations: self.total_evaluations,
            cache_hit_rate: self.cache.warm_rate(),
            objective_stats,
        });
    }
}

fn seed_for(island: IslandId, round: u64, index: u64) -> u64 {
    (u64::from(island.0) << 40) ^ (round << 12) ^ index
}
