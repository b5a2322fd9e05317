//! Scenario 1 (§8): a deterministic toy oracle, ten examples, rule edits
//! only, three rounds. The Archive must end up with a quality-1.0
//! rule-edit candidate.

use std::sync::Arc;
use std::time::Duration;

use archive::Archive;
use cache::Cache;
use compressor::TokenController;
use evaluator::{Evaluator, RetryPolicy};
use migration::MigrationQueue;
use mutator::Mutator;
use orchestrator::toy_oracle::{toy_dataset, ToyReflectionOracle, ToyTaskOracle};
use orchestrator::{EventLog, Island};
use sampler::Sampler;
use types::{Config, IslandId, Origin};

#[tokio::test]
async fn rule_edits_alone_find_a_perfect_quality_candidate() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config {
        n_islands: 1,
        amortized_rate: 1.0, // rule edits only, per scenario 1
        max_rounds: 3,
        max_evaluations: 10_000,
        merge_period: 100, // do not merge within 3 rounds
        migration_period: 100,
        log_summary_interval: 100,
        cache_path: dir.path().join("cache"),
        log_path: dir.path().join("events"),
        ..Config::default()
    };
    config.shards = vec![1.0];

    let island_id = IslandId(0);
    let cache = Cache::open(config.cache_path.join("island-0")).unwrap();
    let evaluator = Arc::new(Evaluator::new(
        cache.clone(),
        Arc::new(ToyTaskOracle),
        config.eval_concurrency,
        RetryPolicy::default(),
        1,
        Duration::from_secs(5),
    ));
    let sampler = Sampler::new(toy_dataset(10), &config);
    let archive = Arc::new(Archive::new(config.qd_bins_length, config.qd_bins_bullets, config.promote_objective.clone()));
    let mutator = Mutator::new(Arc::new(ToyReflectionOracle), config.amortized_rate, config.reflection_batch_size);
    let compressor = TokenController::new(config.max_tokens, config.prune_delta);
    let migration = MigrationQueue::open(dir.path().join("migration"), config.queue_limit).unwrap();
    let event_log = EventLog::open(&config.log_path.join("island-0.jsonl")).unwrap();

    let mut island = Island::new(
        config, island_id, cache, evaluator, sampler, archive.clone(), mutator, compressor, migration, event_log,
    );

    island.seed(&["Answer the question.".to_string()]).await;
    while !island.should_terminate() {
        island.run_round().await;
    }

    let elites = archive.pareto_candidates();
    assert!(
        elites
            .iter()
            .any(|entry| entry.shard_result.objective(types::OBJECTIVE_QUALITY) >= 1.0 && entry.candidate.origin == Origin::RuleEdit),
        "expected a quality-1.0 rule-edit candidate in the archive, got: {:?}",
        elites
            .iter()
            .map(|e| (e.candidate.origin, e.shard_result.objective(types::OBJECTIVE_QUALITY)))
            .collect::<Vec<_>>()
    );
}
