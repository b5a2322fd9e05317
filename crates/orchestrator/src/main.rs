//! CLI entry point for evoforge. Grounded on `agent::main::Args`/`main`:
//! explicit multi-thread runtime, `tracing_subscriber::FmtSubscriber`, and a
//! `clap::Parser` args struct with one flag per configuration field.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use evaluator::{Evaluator, RetryPolicy};
use orchestrator::toy_oracle::{toy_dataset, ToyReflectionOracle, ToyTaskOracle};
use orchestrator::{EventLog, Island};
use types::{Config, IslandId};

/// Runs the optimizer described in the configuration table. Ships only the
/// deterministic toy oracle; a real task/reflection oracle is out of scope
/// for this binary (see the crate's non-goals).
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "EVOFORGE_EVAL_CONCURRENCY", default_value = "64")]
    eval_concurrency: usize,
    #[clap(long, env = "EVOFORGE_N_ISLANDS", default_value = "4")]
    n_islands: u32,
    #[clap(long, env = "EVOFORGE_MAX_ROUNDS", default_value = "100")]
    max_rounds: u64,
    #[clap(long, env = "EVOFORGE_MAX_EVALUATIONS", default_value = "100000")]
    max_evaluations: u64,
    #[clap(long, env = "EVOFORGE_AMORTIZED_RATE", default_value = "0.8")]
    amortized_rate: f64,
    #[clap(long, env = "EVOFORGE_MERGE_PERIOD", default_value = "3")]
    merge_period: u64,
    #[clap(long, env = "EVOFORGE_MIGRATION_PERIOD", default_value = "2")]
    migration_period: u64,
    #[clap(long, env = "EVOFORGE_LOG_SUMMARY_INTERVAL", default_value = "10")]
    log_summary_interval: u64,
    #[clap(long, env = "EVOFORGE_CACHE_ROOT", default_value = "./cache")]
    cache_root: std::path::PathBuf,
    #[clap(long, env = "EVOFORGE_LOG_ROOT", default_value = "./events")]
    log_root: std::path::PathBuf,
    #[clap(long, env = "EVOFORGE_MIGRATION_ROOT", default_value = "./migration")]
    migration_root: std::path::PathBuf,
    #[clap(long, env = "EVOFORGE_DATASET_SIZE", default_value = "10")]
    dataset_size: usize,
    /// Initial candidate text. May be given multiple times; defaults to a
    /// single generic seed if omitted.
    #[clap(long = "seed")]
    seeds: Vec<String>,
}

impl Args {
    fn into_config(self) -> (Config, usize, Vec<String>) {
        let mut config = Config {
            eval_concurrency: self.eval_concurrency,
            n_islands: self.n_islands,
            max_rounds: self.max_rounds,
            max_evaluations: self.max_evaluations,
            amortized_rate: self.amortized_rate,
            merge_period: self.merge_period,
            migration_period: self.migration_period,
            log_summary_interval: self.log_summary_interval,
            cache_path: self.cache_root,
            log_path: self.log_root,
            ..Config::default()
        };
        config.queue_limit = config.queue_limit.max(config.batch_size);
        let seeds = if self.seeds.is_empty() {
            vec!["Answer the question.".to_string()]
        } else {
            self.seeds
        };
        (config, self.dataset_size, seeds)
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let migration_root = args.migration_root.clone();
    let (config, dataset_size, seed_texts) = args.into_config();

    let dataset = toy_dataset(dataset_size);
    let n_islands = config.n_islands;

    let mut handles = Vec::with_capacity(n_islands as usize);
    for i in 0..n_islands {
        let island_id = IslandId(i);
        let config = config.clone();
        let migration_root = migration_root.clone();
        let dataset = dataset.clone();
        let seed_texts = seed_texts.clone();

        handles.push(tokio::spawn(async move {
            run_island(island_id, config, migration_root, dataset, seed_texts).await
        }));
    }

    for handle in handles {
        handle.await.context("island task panicked")??;
    }
    Ok(())
}

async fn run_island(
    island_id: IslandId,
    config: Config,
    migration_root: std::path::PathBuf,
    dataset: Vec<types::ExampleId>,
    seed_texts: Vec<String>,
) -> anyhow::Result<()> {
    let cache = cache::Cache::open(config.cache_path.join(format!("island-{}", island_id.0)))
        .context("opening cache")?;
    let evaluator = Arc::new(Evaluator::new(
        cache.clone(),
        Arc::new(ToyTaskOracle),
        config.eval_concurrency,
        RetryPolicy::default(),
        1,
        Duration::from_secs(30),
    ));
    let sampler = sampler::Sampler::new(dataset, &config);
    let archive = Arc::new(archive::Archive::new(
        config.qd_bins_length,
        config.qd_bins_bullets,
        config.promote_objective.clone(),
    ));
    let mutator = mutator::Mutator::new(Arc::new(ToyReflectionOracle), config.amortized_rate, config.reflection_batch_size);
    let compressor = compressor::TokenController::new(config.max_tokens, config.prune_delta);
    let migration = migration::MigrationQueue::open(migration_root, config.queue_limit).context("opening migration queue")?;
    let log_path = config.log_path.join(format!("island-{}.jsonl", island_id.0));
    let event_log = EventLog::open(&log_path).context("opening event log")?;

    let mut island = Island::new(
        config, island_id, cache, evaluator, sampler, archive, mutator, compressor, migration, event_log,
    );

    island.seed(&seed_texts).await;
    while !island.should_terminate() {
        island.run_round().await;
    }
    Ok(())
}
