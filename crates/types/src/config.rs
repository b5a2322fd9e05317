/// The recognized configuration surface (§6), shared by every component.
/// Defaults here match the spec's defaults table exactly; `orchestrator`'s
/// CLI layer is the only place that overrides them from the environment or
/// command line.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub eval_concurrency: usize,
    pub n_islands: u32,
    pub shards: Vec<f64>,
    pub eps_improve: f64,
    pub cohort_quantile: f64,
    pub qd_bins_length: u8,
    pub qd_bins_bullets: u8,
    pub amortized_rate: f64,
    pub reflection_batch_size: usize,
    pub max_mutations_per_round: usize,
    pub merge_period: u64,
    pub merge_uplift_min: f64,
    pub max_tokens: u32,
    pub prune_delta: f64,
    pub compression_shard_fraction: f64,
    pub migration_period: u64,
    pub migration_k: usize,
    pub cache_path: std::path::PathBuf,
    pub log_path: std::path::PathBuf,
    pub log_summary_interval: u64,
    pub batch_size: usize,
    pub queue_limit: usize,
    pub promote_objective: String,
    pub compression_objective: String,
    pub failure_threshold: f64,
    pub max_retries: u32,
    pub max_rounds: u64,
    pub max_evaluations: u64,
    pub sampler_coreset_fraction: f64,
    pub sampler_random_fraction: f64,
    pub sampler_hardness_fraction: f64,
    pub hardness_set_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eval_concurrency: 64,
            n_islands: 4,
            shards: vec![0.05, 0.2, 1.0],
            eps_improve: 0.01,
            cohort_quantile: 0.6,
            qd_bins_length: 8,
            qd_bins_bullets: 6,
            amortized_rate: 0.8,
            reflection_batch_size: 6,
            max_mutations_per_round: 16,
            merge_period: 3,
            merge_uplift_min: 0.01,
            max_tokens: 2048,
            prune_delta: 0.005,
            compression_shard_fraction: 0.2,
            migration_period: 2,
            migration_k: 3,
            cache_path: std::path::PathBuf::from("./cache"),
            log_path: std::path::PathBuf::from("./events.jsonl"),
            log_summary_interval: 10,
            batch_size: 8,
            queue_limit: 128,
            promote_objective: "quality".to_string(),
            compression_objective: "quality".to_string(),
            failure_threshold: 0.05,
            max_retries: 3,
            max_rounds: 100,
            max_evaluations: 100_000,
            sampler_coreset_fraction: 0.4,
            sampler_random_fraction: 0.4,
            sampler_hardness_fraction: 0.2,
            hardness_set_cap: 256,
        }
    }
}
