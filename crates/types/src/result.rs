use crate::{Candidate, ExampleId};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound on a [`Trace`]'s byte length, so that a pathological oracle
/// response cannot blow up cache files or the event log (§9 "Traces as
/// opaque blobs").
pub const MAX_TRACE_BYTES: usize = 8 * 1024;

/// An opaque payload carried from the task oracle to the reflection oracle.
/// The core never inspects its contents.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Trace(Vec<u8>);

impl Trace {
    pub fn new(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(MAX_TRACE_BYTES);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trace({} bytes)", self.0.len())
    }
}

/// Required objective keys every [`EvaluationResult`] and [`ShardResult`]
/// must carry (§3). Additional objective names are permitted but these three
/// are load-bearing for the Scheduler, Archive, and TokenController.
pub const OBJECTIVE_QUALITY: &str = "quality";
pub const OBJECTIVE_NEG_COST: &str = "neg_cost";
pub const OBJECTIVE_TOKENS: &str = "tokens";

/// One (candidate, example) scoring outcome from the external task oracle
/// (§3, §6). `failure` is derived, not asserted by the caller, from
/// `quality < failure_threshold`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EvaluationResult {
    pub objectives: BTreeMap<String, f64>,
    pub trace: Option<Trace>,
    pub failure: bool,
}

impl EvaluationResult {
    pub fn quality(&self) -> f64 {
        self.objectives.get(OBJECTIVE_QUALITY).copied().unwrap_or(0.0)
    }

    pub fn neg_cost(&self) -> f64 {
        self.objectives.get(OBJECTIVE_NEG_COST).copied().unwrap_or(0.0)
    }

    pub fn derive_failure(objectives: &BTreeMap<String, f64>, failure_threshold: f64) -> bool {
        objectives.get(OBJECTIVE_QUALITY).copied().unwrap_or(0.0) < failure_threshold
    }

    /// A synthetic structural failure, recorded when the oracle exhausts
    /// retries or raises a `PermanentOracle` error (§4.4, §7).
    pub fn structural_failure(reason: &str) -> Self {
        let mut objectives = BTreeMap::new();
        objectives.insert(OBJECTIVE_QUALITY.to_string(), 0.0);
        objectives.insert(OBJECTIVE_NEG_COST.to_string(), 0.0);
        objectives.insert(OBJECTIVE_TOKENS.to_string(), 0.0);
        Self {
            objectives,
            trace: Some(Trace::new(reason.as_bytes().to_vec())),
            failure: true,
        }
    }
}

/// Maximum number of failure traces retained per [`ShardResult`] (§3 "bounded").
pub const MAX_SHARD_FAILURE_TRACES: usize = 16;

/// Aggregate of [`EvaluationResult`]s for one candidate across one shard
/// (§3). Written once, never mutated, after the shard completes.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ShardResult {
    pub means: BTreeMap<String, f64>,
    pub count: usize,
    pub failure_traces: Vec<Trace>,
    pub structural_failures: usize,
    pub duration: Duration,
}

impl ShardResult {
    /// Aggregates a batch of per-example results with no positional
    /// dependence — the mean is exact, computed by summation (§4.4).
    pub fn aggregate(results: &[EvaluationResult], duration: Duration) -> Self {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut failure_traces = Vec::new();
        let mut structural_failures = 0usize;

        for result in results {
            for (key, value) in &result.objectives {
                *sums.entry(key.clone()).or_insert(0.0) += value;
            }
            if result.failure {
                structural_failures += 1;
                if let Some(trace) = &result.trace {
                    if failure_traces.len() < MAX_SHARD_FAILURE_TRACES {
                        failure_traces.push(trace.clone());
                    }
                }
            }
        }

        let count = results.len();
        let means = sums
            .into_iter()
            .map(|(key, sum)| (key, if count == 0 { 0.0 } else { sum / count as f64 }))
            .collect();

        Self {
            means,
            count,
            failure_traces,
            structural_failures,
            duration,
        }
    }

    pub fn has_structural_failure(&self) -> bool {
        self.structural_failures > 0
    }

    pub fn objective(&self, name: &str) -> f64 {
        self.means.get(name).copied().unwrap_or(0.0)
    }
}

/// One step of the successive-halving ladder (§3, §4.5).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Rung {
    pub index: usize,
    pub fraction: f64,
    pub example_ids: Vec<ExampleId>,
    pub promotion_quantile: f64,
    pub eps_improve: f64,
}

/// Discrete cell coordinates in the QD grid (§3, §4.6): a length bucket, a
/// bullet-line-count bucket, and the subset of boolean feature flags present
/// in the candidate's text, packed as a bitset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct QdBinKey {
    pub length_bucket: u8,
    pub bullet_bucket: u8,
    pub flags_bitset: u16,
}

/// A candidate plus its highest-rung [`ShardResult`] and QD coordinates
/// (§3). `dominated` is materialized for observability; the Pareto index is
/// the authoritative source of truth.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ArchiveEntry {
    pub candidate: Candidate,
    pub shard_result: ShardResult,
    pub qd_bin: QdBinKey,
    pub dominated: bool,
}
