use crate::{Fingerprint, IslandId};

/// One line of the append-only JSON-Lines event stream (§6). `ts`, `island`,
/// and `round` are common to every record; `kind` carries the
/// kind-specific fields as an internally-tagged enum so the log stays one
/// JSON object per line.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub ts: String,
    pub island: IslandId,
    pub round: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    EvalStart {
        fingerprint: Fingerprint,
        example_count: usize,
    },
    EvalDone {
        fingerprint: Fingerprint,
        rung: usize,
        mean_quality: f64,
        structural_failures: usize,
    },
    Promote {
        fingerprint: Fingerprint,
        from_rung: usize,
        to_rung: usize,
    },
    ArchiveUpdate {
        fingerprint: Fingerprint,
        pareto_accepted: bool,
        qd_accepted: bool,
    },
    MutationProposed {
        fingerprint: Fingerprint,
        parent: Option<Fingerprint>,
        origin: crate::Origin,
    },
    MutationAccepted {
        fingerprint: Fingerprint,
    },
    MergeProposed {
        parent_a: Fingerprint,
        parent_b: Fingerprint,
    },
    MergeAccepted {
        fingerprint: Fingerprint,
        uplift: f64,
    },
    MergeRejected {
        parent_a: Fingerprint,
        parent_b: Fingerprint,
        reason: String,
    },
    CompressionApplied {
        original: Fingerprint,
        compressed: Fingerprint,
        accepted: bool,
    },
    MigrateOut {
        fingerprints: Vec<Fingerprint>,
        to_island: IslandId,
    },
    MigrateIn {
        fingerprints: Vec<Fingerprint>,
        from_island: IslandId,
        admitted: usize,
    },
    Summary {
        pending_queue_depth: usize,
        pareto_size: usize,
        qd_populated_bins: usize,
        total_evaluations: u64,
        cache_hit_rate: f64,
        objective_stats: std::collections::BTreeMap<String, ObjectiveStats>,
    },
}

/// min/max/mean/median summary for one objective, carried by the `summary`
/// event record (§6).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ObjectiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl ObjectiveStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                median: 0.0,
            };
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Self { min, max, mean, median }
    }
}
