//! A deterministic oracle with no real LLM call behind it, so scenario 1 of
//! §8 can be exercised end-to-end in tests without an external dependency.
//! Real task/reflection oracles are out of scope for this crate.

use async_trait::async_trait;
use evaluator::{OracleError, ReflectionOracle, TaskOracle};
use std::collections::BTreeMap;
use types::{Candidate, EvaluationResult, ExampleId, Trace};

/// Scores 1.0 if the candidate text contains "step by step", else 0.1 —
/// exactly the scoring rule the deterministic-toy-oracle scenario specifies.
pub struct ToyTaskOracle;

#[async_trait]
impl TaskOracle for ToyTaskOracle {
    async fn score(&self, candidate: &Candidate, _example_id: &ExampleId) -> Result<EvaluationResult, OracleError> {
        let quality = if candidate.text.to_lowercase().contains("step by step") {
            1.0
        } else {
            0.1
        };
        let mut objectives = BTreeMap::new();
        objectives.insert(types::OBJECTIVE_QUALITY.to_string(), quality);
        objectives.insert(types::OBJECTIVE_NEG_COST.to_string(), -(candidate.token_estimate as f64) * 0.001);
        objectives.insert(types::OBJECTIVE_TOKENS.to_string(), candidate.token_estimate as f64);
        let failure = EvaluationResult::derive_failure(&objectives, 0.05);
        Ok(EvaluationResult {
            objectives,
            trace: if failure {
                Some(Trace::new(b"quality below threshold".to_vec()))
            } else {
                None
            },
            failure,
        })
    }
}

/// Returns no proposals — scenario 1 drives the optimizer with rule edits
/// only (`amortized_rate = 1.0`), so the reflection branch is never taken,
/// but the Mutator still needs a concrete oracle to construct.
pub struct ToyReflectionOracle;

#[async_trait]
impl ReflectionOracle for ToyReflectionOracle {
    async fn reflect(&self, _parent_text: &str, _traces: &[Trace]) -> Vec<String> {
        Vec::new()
    }
}

/// Ten examples is the dataset size scenario 1 asks for; payloads are
/// opaque to the core, so their content here is arbitrary.
pub fn toy_dataset(n: usize) -> Vec<ExampleId> {
    (0..n).map(|i| ExampleId::from(format!("toy-{i}"))).collect()
}
