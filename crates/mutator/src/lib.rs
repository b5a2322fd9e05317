//! Produces offspring from parents drawn by the Orchestrator (§4.7).
//!
//! Operator mix: rule-based edits (probability `amortized_rate`, a fixed
//! library of deterministic text transformations) or reflection (probability
//! `1 - amortized_rate`, batching failure traces through the external
//! [`ReflectionOracle`]). Merge is invoked directly by the Orchestrator, not
//! scheduled here, per its own period.

use std::sync::Arc;

use evaluator::ReflectionOracle;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use types::{Candidate, Origin, Trace};

/// The fixed rule-edit library (§4.7). One variant per transformation;
/// dispatch is deterministic given the seed that selects it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleEdit {
    Trim,
    Bulletize,
    Reorder,
    HeaderInsertion,
}

impl RuleEdit {
    const ALL: [RuleEdit; 4] = [RuleEdit::Trim, RuleEdit::Bulletize, RuleEdit::Reorder, RuleEdit::HeaderInsertion];

    /// Deterministic given `seed`, but dispersed through `splitmix64` first:
    /// callers often pass low-entropy seeds (e.g. a round counter shifted
    /// into a fixed bit position), and a raw `seed % ALL.len()` would index
    /// the same edit for every one of them.
    pub fn pick(seed: u64) -> RuleEdit {
        Self::ALL[(splitmix64(seed) as usize) % Self::ALL.len()]
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            RuleEdit::Trim => trim(text),
            RuleEdit::Bulletize => bulletize(text),
            RuleEdit::Reorder => reorder(text),
            RuleEdit::HeaderInsertion => header_insertion(text),
        }
    }
}

fn trim(text: &str) -> String {
    let mut out = String::new();
    let mut last_was_blank = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if last_was_blank {
                continue;
            }
            last_was_blank = true;
        } else {
            last_was_blank = false;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn bulletize(text: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('-') {
                trimmed.to_string()
            } else {
                format!("- {trimmed}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn reorder(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    lines.reverse();
    lines.join("\n")
}

fn header_insertion(text: &str) -> String {
    if text.lines().any(|line| line.trim_start().starts_with('#')) {
        text.to_string()
    } else {
        format!("## Let's think step by step\n{text}")
    }
}

fn estimate_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Bit-mixing function (Sebastiano Vigna's `splitmix64`), used to spread a
/// caller-supplied seed before it's reduced mod a small divisor.
fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

pub struct Mutator {
    reflection_oracle: Arc<dyn ReflectionOracle>,
    amortized_rate: f64,
    reflection_batch_size: usize,
}

impl Mutator {
    pub fn new(reflection_oracle: Arc<dyn ReflectionOracle>, amortized_rate: f64, reflection_batch_size: usize) -> Self {
        Self {
            reflection_oracle,
            amortized_rate,
            reflection_batch_size,
        }
    }

    /// Proposes offspring for one parent, choosing rule-edit or reflection
    /// by `seed` (so the choice, and the rule-edit branch, are both
    /// reproducible for a given (island, round, parent) triple).
    pub async fn propose(&self, parent: &Candidate, failure_traces: &[Trace], seed: u64) -> Vec<Candidate> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let roll: f64 = rng.gen();

        if roll < self.amortized_rate {
            let edit = RuleEdit::pick(seed);
            let text = edit.apply(&parent.text);
            if text == parent.text {
                return Vec::new();
            }
            let token_estimate = estimate_tokens(&text);
            vec![Candidate::new(text, vec![parent.fingerprint()], Origin::RuleEdit, token_estimate)]
        } else {
            let batch: Vec<Trace> = failure_traces.iter().take(self.reflection_batch_size).cloned().collect();
            let proposals = self.reflection_oracle.reflect(&parent.text, &batch).await;
            proposals
                .into_iter()
                .filter(|text| text != &parent.text)
                .map(|text| {
                    let token_estimate = estimate_tokens(&text);
                    Candidate::new(text, vec![parent.fingerprint()], Origin::Reflection, token_estimate)
                })
                .collect()
        }
    }

    /// Merges two Pareto elites into one candidate text (§4.7). Accept/reject
    /// against `merge_uplift_min` is the Orchestrator's decision, made after
    /// the merged candidate races a shard; this only constructs the text.
    pub fn merge(&self, a: &Candidate, b: &Candidate) -> Candidate {
        let mut lines: Vec<&str> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for line in a.text.lines().chain(b.text.lines()) {
            if seen.insert(line) {
                lines.push(line);
            }
        }
        let text = lines.join("\n");
        let token_estimate = estimate_tokens(&text);
        Candidate::new(text, vec![a.fingerprint(), b.fingerprint()], Origin::Merge, token_estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoReflectionOracle;

    #[async_trait]
    impl ReflectionOracle for EchoReflectionOracle {
        async fn reflect(&self, parent_text: &str, _traces: &[Trace]) -> Vec<String> {
            vec![format!("{parent_text}\nreflected")]
        }
    }

    struct EmptyReflectionOracle;

    #[async_trait]
    impl ReflectionOracle for EmptyReflectionOracle {
        async fn reflect(&self, _parent_text: &str, _traces: &[Trace]) -> Vec<String> {
            Vec::new()
        }
    }

    fn parent() -> Candidate {
        Candidate::new("answer the question\ndirectly".to_string(), vec![], Origin::Seed, 4)
    }

    #[tokio::test]
    async fn amortized_rate_one_always_takes_the_rule_edit_branch() {
        let mutator = Mutator::new(Arc::new(EmptyReflectionOracle), 1.0, 6);
        let offspring = mutator.propose(&parent(), &[], 7).await;
        assert_eq!(offspring.len(), 1);
        assert_eq!(offspring[0].origin, Origin::RuleEdit);
    }

    #[tokio::test]
    async fn amortized_rate_zero_always_takes_the_reflection_branch() {
        let mutator = Mutator::new(Arc::new(EchoReflectionOracle), 0.0, 6);
        let offspring = mutator.propose(&parent(), &[], 7).await;
        assert_eq!(offspring.len(), 1);
        assert_eq!(offspring[0].origin, Origin::Reflection);
    }

    #[test]
    fn rule_edit_is_deterministic_for_a_given_seed() {
        let text = parent().text;
        let a = RuleEdit::pick(3).apply(&text);
        let b = RuleEdit::pick(3).apply(&text);
        assert_eq!(a, b);
    }

    #[test]
    fn merge_deduplicates_shared_lines() {
        let mutator = Mutator::new(Arc::new(EmptyReflectionOracle), 1.0, 6);
        let a = Candidate::new("shared\nonly in a".to_string(), vec![], Origin::Seed, 3);
        let b = Candidate::new("shared\nonly in b".to_string(), vec![], Origin::Seed, 3);
        let merged = mutator.merge(&a, &b);
        assert_eq!(merged.text.matches("shared").count(), 1);
        assert!(merged.text.contains("only in a"));
        assert!(merged.text.contains("only in b"));
        assert_eq!(merged.origin, Origin::Merge);
    }
}
