//! For each selected archived elite, proposes a token-compressed variant by
//! rule-based shortening (§4.8). Validation against `prune_delta` on a
//! shard happens outside this crate (the Orchestrator races the variant
//! through the Evaluator); this crate owns only the text transform and the
//! accept/reject arithmetic.

use types::{Candidate, Origin};

const FILLER_PHRASES: &[&str] = &[
    "please ",
    "basically ",
    "just ",
    "really ",
    "very ",
    "simply ",
    "in order to ",
    "kindly ",
];

/// Shortens `text` by dropping filler phrases and collapsing whitespace,
/// then hard-truncating to `max_tokens` whitespace-delimited words if still
/// over budget.
pub fn compress(text: &str, max_tokens: u32) -> String {
    let mut shortened = text.to_string();
    for phrase in FILLER_PHRASES {
        shortened = replace_case_insensitive(&shortened, phrase, "");
    }
    let shortened = shortened
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    let words: Vec<&str> = shortened.split_whitespace().collect();
    if words.len() as u32 <= max_tokens {
        return shortened;
    }
    words[..max_tokens as usize].join(" ")
}

fn replace_case_insensitive(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_haystack = haystack.to_lowercase();
    let lower_needle = needle.to_lowercase();
    if !lower_haystack.contains(&lower_needle) {
        return haystack.to_string();
    }
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    let mut rest_lower = lower_haystack.as_str();
    while let Some(pos) = rest_lower.find(&lower_needle) {
        out.push_str(&rest[..pos]);
        out.push_str(replacement);
        rest = &rest[pos + needle.len()..];
        rest_lower = &rest_lower[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}

pub struct TokenController {
    max_tokens: u32,
    prune_delta: f64,
}

impl TokenController {
    pub fn new(max_tokens: u32, prune_delta: f64) -> Self {
        Self { max_tokens, prune_delta }
    }

    /// Builds the compressed candidate text. Parentage is the single
    /// original elite; this does not itself validate the variant.
    pub fn propose(&self, original: &Candidate) -> Option<Candidate> {
        let compressed_text = compress(&original.text, self.max_tokens);
        if compressed_text == original.text {
            return None;
        }
        let token_estimate = compressed_text.split_whitespace().count() as u32;
        Some(Candidate::new(
            compressed_text,
            vec![original.fingerprint()],
            Origin::Compression,
            token_estimate,
        ))
    }

    /// Whether the compressed variant's shard score stays within
    /// `prune_delta` of the original's on the same shard (§4.8).
    pub fn accept(&self, original_score: f64, compressed_score: f64) -> bool {
        (original_score - compressed_score) <= self.prune_delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filler_phrases_are_dropped() {
        let out = compress("Please just answer really carefully.", 100);
        assert!(!out.to_lowercase().contains("please"));
        assert!(!out.to_lowercase().contains("just"));
        assert!(!out.to_lowercase().contains("really"));
    }

    #[test]
    fn truncates_to_max_tokens() {
        let text = (0..20).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let out = compress(&text, 5);
        assert_eq!(out.split_whitespace().count(), 5);
    }

    #[test]
    fn accept_allows_small_regressions_within_prune_delta() {
        let controller = TokenController::new(2048, 0.01);
        assert!(controller.accept(0.80, 0.795));
        assert!(!controller.accept(0.80, 0.78));
    }

    #[test]
    fn propose_returns_none_when_nothing_changed() {
        let controller = TokenController::new(2048, 0.01);
        let original = Candidate::new("tight text".to_string(), vec![], Origin::Seed, 2);
        assert!(controller.propose(&original).is_none());
    }
}
