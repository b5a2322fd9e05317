//! Content-addressed identifiers used across the optimizer: a [`Fingerprint`]
//! names a candidate by its normalized text, and an [`EvalKey`] names one
//! (candidate, example, shard) evaluation slot. Both are the sole identity
//! used by the cache, archive, and migration components — nothing else in
//! this workspace compares candidates by equality of their `text` field.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;

/// A 128-bit content hash of a candidate's normalized text.
///
/// 128 bits is the minimum width §4.1 asks for; SHA-256 truncated to the
/// first 16 bytes gives collision resistance well beyond what a single
/// optimization run will ever stress.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn of_text(text: &str) -> Self {
        let normalized = normalize(text);
        let digest = Sha256::digest(normalized.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
        let decoded = hex::decode(hex)?;
        let exact: [u8; 16] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(exact))
    }
}

/// Normalize candidate text so that two strings that are semantically
/// identical reduce to the same fingerprint: Unicode NFC, `\r\n` and `\r`
/// folded to `\n`, and trailing whitespace trimmed per line.
pub fn normalize(text: &str) -> String {
    let folded = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed: String = folded
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    trimmed.nfc().collect()
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Fingerprint {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let raw = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Self::from_hex(raw.as_ref()).map_err(|err| D::Error::custom(format!("invalid fingerprint: {err}")))
    }
}

/// Identifies one (candidate, example, shard_version) evaluation slot in the
/// [`Cache`](../cache/index.html). Distinct from [`Fingerprint`] because the
/// eval key is only ever used for within-run dedup, never cross-run candidate
/// identity — xxh3 is fast and sufficient here.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvalKey([u8; 16]);

impl EvalKey {
    pub fn new(candidate: Fingerprint, example_id: &str, shard_version: u32) -> Self {
        let mut input = Vec::with_capacity(16 + example_id.len() + 4);
        input.extend_from_slice(candidate.as_bytes());
        input.extend_from_slice(example_id.as_bytes());
        input.extend_from_slice(&shard_version.to_le_bytes());
        let hashed = xxhash_rust::xxh3::xxh3_128(&input);
        Self(hashed.to_le_bytes())
    }
}

impl fmt::Display for EvalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EvalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identical_text_produces_identical_fingerprint() {
        let a = Fingerprint::of_text("answer step by step\n");
        let b = Fingerprint::of_text("answer step by step\n");
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_whitespace_and_crlf_are_normalized_away() {
        let a = Fingerprint::of_text("line one \r\nline two  \r\n");
        let b = Fingerprint::of_text("line one\nline two\n");
        assert_eq!(a, b);
    }

    #[test]
    fn different_text_produces_different_fingerprint() {
        let a = Fingerprint::of_text("answer directly");
        let b = Fingerprint::of_text("answer step by step");
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip_is_stable() {
        let original = Fingerprint::of_text("round trip me");
        let hex_form = original.to_string();
        let parsed: Fingerprint = hex_form.parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn serde_round_trips_through_json() {
        let original = Fingerprint::of_text("serde me");
        let json = serde_json::to_string(&original).unwrap();
        let parsed: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn eval_key_distinguishes_example_and_shard() {
        let candidate = Fingerprint::of_text("prompt text");
        let key_a = EvalKey::new(candidate, "ex-1", 0);
        let key_b = EvalKey::new(candidate, "ex-2", 0);
        let key_c = EvalKey::new(candidate, "ex-1", 1);
        assert_ne!(key_a, key_b);
        assert_ne!(key_a, key_c);
    }
}
