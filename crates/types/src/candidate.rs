use crate::Fingerprint;

/// How a [`Candidate`] came to exist (§3). Carried through to the event
/// stream so a reviewer can tell a rule-edit from a migrant at a glance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Seed,
    RuleEdit,
    Reflection,
    Merge,
    Compression,
    Migrant,
}

/// An immutable unit of optimization (§3). A mutated candidate is always a
/// new `Candidate`, never an in-place edit — `fingerprint` is derived once,
/// at construction, from the normalized `text`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Candidate {
    fingerprint: Fingerprint,
    pub text: String,
    pub parents: Vec<Fingerprint>,
    pub origin: Origin,
    pub token_estimate: u32,
}

impl Candidate {
    pub fn new(text: String, parents: Vec<Fingerprint>, origin: Origin, token_estimate: u32) -> Self {
        let fingerprint = Fingerprint::of_text(&text);
        Self {
            fingerprint,
            text,
            parents,
            origin,
            token_estimate,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}
