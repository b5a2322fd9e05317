use std::fmt;

/// A dataset example identifier. Opaque to the core per §6; the dataset
/// iterator is the only component that ever interprets its contents.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ExampleId(pub String);

impl fmt::Display for ExampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ExampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

impl From<String> for ExampleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExampleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one island in the ring topology (§4.9). Islands are numbered
/// `0..n_islands`; the ring maps island `i` to island `(i + 1) % n_islands`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IslandId(pub u32);

impl IslandId {
    pub fn next_in_ring(&self, n_islands: u32) -> IslandId {
        IslandId((self.0 + 1) % n_islands.max(1))
    }
}

impl fmt::Display for IslandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "island-{}", self.0)
    }
}

impl fmt::Debug for IslandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}
