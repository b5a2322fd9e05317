//! Shared data model (§3 of the spec) and configuration surface (§6) used by
//! every other crate in the workspace. Nothing in here does I/O or holds a
//! lock; it is the vocabulary the other crates share.

mod candidate;
mod config;
mod event;
mod ids;
mod result;

pub use candidate::{Candidate, Origin};
pub use config::Config;
pub use event::{EventKind, EventRecord, ObjectiveStats};
pub use fingerprint::{EvalKey, Fingerprint};
pub use ids::{ExampleId, IslandId};
pub use result::{
    ArchiveEntry, EvaluationResult, QdBinKey, Rung, ShardResult, Trace, MAX_SHARD_FAILURE_TRACES, MAX_TRACE_BYTES,
    OBJECTIVE_NEG_COST, OBJECTIVE_QUALITY, OBJECTIVE_TOKENS,
};
