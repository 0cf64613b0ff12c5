// src/jobs/mod.rs
//! Off-path workers: consume the stored knowledge graph and produce typed
//! edges and session summaries. Run on their own worker pool, never on the
//! request path.

pub mod relationship_discovery;
pub mod session_summarize;

pub use relationship_discovery::{
    ContradictionClassifier, LlmContradictionClassifier, RelationshipDiscoveryConfig, RelationshipDiscoveryJob,
};
pub use session_summarize::{SessionSummarizationConfig, SessionSummarizationJob, SummarizationOutcome};
