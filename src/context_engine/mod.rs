//! Context assembly: token-budgeted, tenant-scoped retrieval with MMR
//! diversity packing.
//!
//! A tiered-cache context model (separate planning/tiering/orchestration
//! modules) has no counterpart in this gateway's single-pass retrieval
//! model; see DESIGN.md for what replaced it.

pub mod context_builder;
pub mod mmr;
pub mod token_budget;

pub use context_builder::{BuiltContext, ContextBuilder, ContextBuilderConfig, ContextItem};