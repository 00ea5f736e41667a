//! Client-side replication engine.
//!
//! - `engine`: precondition chain + the single-run sync algorithm
//! - `conflict`: detection and resolution strategies
//! - `metadata`: the on-disk cursor and cumulative counters
//! - `ticker`: the periodic background task

pub mod conflict;
pub mod engine;
pub mod metadata;
pub mod ticker;

pub use engine::SyncEngine;

/// Aggregated outcome of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub uploaded: u32,
    pub downloaded: u32,
    pub conflicts_found: u32,
    pub conflicts_resolved: u32,
    /// Per-record failures. The run keeps going past them.
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncResult {
    /// A run succeeded iff nothing was left in `errors`.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}
