// src/error.rs
// =============================================================================
// Errors that end a whole harvest run.
//
// Per-fetch problems (blocked, absent, flaky network) are handled inside the
// fetch workers and never show up here. What does show up here is anything
// that means the output can no longer be trusted, so the run stops.
// =============================================================================

use std::io;

use thiserror::Error;

use crate::services::ServiceError;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// A fetch failed in a way we do not know how to handle
    #[error("code {code:?} triggered an unexpected error: {source}")]
    Unclassified {
        code: String,
        #[source]
        source: ServiceError,
    },

    /// A long URL would break the line-based output format
    #[error("newline in url for code {code:?}")]
    NewlineInUrl { code: String },

    /// The monitor saw too many blocked requests
    #[error("{window_secs}s average block rate is too high ({:.1}%)", .block_rate * 100.0)]
    CircuitOpen { block_rate: f64, window_secs: u64 },

    /// The writer lost its input before every worker said goodbye
    #[error("writer received {received} of {expected} stop markers before its input closed")]
    Truncated { received: usize, expected: usize },

    /// A worker produced a record after the writer was gone
    #[error("writer is no longer accepting records")]
    SinkClosed,

    #[error("invalid code range {start:?}..{stop:?}: {reason}")]
    InvalidRange {
        start: String,
        stop: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("output error: {0}")]
    Io(#[from] io::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
