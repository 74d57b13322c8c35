//! Consultation structuring: inference backends and the orchestrator that
//! chooses between them.

pub mod cloud;
pub mod local;
pub mod merge;
pub mod mock;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod types;

pub use cloud::*;
pub use local::*;
pub use merge::*;
pub use mock::*;
pub use orchestrator::*;
pub use parser::*;
pub use prompt::*;
pub use types::*;

use thiserror::Error;

use crate::pipeline::schema::ValidationError;
use crate::pipeline::semaphore::SemaphoreError;

#[derive(Error, Debug)]
pub enum StructuringError {
    #[error("Inference backend is not reachable at {0}")]
    Connection(String),

    #[error("Inference backend returned error (status {status}): {body}")]
    Backend { status: u16, body: String },

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lock(#[from] SemaphoreError),

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("{0} backend is not configured")]
    NotConfigured(String),
}

impl StructuringError {
    /// Schema mismatches cannot be fixed by asking again.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StructuringError::Validation(_) | StructuringError::NotConfigured(_)
        )
    }
}

/// Map a reqwest failure the same way for every backend.
pub(crate) fn map_transport_error(
    e: reqwest::Error,
    base_url: &str,
    timeout_secs: u64,
) -> StructuringError {
    if e.is_timeout() {
        StructuringError::Timeout(timeout_secs)
    } else if e.is_connect() {
        StructuringError::Connection(base_url.to_string())
    } else {
        StructuringError::HttpClient(e.to_string())
    }
}
