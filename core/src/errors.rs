//! Unified error types for the ryuk core crate.
//!
//! Runtime-call errors keep a dedicated not-found variant so callers can
//! treat already-gone resources as success instead of retrying them.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`RuntimeClient`](crate::runtime::RuntimeClient)
/// implementations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The resource does not exist (any more). Deletion callers treat this
    /// as success.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime did not answer within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure reported by the runtime API.
    #[error("runtime error: {0}")]
    Api(String),
}

/// Errors from parsing client filter lines.
#[derive(Error, Debug)]
pub enum FilterError {
    /// The line was empty after trimming.
    #[error("empty filter line")]
    Empty,

    /// The line does not look like a `key=value` query string.
    #[error("malformed filter line: {0:?}")]
    Malformed(String),
}
