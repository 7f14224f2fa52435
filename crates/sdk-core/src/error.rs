//! Error types with a caller-facing contract
//!
//! Transport and fetch paths use `anyhow`; these enums cover the places where
//! callers match on the failure.

use thiserror::Error;

/// Failure recovering the trailing segment from a namespaced key
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid latency key provided: `{0}`")]
    InvalidKey(String),
}

/// Failures of the pluggable storage contract
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Expecting custom storage `wrapper` in options, but no valid wrapper instance was provided.")]
    MissingWrapper,

    #[error(
        "The provided wrapper instance doesn't follow the expected interface. \
         The following methods are missing or invalid: {}",
        .0.join(",")
    )]
    MissingMethods(Vec<&'static str>),

    #[error("Wrapper operation `{operation}` failed: {message}")]
    Wrapper {
        operation: &'static str,
        message: String,
    },
}
