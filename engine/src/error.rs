//! Engine error types
//!
//! The core is sum-typed: every fallible public operation returns one of the
//! variants below. Transient RCU contention is retried internally and never
//! surfaces here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Vector length does not match the engine dimension fixed at construction.
    #[error("vector has dimension {got}, engine expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Vector id falls outside the node storage allocated at construction.
    #[error("id {id} exceeds index capacity {max_elements}")]
    CapacityExceeded { id: u32, max_elements: usize },

    /// Rejected construction-time configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
