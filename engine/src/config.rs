//! Construction-time configuration
//!
//! All parameters are fixed for the engine lifetime. Defaults match the
//! reference workload (SIFT-style 128-dim vectors, one million elements).

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Maximum number of graph layers. A node's level is clamped below this.
pub const MAX_LEVELS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Vector dimension; every request must match it.
    pub dim: usize,

    /// Upper bound on vector ids. Node storage is allocated once at this size.
    pub max_elements: usize,

    /// Target out-degree per layer above 0. Layer 0 uses `2 * m`.
    pub m: usize,

    /// Candidate pool size while building graph edges.
    pub ef_construction: usize,

    /// Slots per flat write buffer.
    pub buffer_capacity: usize,

    /// Number of background compaction workers.
    pub bg_threads: usize,

    /// Sealed-buffer queue length at which foreground inserts are throttled.
    pub soft_limit: usize,

    /// Sealed-buffer queue length at which foreground inserts block.
    pub hard_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dim: 128,
            max_elements: 1_000_000,
            m: 16,
            ef_construction: 200,
            buffer_capacity: 50_000,
            bg_threads: 2,
            soft_limit: 3,
            hard_limit: 6,
        }
    }
}

impl EngineConfig {
    /// Out-degree bound for layer 0.
    pub fn m0(&self) -> usize {
        self.m * 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(EngineError::InvalidConfig("dim must be > 0".into()));
        }
        if self.max_elements == 0 {
            return Err(EngineError::InvalidConfig(
                "max_elements must be > 0".into(),
            ));
        }
        if self.m < 2 {
            return Err(EngineError::InvalidConfig("m must be >= 2".into()));
        }
        if self.ef_construction == 0 {
            return Err(EngineError::InvalidConfig(
                "ef_construction must be > 0".into(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "buffer_capacity must be > 0".into(),
            ));
        }
        if self.bg_threads == 0 {
            return Err(EngineError::InvalidConfig(
                "bg_threads must be > 0".into(),
            ));
        }
        if self.hard_limit == 0 || self.soft_limit > self.hard_limit {
            return Err(EngineError::InvalidConfig(format!(
                "backpressure limits must satisfy 0 < soft_limit <= hard_limit, got {}/{}",
                self.soft_limit, self.hard_limit
            )));
        }
        Ok(())
    }
}
