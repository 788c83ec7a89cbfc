//! VesperDB - streaming approximate-nearest-neighbor engine
//!
//! A hierarchical proximity graph under the squared-L2 metric, fronted by a
//! tiered write path: wait-free appends into a flat buffer, sealed buffers
//! queued with backpressure, and background workers that fold them into the
//! graph. Readers traverse the graph lock-free under epoch-based
//! reclamation, and searches merge buffer scans with graph results so every
//! acknowledged insert is immediately visible.

// ===== Core modules =====

// SIMD-accelerated squared-L2 kernel (runtime-dispatched, scalar fallback)
pub mod simd;

// Epoch-based reclamation for lock-free graph readers
pub mod ebr;

// Hierarchical proximity graph: search, streaming insert, bulk load
pub mod hnsw;

// Flat append-only write buffer with per-slot commit flags
pub mod write_buffer;

// Engine orchestration: tiers, compaction workers, backpressure
pub mod engine;

// Boundary contract: request/response shapes and status codes
pub mod adapter;

// Construction-time configuration
pub mod config;

// Sum-typed engine errors
pub mod error;

// Aligned float storage shared by the graph arena and the write buffers
pub(crate) mod arena;

// ===== Public API =====

pub use adapter::{
    InsertRequest, InsertResponse, SearchRequest, SearchResponse, VectorService, CODE_BAD_DIMENSION,
    CODE_INTERNAL, CODE_OK,
};
pub use config::{EngineConfig, MAX_LEVELS};
pub use engine::{EngineStats, VectorEngine};
pub use error::EngineError;
pub use hnsw::{Candidate, HnswIndex};
pub use simd::{l2_sq, l2_sq_scalar};
pub use write_buffer::FlatBuffer;
