//! Boundary service contract
//!
//! The remote front-end marshals two operations into the engine. Wire
//! framing lives outside this crate; what is fixed here is the request and
//! response shapes and the status codes: 0 for success, -1 for a dimension
//! mismatch (rejected before touching the core), -2 for any other failure.

use std::sync::Arc;

use tracing::warn;

use crate::engine::VectorEngine;

pub const CODE_OK: i32 = 0;
pub const CODE_BAD_DIMENSION: i32 = -1;
pub const CODE_INTERNAL: i32 = -2;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Vec<f32>,
    pub k: u32,
    pub ef_search: u32,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub code: i32,
    pub ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct InsertRequest {
    pub vector: Vec<f32>,
    pub id: u32,
}

#[derive(Debug, Clone)]
pub struct InsertResponse {
    pub code: i32,
}

/// Thin adapter between a transport and the engine. Validates dimensions so
/// malformed requests never reach the core.
pub struct VectorService {
    engine: Arc<VectorEngine>,
}

impl VectorService {
    pub fn new(engine: Arc<VectorEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<VectorEngine> {
        &self.engine
    }

    pub fn search(&self, request: &SearchRequest) -> SearchResponse {
        if request.query.len() != self.engine.config().dim {
            return SearchResponse {
                code: CODE_BAD_DIMENSION,
                ids: Vec::new(),
            };
        }
        match self
            .engine
            .search(&request.query, request.k as usize, request.ef_search as usize)
        {
            Ok(results) => SearchResponse {
                code: CODE_OK,
                ids: results.into_iter().map(|c| c.id).collect(),
            },
            Err(e) => {
                warn!("search failed: {e}");
                SearchResponse {
                    code: CODE_INTERNAL,
                    ids: Vec::new(),
                }
            }
        }
    }

    pub fn insert(&self, request: &InsertRequest) -> InsertResponse {
        if request.vector.len() != self.engine.config().dim {
            return InsertResponse {
                code: CODE_BAD_DIMENSION,
            };
        }
        match self.engine.insert(&request.vector, request.id) {
            Ok(()) => InsertResponse { code: CODE_OK },
            Err(e) => {
                warn!(id = request.id, "insert failed: {e}");
                InsertResponse {
                    code: CODE_INTERNAL,
                }
            }
        }
    }
}
