//! Vector engine
//!
//! Blends three substrates into one logical index: the active write buffer,
//! the queue of sealed buffers awaiting compaction, and the graph. Inserts
//! land in the active buffer wait-free; a full buffer is sealed and replaced
//! under the swap mutex, with soft throttling and hard backpressure keyed to
//! the queue depth. Background workers drain sealed buffers into the graph.
//! Searches merge a brute-force scan of every live buffer with a graph kNN
//! pass over a snapshot, so an acknowledged insert is visible immediately.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hnsw::{Candidate, HnswIndex};
use crate::simd::l2_sq;
use crate::write_buffer::FlatBuffer;

/// Throttle nap applied while the sealed queue sits between the soft and
/// hard limits.
const THROTTLE_NAP: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Entries in the current active buffer.
    pub active_len: usize,
    /// Sealed buffers waiting for a compaction worker.
    pub queue_depth: usize,
    /// Buffers fully folded into the graph.
    pub buffers_compacted: u64,
    pub inserts_total: u64,
    pub searches_total: u64,
}

struct Tiers {
    active: Arc<FlatBuffer>,
    sealed: VecDeque<Arc<FlatBuffer>>,
    /// Buffers a worker is currently folding into the graph. They stay
    /// visible to search snapshots until the fold completes; otherwise an
    /// acknowledged insert would briefly vanish between the queue pop and
    /// its graph publication. Once folded, the buffer is released and dies
    /// with the last snapshot that still holds it.
    compacting: Vec<Arc<FlatBuffer>>,
}

struct EngineInner {
    index: HnswIndex,
    tiers: Mutex<Tiers>,
    /// Signals foreground inserters that the queue shrank below hard_limit.
    swap_cv: Condvar,
    /// Signals compaction workers that a sealed buffer is available.
    bg_cv: Condvar,
    running: AtomicBool,
    cfg: EngineConfig,
    buffers_compacted: AtomicU64,
    inserts_total: AtomicU64,
    searches_total: AtomicU64,
}

pub struct VectorEngine {
    inner: Arc<EngineInner>,
    workers: Vec<JoinHandle<()>>,
}

impl VectorEngine {
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        cfg.validate()?;
        let index = HnswIndex::new(cfg.dim, cfg.max_elements, cfg.m, cfg.ef_construction)?;

        let inner = Arc::new(EngineInner {
            index,
            tiers: Mutex::new(Tiers {
                active: Arc::new(FlatBuffer::new(cfg.buffer_capacity, cfg.dim)),
                sealed: VecDeque::new(),
                compacting: Vec::new(),
            }),
            swap_cv: Condvar::new(),
            bg_cv: Condvar::new(),
            running: AtomicBool::new(true),
            cfg: cfg.clone(),
            buffers_compacted: AtomicU64::new(0),
            inserts_total: AtomicU64::new(0),
            searches_total: AtomicU64::new(0),
        });

        let workers = (0..cfg.bg_threads)
            .map(|worker_id| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("compaction-{worker_id}"))
                    .spawn(move || compaction_loop(worker_id, inner))
                    .expect("spawn compaction worker")
            })
            .collect();

        info!(
            dim = cfg.dim,
            max_elements = cfg.max_elements,
            bg_threads = cfg.bg_threads,
            "vector engine started"
        );
        Ok(Self { inner, workers })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.cfg
    }

    /// Direct access to the underlying graph, for the cold-start bulk load
    /// that bypasses the write path.
    pub fn index(&self) -> &HnswIndex {
        &self.inner.index
    }

    pub fn stats(&self) -> EngineStats {
        let tiers = self.inner.tiers.lock();
        EngineStats {
            active_len: tiers.active.len(),
            queue_depth: tiers.sealed.len(),
            buffers_compacted: self.inner.buffers_compacted.load(Ordering::Relaxed),
            inserts_total: self.inner.inserts_total.load(Ordering::Relaxed),
            searches_total: self.inner.searches_total.load(Ordering::Relaxed),
        }
    }

    /// Foreground insert. Wait-free in the common case; may nap ~2ms under
    /// soft backpressure and blocks while the sealed queue is at hard_limit.
    pub fn insert(&self, vector: &[f32], id: u32) -> Result<()> {
        let inner = &self.inner;
        if vector.len() != inner.cfg.dim {
            return Err(EngineError::DimensionMismatch {
                expected: inner.cfg.dim,
                got: vector.len(),
            });
        }
        if id as usize >= inner.cfg.max_elements {
            return Err(EngineError::CapacityExceeded {
                id,
                max_elements: inner.cfg.max_elements,
            });
        }

        // Fast path: the lock is held only long enough to clone the active
        // handle; the append itself runs wait-free outside it.
        {
            let active = inner.tiers.lock().active.clone();
            if active.append(vector, id) {
                inner.inserts_total.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let mut tiers = inner.tiers.lock();
        let mut throttled = false;
        loop {
            // Another thread may have rotated while we waited for the lock.
            if tiers.active.append(vector, id) {
                inner.inserts_total.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let depth = tiers.sealed.len();
            if depth >= inner.cfg.hard_limit {
                // Hard backpressure: wait for a worker to drain one buffer.
                inner.swap_cv.wait(&mut tiers);
                continue;
            }
            if depth >= inner.cfg.soft_limit && !throttled {
                // Soft throttle: release the lock and nap once to shave the
                // foreground write rate while compaction catches up.
                throttled = true;
                drop(tiers);
                std::thread::sleep(THROTTLE_NAP);
                tiers = inner.tiers.lock();
                continue;
            }

            // Seal the full buffer and rotate in a fresh one.
            let full = tiers.active.clone();
            tiers.sealed.push_back(full);
            tiers.active = Arc::new(FlatBuffer::new(inner.cfg.buffer_capacity, inner.cfg.dim));
            let appended = tiers.active.append(vector, id);
            debug_assert!(appended, "fresh buffer rejected an append");
            debug!(queue_depth = tiers.sealed.len(), "sealed full write buffer");
            inner.inserts_total.fetch_add(1, Ordering::Relaxed);
            inner.bg_cv.notify_one();
            return Ok(());
        }
    }

    /// Merged k-nearest-neighbor search over buffers and graph. Returns
    /// id/distance pairs sorted by ascending distance.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<Candidate>> {
        let inner = &self.inner;
        if query.len() != inner.cfg.dim {
            return Err(EngineError::DimensionMismatch {
                expected: inner.cfg.dim,
                got: query.len(),
            });
        }
        inner.searches_total.fetch_add(1, Ordering::Relaxed);
        if k == 0 {
            return Ok(Vec::new());
        }

        // Snapshot the buffer set under the swap mutex. The Arc handles keep
        // every snapshotted buffer alive even if compaction releases it
        // mid-search.
        let (active, buffers) = {
            let tiers = inner.tiers.lock();
            let mut buffers: Vec<Arc<FlatBuffer>> =
                Vec::with_capacity(tiers.sealed.len() + tiers.compacting.len());
            buffers.extend(tiers.sealed.iter().cloned());
            buffers.extend(tiers.compacting.iter().cloned());
            (tiers.active.clone(), buffers)
        };

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for buffer in &buffers {
            buffer.scan(query, k, &mut heap);
        }
        active.scan(query, k, &mut heap);

        // Graph pass; distances are recomputed against the query so buffer
        // and graph results share one metric.
        for id in inner.index.search_knn(query, k, ef_search) {
            let dist = l2_sq(query, inner.index.vector(id));
            if heap.len() < k || dist < heap.peek().map(|c| c.dist).unwrap_or(f32::INFINITY) {
                if !heap.iter().any(|c| c.id == id) {
                    heap.push(Candidate { id, dist });
                    if heap.len() > k {
                        heap.pop();
                    }
                }
            }
        }

        Ok(heap.into_sorted_vec())
    }

    /// Blocks until every sealed buffer has been folded into the graph.
    /// Intended for tests and for the hand-off from bulk load to steady
    /// state; new inserts may still land in the active buffer meanwhile.
    pub fn wait_for_compaction(&self) {
        loop {
            {
                let tiers = self.inner.tiers.lock();
                if tiers.sealed.is_empty() && tiers.compacting.is_empty() {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for VectorEngine {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.bg_cv.notify_all();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                warn!("compaction worker panicked during shutdown: {:?}", e);
            }
        }
        // The graph (inside `inner`) is torn down after the workers are gone.
        info!("vector engine stopped");
    }
}

fn compaction_loop(worker_id: usize, inner: Arc<EngineInner>) {
    loop {
        let buffer = {
            let mut tiers = inner.tiers.lock();
            while tiers.sealed.is_empty() && inner.running.load(Ordering::Acquire) {
                inner.bg_cv.wait(&mut tiers);
            }
            if tiers.sealed.is_empty() {
                // Shutdown with a drained queue.
                return;
            }
            let buffer = tiers.sealed.pop_front().expect("non-empty sealed queue");
            // Keep the buffer scannable while it is being folded.
            tiers.compacting.push(buffer.clone());
            buffer
        };
        // Queue space opened up; throttled or blocked inserters can move.
        inner.swap_cv.notify_all();

        // Fold the buffer into the graph outside the lock; streaming insert
        // is thread-safe, so several workers can compact concurrently.
        let count = buffer.len();
        for slot in 0..count {
            let (vector, id) = buffer.wait_entry(slot);
            if let Err(e) = inner.index.insert(vector, id) {
                // Ids are validated before buffering; this is unreachable in
                // a correct engine but must not kill the worker.
                warn!(worker_id, id, "dropping buffered vector: {e}");
            }
        }

        {
            let mut tiers = inner.tiers.lock();
            tiers.compacting.retain(|b| !Arc::ptr_eq(b, &buffer));
        }
        inner.buffers_compacted.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id, count, "compacted buffer into graph");
    }
}
