//! Hierarchical proximity graph index
//!
//! Multi-layer small-world graph under the squared-L2 metric. Readers
//! traverse neighbor lists lock-free under an EBR pin; streaming writers
//! publish updated lists through an atomic pointer swap and retire the old
//! list to EBR. Bulk load skips the copy-on-write machinery entirely and
//! mutates lists in place under per-node spinlocks, with heuristic pruning
//! keeping degrees at the configured bound.

mod node;
mod visited;

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use smallvec::SmallVec;

use crate::config::MAX_LEVELS;
use crate::ebr;
use crate::error::{EngineError, Result};
use crate::simd::l2_sq;

use node::{NeighborList, NodeStore};

/// An id/distance pair ordered by distance (then id, for a total order).
/// `BinaryHeap<Candidate>` is a max-heap whose top is the current worst.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: u32,
    pub dist: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.id == other.id
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

thread_local! {
    static VISITED: RefCell<visited::VisitedSet> = RefCell::new(visited::VisitedSet::new());
}

unsafe fn drop_neighbor_list(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut NeighborList));
}

/// The graph index. All public operations are safe to call from any number
/// of threads concurrently; `insert_bulk` is additionally intended for the
/// cold-start phase where no streaming traffic exists yet.
pub struct HnswIndex {
    store: NodeStore,
    dim: usize,
    max_elements: usize,
    m: usize,
    m0: usize,
    ef_construction: usize,
    level_mult: f64,
    entry_point: AtomicU32,
    max_level: AtomicI32,
    /// Guards only the rare entry-point/max-level promotion.
    entry_lock: Mutex<()>,
}

impl HnswIndex {
    pub fn new(dim: usize, max_elements: usize, m: usize, ef_construction: usize) -> Result<Self> {
        if dim == 0 {
            return Err(EngineError::InvalidConfig("dim must be > 0".into()));
        }
        if max_elements == 0 {
            return Err(EngineError::InvalidConfig(
                "max_elements must be > 0".into(),
            ));
        }
        if m < 2 {
            return Err(EngineError::InvalidConfig("m must be >= 2".into()));
        }
        if ef_construction == 0 {
            return Err(EngineError::InvalidConfig(
                "ef_construction must be > 0".into(),
            ));
        }
        Ok(Self {
            store: NodeStore::new(max_elements, dim),
            dim,
            max_elements,
            m,
            m0: m * 2,
            ef_construction,
            level_mult: 1.0 / (m as f64).ln(),
            entry_point: AtomicU32::new(0),
            max_level: AtomicI32::new(-1),
            entry_lock: Mutex::new(()),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Entry point id, or None while the graph is empty.
    pub fn entry_point(&self) -> Option<u32> {
        if self.max_level.load(Ordering::Acquire) < 0 {
            None
        } else {
            Some(self.entry_point.load(Ordering::Acquire))
        }
    }

    pub fn max_level(&self) -> i32 {
        self.max_level.load(Ordering::Acquire)
    }

    /// Payload of an initialized node.
    pub fn vector(&self, id: u32) -> &[f32] {
        self.store.vector(id)
    }

    /// Snapshot of a node's neighbor ids at one layer. Introspection for
    /// tests and diagnostics; the returned set may be stale immediately.
    pub fn layer_links(&self, id: u32, layer: usize) -> Vec<u32> {
        let guard = ebr::pin();
        self.store
            .node(id)
            .neighbors(layer, &guard)
            .map(|l| l.iter().collect())
            .unwrap_or_default()
    }

    fn check(&self, vector: &[f32], id: u32) -> Result<()> {
        if vector.len() != self.dim {
            return Err(EngineError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        if id as usize >= self.max_elements {
            return Err(EngineError::CapacityExceeded {
                id,
                max_elements: self.max_elements,
            });
        }
        Ok(())
    }

    /// Draws the level for a new node: `floor(-ln(u) * level_mult)` clamped
    /// below MAX_LEVELS, with u uniform in (0, 1].
    fn random_level(&self) -> i32 {
        let mut rng = rand::thread_rng();
        let u: f64 = 1.0 - rng.gen::<f64>();
        let level = (-u.ln() * self.level_mult) as usize;
        level.min(MAX_LEVELS - 1) as i32
    }

    /// Greedy walk from `curr` down through `[bottom, top]`, stepping to any
    /// strictly closer neighbor until a local minimum per layer.
    fn greedy_descend(
        &self,
        query: &[f32],
        mut curr: u32,
        mut curr_dist: f32,
        top: i32,
        bottom: i32,
        guard: &ebr::Guard,
    ) -> (u32, f32) {
        for level in (bottom..=top).rev() {
            loop {
                let mut changed = false;
                if let Some(neighbors) = self.store.node(curr).neighbors(level as usize, guard) {
                    for nb in neighbors.iter() {
                        let d = l2_sq(query, self.store.vector(nb));
                        if d < curr_dist {
                            curr_dist = d;
                            curr = nb;
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }
        }
        (curr, curr_dist)
    }

    /// Beam search within one layer. Returns up to `ef` candidates sorted by
    /// ascending distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
        guard: &ebr::Guard,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut top: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef + 1);
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();

        let entry_dist = l2_sq(query, self.store.vector(entry));
        let start = Candidate {
            id: entry,
            dist: entry_dist,
        };

        VISITED.with(|cell| {
            let mut visited = cell.borrow_mut();
            visited.reset(self.max_elements);
            visited.insert(entry);
            frontier.push(Reverse(start));
            top.push(start);

            while let Some(Reverse(current)) = frontier.pop() {
                if top.len() == ef && current.dist > top.peek().expect("top not empty").dist {
                    break;
                }
                let Some(neighbors) = self.store.node(current.id).neighbors(layer, guard) else {
                    continue;
                };
                for nb in neighbors.iter() {
                    if !visited.insert(nb) {
                        continue;
                    }
                    let d = l2_sq(query, self.store.vector(nb));
                    if top.len() < ef || d < top.peek().expect("top not empty").dist {
                        let cand = Candidate { id: nb, dist: d };
                        frontier.push(Reverse(cand));
                        top.push(cand);
                        if top.len() > ef {
                            top.pop();
                        }
                    }
                }
            }
        });

        top.into_sorted_vec()
    }

    /// HNSW diversity rule over `ids` relative to `base`: sort by distance to
    /// base, keep a candidate only if it is closer to base than to every
    /// already kept neighbor, then backfill from the sorted order.
    fn heuristic_prune(&self, base: u32, ids: &[u32], max_m: usize) -> Vec<u32> {
        let base_vec = self.store.vector(base);
        let mut candidates: Vec<Candidate> = ids
            .iter()
            .map(|&id| Candidate {
                id,
                dist: l2_sq(base_vec, self.store.vector(id)),
            })
            .collect();
        candidates.sort_unstable();

        let mut kept: SmallVec<[Candidate; 32]> = SmallVec::new();
        for cand in &candidates {
            if kept.len() >= max_m {
                break;
            }
            let diverse = kept.iter().all(|sel| {
                l2_sq(self.store.vector(cand.id), self.store.vector(sel.id)) >= cand.dist
            });
            if diverse {
                kept.push(*cand);
            }
        }
        if kept.len() < max_m {
            for cand in &candidates {
                if kept.len() >= max_m {
                    break;
                }
                if !kept.iter().any(|sel| sel.id == cand.id) {
                    kept.push(*cand);
                }
            }
        }
        kept.into_iter().map(|c| c.id).collect()
    }

    /// Copy-on-write edge add for the streaming path: build the successor
    /// list, swing the pointer, retire the old list to EBR. Deduplicates, and
    /// folds a heuristic prune into the replacement once the list would grow
    /// past twice the degree bound.
    fn add_neighbor_rcu(
        &self,
        node_id: u32,
        layer: usize,
        new_id: u32,
        max_m: usize,
        _guard: &ebr::Guard,
    ) {
        let node = self.store.node(node_id);
        loop {
            let old_ptr = node.load_link(layer);
            let new_list = if old_ptr.is_null() {
                NeighborList::from_ids(&[new_id])
            } else {
                // Safety: `_guard` keeps the snapshot alive; the copy below
                // is taken from the exact pointer the CAS compares against.
                let old: &NeighborList = unsafe { &*old_ptr };
                if old.contains(new_id) {
                    return;
                }
                let mut ids: Vec<u32> = old.iter().collect();
                ids.push(new_id);
                if ids.len() > 2 * max_m {
                    NeighborList::from_ids(&self.heuristic_prune(node_id, &ids, max_m))
                } else {
                    NeighborList::from_ids(&ids)
                }
            };

            let new_ptr = Box::into_raw(new_list);
            if node.cas_link(layer, old_ptr, new_ptr) {
                if !old_ptr.is_null() {
                    // Safety: the old list is unreachable from the graph now;
                    // only pinned readers may still hold it.
                    unsafe { ebr::defer(old_ptr as *mut (), drop_neighbor_list) };
                }
                return;
            }
            // Lost the race: discard the speculative list and retry against
            // the fresh head.
            drop(unsafe { Box::from_raw(new_ptr) });
        }
    }

    /// In-place edge add for bulk load; caller holds the node's spinlock.
    fn add_neighbor_inplace(&self, node_id: u32, layer: usize, new_id: u32, max_m: usize, guard: &ebr::Guard) {
        let node = self.store.node(node_id);
        let mut ptr = node.load_link(layer);
        if ptr.is_null() {
            // One overflow slot beyond the bound keeps the append below
            // infallible.
            let fresh = NeighborList::with_capacity(max_m + 1);
            ptr = Box::into_raw(fresh);
            node.store_link(layer, ptr);
        }
        // Safety: published link, protected by `guard`.
        let mut list = node.neighbors(layer, guard).expect("non-null link observed");
        if list.contains(new_id) {
            return;
        }
        if list.len() == list.capacity() {
            // A list inherited from a streaming phase may be exactly full;
            // migrate it to a bulk-capacity list before appending.
            let ids: Vec<u32> = list.iter().collect();
            let grown = NeighborList::with_capacity(ids.len().max(max_m) + 1);
            grown.overwrite(&ids);
            let grown_ptr = Box::into_raw(grown);
            node.store_link(layer, grown_ptr);
            unsafe { ebr::defer(ptr as *mut (), drop_neighbor_list) };
            list = node.neighbors(layer, guard).expect("non-null link observed");
        }
        list.push(new_id);
        if list.len() > max_m {
            let ids: Vec<u32> = list.iter().collect();
            list.overwrite(&self.heuristic_prune(node_id, &ids, max_m));
        }
    }

    /// Streaming insert: thread-safe against concurrent searches and inserts.
    pub fn insert(&self, vector: &[f32], id: u32) -> Result<()> {
        self.insert_impl(vector, id, false)
    }

    /// Bulk-load insert for the cold-start phase: edges are updated in place
    /// under per-node spinlocks instead of going through copy-on-write, so
    /// degrees stay pruned at the configured bound. Safe to call from many
    /// loader threads at once; must not overlap with streaming inserts.
    pub fn insert_bulk(&self, vector: &[f32], id: u32) -> Result<()> {
        self.insert_impl(vector, id, true)
    }

    fn insert_impl(&self, vector: &[f32], id: u32, bulk: bool) -> Result<()> {
        self.check(vector, id)?;
        let guard = ebr::pin();

        let level = self.random_level();
        self.store.init_node(id, vector, level);
        let level = self.store.node(id).top_level();

        let mut curr_max = self.max_level.load(Ordering::Acquire);
        if curr_max == -1 {
            let locked = self.entry_lock.lock();
            if self.max_level.load(Ordering::Acquire) == -1 {
                self.entry_point.store(id, Ordering::Release);
                self.max_level.store(level, Ordering::Release);
                return Ok(());
            }
            drop(locked);
            curr_max = self.max_level.load(Ordering::Acquire);
        }

        let mut curr = self.entry_point.load(Ordering::Acquire);
        let curr_dist = l2_sq(vector, self.store.vector(curr));

        // Phase one: ride down to the first layer the new node occupies.
        (curr, _) = self.greedy_descend(vector, curr, curr_dist, curr_max, level + 1, &guard);

        // Phase two: per-layer candidate search and bidirectional wiring.
        for layer in (0..=curr_max.min(level)).rev() {
            let candidates =
                self.search_layer(vector, curr, self.ef_construction, layer as usize, &guard);
            let max_m = if layer == 0 { self.m0 } else { self.m };
            for cand in candidates.iter().take(max_m) {
                if cand.id == id {
                    continue;
                }
                if bulk {
                    {
                        let _node_lock = self.store.node(id).lock();
                        self.add_neighbor_inplace(id, layer as usize, cand.id, max_m, &guard);
                    }
                    {
                        let _nb_lock = self.store.node(cand.id).lock();
                        self.add_neighbor_inplace(cand.id, layer as usize, id, max_m, &guard);
                    }
                } else {
                    self.add_neighbor_rcu(id, layer as usize, cand.id, max_m, &guard);
                    self.add_neighbor_rcu(cand.id, layer as usize, id, max_m, &guard);
                }
            }
            if let Some(best) = candidates.first() {
                curr = best.id;
            }
        }

        // Phase three: promote the entry point if the new node tops the graph.
        if level > curr_max {
            let _locked = self.entry_lock.lock();
            if level > self.max_level.load(Ordering::Acquire) {
                self.entry_point.store(id, Ordering::Release);
                self.max_level.store(level, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Approximate k-nearest-neighbor search; returns ids sorted by ascending
    /// distance. An empty graph yields an empty result.
    pub fn search_knn(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<u32> {
        let guard = ebr::pin();

        let max_level = self.max_level.load(Ordering::Acquire);
        if max_level < 0 {
            return Vec::new();
        }

        let mut curr = self.entry_point.load(Ordering::Acquire);
        let curr_dist = l2_sq(query, self.store.vector(curr));
        (curr, _) = self.greedy_descend(query, curr, curr_dist, max_level, 1, &guard);

        let mut results = self.search_layer(query, curr, ef_search.max(k), 0, &guard);
        results.truncate(k);
        results.into_iter().map(|c| c.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn empty_graph_returns_empty() {
        let index = HnswIndex::new(8, 16, 4, 32).unwrap();
        assert!(index.search_knn(&[0.0; 8], 5, 10).is_empty());
        assert_eq!(index.entry_point(), None);
    }

    #[test]
    fn single_insert_is_found_at_distance_zero() {
        let index = HnswIndex::new(4, 16, 4, 32).unwrap();
        index.insert(&[0.0, 0.0, 0.0, 0.0], 7).unwrap();
        let got = index.search_knn(&[0.0, 0.0, 0.0, 0.0], 1, 50);
        assert_eq!(got, vec![7]);
        assert_eq!(index.entry_point(), Some(7));
    }

    #[test]
    fn rejects_wrong_dimension_and_overflow_id() {
        let index = HnswIndex::new(4, 8, 4, 32).unwrap();
        assert!(matches!(
            index.insert(&[1.0, 2.0], 0),
            Err(EngineError::DimensionMismatch { expected: 4, got: 2 })
        ));
        assert!(matches!(
            index.insert(&[0.0; 4], 8),
            Err(EngineError::CapacityExceeded { id: 8, .. })
        ));
    }

    #[test]
    fn streaming_self_recall() {
        let dim = 16;
        let vectors = random_vectors(300, dim);
        let index = HnswIndex::new(dim, 512, 8, 64).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.insert(v, i as u32).unwrap();
        }
        let mut hits = 0;
        for (i, v) in vectors.iter().enumerate() {
            let got = index.search_knn(v, 1, 50);
            if got.first() == Some(&(i as u32)) {
                hits += 1;
            }
        }
        assert!(hits >= 297, "self recall too low: {}/300", hits);
    }

    #[test]
    fn bulk_load_self_recall_and_degree_bound() {
        let dim = 16;
        let vectors = random_vectors(300, dim);
        let index = HnswIndex::new(dim, 512, 8, 64).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.insert_bulk(v, i as u32).unwrap();
        }
        let mut hits = 0;
        for (i, v) in vectors.iter().enumerate() {
            let got = index.search_knn(v, 1, 50);
            if got.first() == Some(&(i as u32)) {
                hits += 1;
            }
        }
        assert!(hits >= 297, "self recall too low: {}/300", hits);

        // In-place pruning keeps every layer-0 list at or below m0.
        for id in 0..300u32 {
            assert!(index.layer_links(id, 0).len() <= 16);
        }
    }

    #[test]
    fn results_sorted_ascending() {
        let dim = 8;
        let vectors = random_vectors(200, dim);
        let index = HnswIndex::new(dim, 256, 8, 64).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.insert(v, i as u32).unwrap();
        }
        let query = &vectors[0];
        let ids = index.search_knn(query, 10, 64);
        let dists: Vec<f32> = ids.iter().map(|&id| l2_sq(query, index.vector(id))).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn repeated_search_is_deterministic_on_fixed_graph() {
        let dim = 8;
        let vectors = random_vectors(200, dim);
        let index = HnswIndex::new(dim, 256, 8, 64).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.insert(v, i as u32).unwrap();
        }
        let query = &vectors[42];
        assert_eq!(index.search_knn(query, 10, 64), index.search_knn(query, 10, 64));
    }

    #[test]
    fn duplicate_insert_does_not_duplicate_edges() {
        let dim = 4;
        let index = HnswIndex::new(dim, 16, 4, 32).unwrap();
        let vectors = random_vectors(8, dim);
        for (i, v) in vectors.iter().enumerate() {
            index.insert(v, i as u32).unwrap();
        }
        index.insert(&vectors[3], 3).unwrap();
        let links = index.layer_links(3, 0);
        let mut deduped = links.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(links.len(), deduped.len());
    }

    #[test]
    fn random_levels_stay_in_range() {
        let index = HnswIndex::new(4, 16, 16, 32).unwrap();
        for _ in 0..10_000 {
            let level = index.random_level();
            assert!((0..MAX_LEVELS as i32).contains(&level));
        }
    }

    #[test]
    fn heuristic_prune_respects_bound_and_keeps_nearest() {
        let dim = 2;
        let index = HnswIndex::new(dim, 32, 2, 16).unwrap();
        // Base at origin, candidates on a line: nearest must survive.
        index.insert_bulk(&[0.0, 0.0], 0).unwrap();
        for i in 1..10u32 {
            index
                .insert_bulk(&[i as f32, 0.0], i)
                .unwrap();
        }
        let ids: Vec<u32> = (1..10).collect();
        let pruned = index.heuristic_prune(0, &ids, 4);
        assert!(pruned.len() <= 4);
        assert_eq!(pruned[0], 1);
    }
}
