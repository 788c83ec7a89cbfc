//! Graph node storage
//!
//! Nodes live in one contiguous array allocated at construction and never
//! moved, so a node reference stays valid for the index lifetime and edges
//! can be plain ids. Each node carries one atomic neighbor-list pointer per
//! layer plus a spinlock that is only taken on the bulk-load path.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering};

use crate::arena::AlignedFloats;
use crate::config::MAX_LEVELS;
use crate::ebr;

/// Short-hold spinlock for in-place bulk-load edge updates. Lock holds are
/// O(degree * dim) distance work at most.
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A neighbor array with an atomic count.
///
/// Two disciplines share this type:
/// - streaming: the list is immutable after publication and superseded by a
///   fresh list through an atomic pointer swap; the old one is retired to EBR;
/// - bulk load: the single writer holding the node spinlock appends (and
///   prunes) in place; entries and count are atomics so concurrent bulk
///   readers never tear.
pub(crate) struct NeighborList {
    count: AtomicU32,
    ids: Box<[AtomicU32]>,
}

impl NeighborList {
    pub(crate) fn with_capacity(capacity: usize) -> Box<Self> {
        let ids = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Box::new(Self {
            count: AtomicU32::new(0),
            ids,
        })
    }

    /// Builds a fully populated list; used by the streaming path before the
    /// list is published, so plain construction order is fine.
    pub(crate) fn from_ids(ids: &[u32]) -> Box<Self> {
        Box::new(Self {
            count: AtomicU32::new(ids.len() as u32),
            ids: ids.iter().map(|&id| AtomicU32::new(id)).collect(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn get(&self, i: usize) -> u32 {
        self.ids[i].load(Ordering::Relaxed)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.iter().any(|n| n == id)
    }

    /// Appends under the node spinlock. The entry store precedes the count
    /// store (release) so a reader that observes the new count sees the id.
    pub(crate) fn push(&self, id: u32) {
        let idx = self.count.load(Ordering::Relaxed) as usize;
        debug_assert!(idx < self.capacity());
        self.ids[idx].store(id, Ordering::Relaxed);
        self.count.store(idx as u32 + 1, Ordering::Release);
    }

    /// Replaces the contents under the node spinlock (bulk-load pruning).
    pub(crate) fn overwrite(&self, ids: &[u32]) {
        debug_assert!(ids.len() <= self.capacity());
        for (slot, &id) in self.ids.iter().zip(ids) {
            slot.store(id, Ordering::Relaxed);
        }
        self.count.store(ids.len() as u32, Ordering::Release);
    }
}

/// Graph vertex: per-layer neighbor-list pointers plus the bulk-load lock.
/// Cache-line aligned to keep hot nodes from false-sharing.
#[repr(align(64))]
pub(crate) struct Node {
    links: [AtomicPtr<NeighborList>; MAX_LEVELS],
    top_level: AtomicI32,
    lock: SpinLock,
}

impl Node {
    fn empty() -> Self {
        Self {
            links: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            top_level: AtomicI32::new(-1),
            lock: SpinLock::new(),
        }
    }

    pub(crate) fn top_level(&self) -> i32 {
        self.top_level.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        self.lock.lock()
    }

    pub(crate) fn load_link(&self, layer: usize) -> *mut NeighborList {
        self.links[layer].load(Ordering::Acquire)
    }

    /// Borrows the layer's neighbor list for the lifetime of the EBR guard;
    /// the guard is what keeps a concurrently retired list alive.
    pub(crate) fn neighbors<'g>(
        &self,
        layer: usize,
        _guard: &'g ebr::Guard,
    ) -> Option<&'g NeighborList> {
        if layer >= MAX_LEVELS {
            return None;
        }
        let ptr = self.load_link(layer);
        if ptr.is_null() {
            None
        } else {
            // Safety: the pointer was published with release and cannot be
            // freed before every guard pinned at or before its retirement
            // epoch has dropped; `_guard` is such a pin.
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn store_link(&self, layer: usize, list: *mut NeighborList) {
        self.links[layer].store(list, Ordering::Release);
    }

    pub(crate) fn cas_link(
        &self,
        layer: usize,
        old: *mut NeighborList,
        new: *mut NeighborList,
    ) -> bool {
        self.links[layer]
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Fixed-size node array plus the vector arena the nodes index into.
pub(crate) struct NodeStore {
    nodes: Box<[Node]>,
    vectors: AlignedFloats,
    dim: usize,
}

impl NodeStore {
    pub(crate) fn new(max_elements: usize, dim: usize) -> Self {
        let nodes = (0..max_elements).map(|_| Node::empty()).collect();
        Self {
            nodes,
            vectors: AlignedFloats::zeroed(max_elements * dim),
            dim,
        }
    }

    pub(crate) fn node(&self, id: u32) -> &Node {
        &self.nodes[id as usize]
    }

    /// The vector payload of an initialized node. Reads are ordered behind
    /// the release store that published the node (an edge CAS, a list count,
    /// or the entry-point store).
    pub(crate) fn vector(&self, id: u32) -> &[f32] {
        unsafe { self.vectors.row(id as usize * self.dim, self.dim) }
    }

    /// Claims the node for `id` and writes its payload. Returns false if the
    /// node was already initialized, in which case the existing payload is
    /// kept: overwriting it would race against readers that can already
    /// reach the node through published edges.
    pub(crate) fn init_node(&self, id: u32, vector: &[f32], level: i32) -> bool {
        let node = self.node(id);
        if node
            .top_level
            .compare_exchange(-1, level, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Safety: the CAS above makes this thread the sole writer of the row,
        // and no edge to `id` exists yet, so no reader can reach it. Edge
        // publication after this call is the release that orders the copy.
        unsafe {
            self.vectors.write_row(id as usize * self.dim, vector);
        }
        true
    }
}

impl Drop for NodeStore {
    fn drop(&mut self) {
        for node in self.nodes.iter() {
            for layer in 0..MAX_LEVELS {
                let ptr = node.links[layer].swap(ptr::null_mut(), Ordering::Relaxed);
                if !ptr.is_null() {
                    drop(unsafe { Box::from_raw(ptr) });
                }
            }
        }
    }
}
