//! Flat write buffer
//!
//! Append-only SoA block of (vector, id) pairs. Appends are wait-free: a
//! fetch-add claims a slot, the payload is copied, and a per-slot ready flag
//! published with release commits it. Scanners load the flag with acquire, so
//! a slot is either invisible or fully written; there is no torn-read window
//! between the slot reservation and the payload copy.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::arena::AlignedFloats;
use crate::hnsw::Candidate;
use crate::simd::l2_sq;

pub struct FlatBuffer {
    data: AlignedFloats,
    ids: Box<[AtomicU32]>,
    ready: Box<[AtomicBool]>,
    reserved: AtomicUsize,
    capacity: usize,
    dim: usize,
}

impl FlatBuffer {
    pub fn new(capacity: usize, dim: usize) -> Self {
        assert!(capacity > 0 && dim > 0);
        Self {
            data: AlignedFloats::zeroed(capacity * dim),
            ids: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            ready: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            reserved: AtomicUsize::new(0),
            capacity,
            dim,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of claimed slots, clamped to capacity. Slots at indices below
    /// this may still be mid-commit; [`get`](Self::get) filters those out.
    pub fn len(&self) -> usize {
        self.reserved.load(Ordering::Acquire).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait-free append. Returns false when the buffer is full, which is the
    /// signal for the engine to rotate in a fresh buffer.
    pub fn append(&self, vector: &[f32], id: u32) -> bool {
        debug_assert_eq!(vector.len(), self.dim);
        let slot = self.reserved.fetch_add(1, Ordering::Relaxed);
        if slot >= self.capacity {
            return false;
        }
        // Safety: the fetch-add above makes this thread the sole writer of
        // the row; the release store on `ready` publishes it.
        unsafe {
            self.data.write_row(slot * self.dim, vector);
        }
        self.ids[slot].store(id, Ordering::Relaxed);
        self.ready[slot].store(true, Ordering::Release);
        true
    }

    /// The committed entry at `slot`, or None while its writer is still
    /// between the slot claim and the ready publish.
    pub fn get(&self, slot: usize) -> Option<(&[f32], u32)> {
        if slot >= self.len() || !self.ready[slot].load(Ordering::Acquire) {
            return None;
        }
        // Safety: the acquire load above ordered us behind the payload copy.
        let vector = unsafe { self.data.row(slot * self.dim, self.dim) };
        Some((vector, self.ids[slot].load(Ordering::Relaxed)))
    }

    /// Like [`get`](Self::get), but spins through a mid-commit slot. Used by
    /// the compaction worker, which must not drop entries; the wait is
    /// bounded by one in-flight payload copy.
    pub fn wait_entry(&self, slot: usize) -> (&[f32], u32) {
        debug_assert!(slot < self.len());
        while !self.ready[slot].load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let vector = unsafe { self.data.row(slot * self.dim, self.dim) };
        (vector, self.ids[slot].load(Ordering::Relaxed))
    }

    /// Brute-force scan: fold every committed entry into the caller's
    /// top-k max-heap.
    pub fn scan(&self, query: &[f32], k: usize, heap: &mut BinaryHeap<Candidate>) {
        debug_assert_eq!(query.len(), self.dim);
        for slot in 0..self.len() {
            let Some((vector, id)) = self.get(slot) else {
                continue;
            };
            let dist = l2_sq(query, vector);
            if heap.len() < k || dist < heap.peek().map(|c| c.dist).unwrap_or(f32::INFINITY) {
                heap.push(Candidate { id, dist });
                if heap.len() > k {
                    heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn append_until_full() {
        let buf = FlatBuffer::new(3, 2);
        assert!(buf.append(&[1.0, 0.0], 10));
        assert!(buf.append(&[0.0, 1.0], 11));
        assert!(buf.append(&[1.0, 1.0], 12));
        assert!(!buf.append(&[2.0, 2.0], 13));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get(1), Some((&[0.0, 1.0][..], 11)));
        assert_eq!(buf.get(3), None);
    }

    #[test]
    fn scan_finds_nearest() {
        let buf = FlatBuffer::new(8, 2);
        buf.append(&[0.0, 0.0], 0);
        buf.append(&[1.0, 0.0], 1);
        buf.append(&[5.0, 5.0], 2);

        let mut heap = BinaryHeap::new();
        buf.scan(&[0.1, 0.0], 2, &mut heap);
        let mut got: Vec<u32> = heap.into_sorted_vec().iter().map(|c| c.id).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn concurrent_appends_preserve_ids() {
        let buf = Arc::new(FlatBuffer::new(1024, 4));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let buf = buf.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..256u32 {
                    let id = t * 256 + i;
                    assert!(buf.append(&[id as f32; 4], id));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.len(), 1024);
        let mut seen: Vec<u32> = (0..1024).map(|s| buf.wait_entry(s).1).collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..1024).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn payload_matches_id() {
        let buf = FlatBuffer::new(16, 3);
        for id in 0..16u32 {
            buf.append(&[id as f32, 0.0, 0.0], id);
        }
        for slot in 0..16 {
            let (v, id) = buf.get(slot).unwrap();
            assert_eq!(v[0], id as f32);
        }
    }
}
