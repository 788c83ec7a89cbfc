//! Aligned float storage
//!
//! One contiguous allocation, 32-byte aligned for the SIMD kernels, sized
//! once and never reallocated. Both the graph's vector arena and the flat
//! write buffers are backed by this type; slots become readable only after
//! their owner publishes them (release store on an edge or a ready flag), so
//! the raw reads and writes here are always ordered by an atomic elsewhere.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// 32-byte alignment satisfies unaligned-load SIMD too, but keeps rows of
/// common dimensions (multiples of 8) on vector-register boundaries.
const FLOAT_ALIGN: usize = 32;

pub(crate) struct AlignedFloats {
    ptr: NonNull<f32>,
    len: usize,
}

unsafe impl Send for AlignedFloats {}
unsafe impl Sync for AlignedFloats {}

impl AlignedFloats {
    /// Allocates `len` zeroed floats. Panics on a zero-sized or absurd request,
    /// and aborts (via the global handler) if the allocator fails; node storage
    /// is sized once at construction so there is no later failure point.
    pub(crate) fn zeroed(len: usize) -> Self {
        assert!(len > 0, "aligned arena must not be empty");
        let layout = Self::layout(len);
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw as *mut f32) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { ptr, len }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len * std::mem::size_of::<f32>(), FLOAT_ALIGN)
            .expect("arena layout overflow")
    }

    /// Raw base pointer; row arithmetic is the caller's responsibility.
    pub(crate) fn as_ptr(&self) -> *mut f32 {
        self.ptr.as_ptr()
    }

    /// Copies `src` into the row starting at `offset`.
    ///
    /// # Safety
    /// The row `[offset, offset + src.len())` must be in bounds and must not
    /// be read concurrently: callers publish the row afterwards with a
    /// release store and readers load that store with acquire before calling
    /// [`row`](Self::row).
    pub(crate) unsafe fn write_row(&self, offset: usize, src: &[f32]) {
        debug_assert!(offset + src.len() <= self.len);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
    }

    /// Borrows the row `[offset, offset + len)`.
    ///
    /// # Safety
    /// The row must have been published (see [`write_row`](Self::write_row))
    /// and must be in bounds.
    pub(crate) unsafe fn row(&self, offset: usize, len: usize) -> &[f32] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }
}

impl Drop for AlignedFloats {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, Self::layout(self.len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_round_trip() {
        let arena = AlignedFloats::zeroed(64);
        let src: Vec<f32> = (0..16).map(|i| i as f32).collect();
        unsafe {
            arena.write_row(16, &src);
            assert_eq!(arena.row(16, 16), &src[..]);
            // Zero-initialized elsewhere.
            assert!(arena.row(0, 16).iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn base_pointer_is_aligned() {
        let arena = AlignedFloats::zeroed(8);
        assert_eq!(arena.as_ptr() as usize % FLOAT_ALIGN, 0);
    }
}
