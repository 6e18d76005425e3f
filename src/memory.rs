//! The frame-buffer arena: aligned allocation with size-keyed recycling.
//!
//! Every plane payload in the engine is carved out of a [`MemoryPool`]. Freed
//! buffers are parked on a free list keyed by block size and handed back out
//! when a new request fits, so steady-state pipelines stop touching the system
//! allocator entirely. The pool enforces a *soft* cap: allocation never fails
//! because of it, but once live bytes plus parked bytes exceed the cap, parked
//! buffers are evicted (at random, to avoid pathological size patterns) until
//! the total drops back under.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::frame_alignment;

/// Granularity used when the large-page strategy is enabled.
const LARGE_PAGE_SIZE: usize = 2 << 20;

/// Block header stored at the start of every raw allocation, one alignment
/// quantum before the pointer handed to callers.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockHeader {
    size: usize,
    large: bool,
}

struct FreeList {
    /// Size-keyed multimap of parked buffers. Pointers reference the payload
    /// (header sits one alignment quantum behind).
    buffers: BTreeMap<usize, Vec<NonNull<u8>>>,
    /// Total bytes parked on the free list.
    unused: usize,
    limit: usize,
    large_pages: bool,
    warned: bool,
}

// The raw pointers in the free list are uniquely owned by the pool.
unsafe impl Send for FreeList {}

/// Reference-counted arena shared by a core and all frames it produced.
///
/// The pool deliberately outlives the [`Core`](crate::Core) that created it:
/// plane payloads hold an `Arc<MemoryPool>`, so the arena is only torn down
/// once the last frame drops and `used()` has returned to zero.
pub struct MemoryPool {
    used: AtomicUsize,
    peak: AtomicUsize,
    free: Mutex<FreeList>,
}

impl MemoryPool {
    pub(crate) fn new() -> Self {
        assert!(frame_alignment() >= std::mem::size_of::<BlockHeader>());
        // 1 GiB on 32-bit address spaces, 4 GiB on 64-bit.
        let limit = if std::mem::size_of::<usize>() >= 8 {
            4usize << 30
        } else {
            1usize << 30
        };
        MemoryPool {
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            free: Mutex::new(FreeList {
                buffers: BTreeMap::new(),
                unused: 0,
                limit,
                large_pages: false,
                warned: false,
            }),
        }
    }

    /// Bytes currently backing live plane payloads.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// High-water mark of [`used`](Self::used) over the pool's lifetime.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// The soft memory cap in bytes.
    pub fn limit(&self) -> usize {
        self.free.lock().limit
    }

    /// Adjusts the soft cap and returns the value now in effect. Values of
    /// zero are ignored.
    pub fn set_limit(&self, bytes: usize) -> usize {
        let mut fl = self.free.lock();
        if bytes > 0 {
            fl.limit = bytes;
        }
        fl.limit
    }

    /// Whether live payload bytes alone exceed the soft cap. Cache filters are
    /// asked to trim when this turns true.
    pub fn over_limit(&self) -> bool {
        self.used() > self.limit()
    }

    /// Enables or disables the large-page allocation strategy.
    pub fn set_large_pages(&self, enabled: bool) {
        self.free.lock().large_pages = enabled;
    }

    pub(crate) fn add(&self, bytes: usize) {
        let now = self.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn subtract(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// A recycled block is an acceptable stand-in for a request when it wastes
    /// at most 1/8th of the requested size.
    fn is_good_fit(requested: usize, actual: usize) -> bool {
        actual <= requested + requested / 8
    }

    /// Hands out an aligned buffer of at least `bytes` bytes, preferring a
    /// recycled block when one fits.
    pub(crate) fn alloc_buffer(&self, bytes: usize) -> NonNull<u8> {
        let mut fl = self.free.lock();
        let candidate = fl
            .buffers
            .range(bytes..)
            .next()
            .map(|(size, _)| *size)
            .filter(|size| Self::is_good_fit(bytes, *size));
        if let Some(size) = candidate {
            let bucket = fl.buffers.get_mut(&size).expect("free-list bucket exists");
            let buf = bucket.pop().expect("free-list bucket is non-empty");
            if bucket.is_empty() {
                fl.buffers.remove(&size);
            }
            fl.unused -= size;
            return buf;
        }
        let large_pages = fl.large_pages;
        drop(fl);
        Self::allocate(bytes, large_pages)
    }

    /// Parks a buffer previously returned by [`alloc_buffer`](Self::alloc_buffer)
    /// on the free list, then evicts random parked entries while the soft cap
    /// is exceeded.
    pub(crate) fn free_buffer(&self, buf: NonNull<u8>) {
        let header = unsafe { Self::header(buf) };
        if header.size == 0 {
            crate::core::fatal_error("memory corruption detected in frame buffer header");
        }

        let mut fl = self.free.lock();
        fl.buffers.entry(header.size).or_default().push(buf);
        fl.unused += header.size;

        let used = self.used();
        let mut rng = rand::thread_rng();
        while used + fl.unused > fl.limit && !fl.buffers.is_empty() {
            if !fl.warned {
                tracing::warn!(
                    limit = fl.limit,
                    "frame buffer use exceeded the soft memory cap, evicting recycled buffers"
                );
                fl.warned = true;
            }
            let total: usize = fl.buffers.values().map(Vec::len).sum();
            let mut pick = rng.gen_range(0..total);
            let size = *fl
                .buffers
                .iter()
                .find(|(_, bucket)| {
                    if pick < bucket.len() {
                        true
                    } else {
                        pick -= bucket.len();
                        false
                    }
                })
                .map(|(size, _)| size)
                .expect("eviction index within free list");
            let bucket = fl.buffers.get_mut(&size).expect("free-list bucket exists");
            let victim = bucket.swap_remove(pick);
            if bucket.is_empty() {
                fl.buffers.remove(&size);
            }
            fl.unused -= size;
            unsafe { Self::release(victim) };
        }
    }

    fn allocate(bytes: usize, large_pages: bool) -> NonNull<u8> {
        let align = frame_alignment();
        if large_pages {
            // Round the whole allocation up to the page granularity, but only
            // take this path when the rounded block still passes the recycling
            // fit test; otherwise the block would be rejected on reuse and the
            // free list would fill with near-misses.
            let total = (align + bytes + (LARGE_PAGE_SIZE - 1)) & !(LARGE_PAGE_SIZE - 1);
            if Self::is_good_fit(bytes, total - align) {
                return Self::allocate_raw(total - align, align, true);
            }
        }
        Self::allocate_raw(bytes, align, false)
    }

    fn allocate_raw(size: usize, align: usize, large: bool) -> NonNull<u8> {
        let layout = Layout::from_size_align(align + size, align)
            .unwrap_or_else(|_| crate::core::fatal_error("invalid frame buffer layout"));
        let base = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            crate::core::fatal_error("out of memory allocating frame buffer");
        };
        unsafe {
            base.as_ptr()
                .cast::<BlockHeader>()
                .write(BlockHeader { size, large });
            NonNull::new_unchecked(base.as_ptr().add(align))
        }
    }

    unsafe fn header(buf: NonNull<u8>) -> BlockHeader {
        buf.as_ptr()
            .sub(frame_alignment())
            .cast::<BlockHeader>()
            .read()
    }

    unsafe fn release(buf: NonNull<u8>) {
        let align = frame_alignment();
        let header = Self::header(buf);
        let layout = Layout::from_size_align_unchecked(align + header.size, align);
        alloc::dealloc(buf.as_ptr().sub(align), layout);
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let fl = self.free.get_mut();
        for (_, bucket) in std::mem::take(&mut fl.buffers) {
            for buf in bucket {
                unsafe { Self::release(buf) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_returns_aligned_buffer() {
        let pool = MemoryPool::new();
        let buf = pool.alloc_buffer(4096);
        assert_eq!(buf.as_ptr() as usize % frame_alignment(), 0);
        pool.free_buffer(buf);
    }

    #[test]
    fn test_free_list_reuses_good_fit() {
        let pool = MemoryPool::new();
        let first = pool.alloc_buffer(4096);
        let addr = first.as_ptr() as usize;
        pool.free_buffer(first);
        // Same size: exact fit, must come back from the free list.
        let again = pool.alloc_buffer(4096);
        assert_eq!(again.as_ptr() as usize, addr);
        pool.free_buffer(again);
    }

    #[test]
    fn test_free_list_rejects_poor_fit() {
        let pool = MemoryPool::new();
        let big = pool.alloc_buffer(64 * 1024);
        let addr = big.as_ptr() as usize;
        pool.free_buffer(big);
        // A 4 KiB request must not be satisfied by a 64 KiB block.
        let small = pool.alloc_buffer(4096);
        assert_ne!(small.as_ptr() as usize, addr);
        pool.free_buffer(small);
    }

    #[test]
    fn test_fit_rule_boundary() {
        assert!(MemoryPool::is_good_fit(4096, 4096));
        assert!(MemoryPool::is_good_fit(4096, 4096 + 4096 / 8));
        assert!(!MemoryPool::is_good_fit(4096, 4096 + 4096 / 8 + 1));
    }

    #[test]
    fn test_soft_cap_evicts_parked_buffers() {
        let pool = MemoryPool::new();
        pool.set_limit(256 * 1024);
        let bufs: Vec<_> = (0..8).map(|_| pool.alloc_buffer(64 * 1024)).collect();
        // Nothing is accounted as used (no plane payloads), so the entire
        // parked total competes against the cap: at most four 64 KiB blocks
        // may stay parked.
        for buf in bufs {
            pool.free_buffer(buf);
        }
        assert!(pool.free.lock().unused <= 256 * 1024);
    }

    #[test]
    fn test_used_accounting_round_trips() {
        let pool = MemoryPool::new();
        assert_eq!(pool.used(), 0);
        pool.add(1000);
        pool.add(500);
        assert_eq!(pool.used(), 1500);
        assert_eq!(pool.peak(), 1500);
        pool.subtract(1500);
        assert_eq!(pool.used(), 0);
        assert_eq!(pool.peak(), 1500);
    }

    #[test]
    fn test_set_limit_ignores_zero() {
        let pool = MemoryPool::new();
        let before = pool.limit();
        assert_eq!(pool.set_limit(0), before);
        assert_eq!(pool.set_limit(123 << 20), 123 << 20);
    }

    #[test]
    fn test_large_page_allocation_round_trips() {
        let pool = MemoryPool::new();
        pool.set_large_pages(true);
        // Large enough that rounding up to 2 MiB passes the fit test.
        let buf = pool.alloc_buffer(15 << 20);
        assert_eq!(buf.as_ptr() as usize % frame_alignment(), 0);
        pool.free_buffer(buf);
    }
}
