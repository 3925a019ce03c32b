//! Allocation Tracking
//!
//! Install [`TrackingAllocator`] as the `#[global_allocator]` of the measured
//! binary to get per-unit allocation deltas:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: stagebench::TrackingAllocator = stagebench::TrackingAllocator;
//! ```
//!
//! Counters are process-wide and only ever increase; the engine reads a
//! snapshot before and after each unit and reports the difference.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static ALLOCATION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Counting wrapper around the system allocator
pub struct TrackingAllocator;

// SAFETY: every call is forwarded unchanged to `System`.
unsafe impl GlobalAlloc for TrackingAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        unsafe { System.alloc(layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        unsafe { System.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Only growth counts as newly allocated memory
        record(new_size.saturating_sub(layout.size()));
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[inline(always)]
fn record(bytes: usize) {
    ALLOCATED_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
    ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Cumulative allocation counters at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationSnapshot {
    /// Total bytes allocated so far
    pub bytes: u64,
    /// Total allocation calls so far
    pub count: u64,
}

impl AllocationSnapshot {
    /// Read the current counters.
    #[inline]
    pub fn now() -> Self {
        Self {
            bytes: ALLOCATED_BYTES.load(Ordering::Relaxed),
            count: ALLOCATION_COUNT.load(Ordering::Relaxed),
        }
    }

    /// Bytes and calls between `earlier` and `self`.
    #[inline]
    pub fn since(&self, earlier: &AllocationSnapshot) -> (u64, u64) {
        (
            self.bytes.saturating_sub(earlier.bytes),
            self.count.saturating_sub(earlier.count),
        )
    }
}
