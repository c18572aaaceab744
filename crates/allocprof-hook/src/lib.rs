//! Allocation hook for allocprof.
//!
//! This crate sits between the program's allocator and the allocprof
//! collector:
//! - **Interception**: [`ProfilingAllocator`] forwards to the C allocator
//!   (`malloc`, `calloc`, `realloc`, `free`) and offers every allocation to
//!   the sampler
//! - **Sampling**: byte-interval or fixed-ratio selection, configured with
//!   [`set_sampling`]
//! - **Hand-off**: sampled stacks are queued in [`GLOBAL_BUFFER`], which the
//!   collector drains with a blocking [`SampleBuffer::pop`]
//!
//! Install the allocator with the `profiler!` macro:
//! ```rust,ignore
//! allocprof_hook::profiler!();
//! ```
//!
//! Stacks are captured by walking frame pointers, so build with:
//! ```bash
//! RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release
//! ```
//!
//! Without the `sampling` feature the allocator is a plain passthrough.

mod buffer;
mod profiling;

pub use buffer::{BUFFER_CAPACITY, GLOBAL_BUFFER, MAX_STACK_DEPTH, RawSample, SampleBuffer};
pub use profiling::{
    SampleMode, capture_stack, disable_sampling, ignore_current_thread, sampling, set_sampling,
    should_sample,
};

use core::alloc::{GlobalAlloc, Layout};

/// Alignment guaranteed by `malloc` on the supported 64-bit targets
const MIN_ALIGN: usize = 16;

/// A sampling allocator on top of the C allocator.
///
/// Allocation events are only captured while a rate is configured through
/// [`set_sampling`] and [`GLOBAL_BUFFER`] is started.
pub struct ProfilingAllocator;

impl ProfilingAllocator {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for ProfilingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn fits_malloc(layout: &Layout) -> bool {
    layout.align() <= MIN_ALIGN && layout.align() <= layout.size()
}

unsafe fn aligned_malloc(layout: &Layout) -> *mut u8 {
    let mut out = core::ptr::null_mut();
    let align = layout.align().max(core::mem::size_of::<usize>());
    let ret = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
    if ret != 0 {
        core::ptr::null_mut()
    } else {
        out as *mut u8
    }
}

#[cfg(feature = "sampling")]
#[inline]
fn on_alloc(size: usize) {
    profiling::record_alloc(size);
}

#[cfg(not(feature = "sampling"))]
#[inline]
fn on_alloc(_size: usize) {}

unsafe impl GlobalAlloc for ProfilingAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = if fits_malloc(&layout) {
            unsafe { libc::malloc(layout.size()) as *mut u8 }
        } else {
            unsafe { aligned_malloc(&layout) }
        };
        if !ptr.is_null() {
            on_alloc(layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = if fits_malloc(&layout) {
            unsafe { libc::calloc(layout.size(), 1) as *mut u8 }
        } else {
            let ptr = unsafe { aligned_malloc(&layout) };
            if !ptr.is_null() {
                unsafe { core::ptr::write_bytes(ptr, 0, layout.size()) };
            }
            ptr
        };
        if !ptr.is_null() {
            on_alloc(layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { libc::free(ptr as *mut libc::c_void) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = if layout.align() <= MIN_ALIGN && layout.align() <= new_size {
            unsafe { libc::realloc(ptr as *mut libc::c_void, new_size) as *mut u8 }
        } else {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let new_ptr = unsafe { aligned_malloc(&new_layout) };
            if !new_ptr.is_null() {
                unsafe {
                    core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                    libc::free(ptr as *mut libc::c_void);
                }
            }
            new_ptr
        };
        if !new_ptr.is_null() {
            on_alloc(new_size);
        }
        new_ptr
    }
}

/// Install [`ProfilingAllocator`] as the global allocator.
///
/// ```rust,ignore
/// allocprof_hook::profiler!();
/// ```
#[macro_export]
macro_rules! profiler {
    () => {
        #[global_allocator]
        static __ALLOCPROF_ALLOC: $crate::ProfilingAllocator = $crate::ProfilingAllocator::new();
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_round_trip() {
        let _lock = profiling::tests::CONFIG_LOCK.lock().unwrap();
        disable_sampling();
        let alloc = ProfilingAllocator::new();
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = alloc.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            assert!((0..64).all(|i| *ptr.add(i) == 0));

            let grown = alloc.realloc(ptr, layout, 256);
            assert!(!grown.is_null());
            alloc.dealloc(grown, Layout::from_size_align(256, 8).unwrap());
        }
    }

    #[test]
    fn test_over_aligned_allocation() {
        let _lock = profiling::tests::CONFIG_LOCK.lock().unwrap();
        disable_sampling();
        let alloc = ProfilingAllocator::new();
        unsafe {
            let layout = Layout::from_size_align(100, 4096).unwrap();
            let ptr = alloc.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 4096, 0);

            let grown = alloc.realloc(ptr, layout, 8192);
            assert!(!grown.is_null());
            assert_eq!(grown as usize % 4096, 0);
            alloc.dealloc(grown, Layout::from_size_align(8192, 4096).unwrap());
        }
    }
}
