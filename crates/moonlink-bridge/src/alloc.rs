//! Host-supplied allocators for interpreter memory.
//!
//! The engine sees a single `lua_Alloc` trampoline; the allocator itself is a
//! boxed trait object owned by the instance and freed after the state closes.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use moonlink_sys as ffi;

use crate::error::{BridgeErrorKind, BridgeResult};

const ALIGN: usize = 16;

/// Memory source for one interpreter instance.
///
/// Follows the `lua_Alloc` contract: `new_size == 0` frees `ptr` and returns
/// null; a null `ptr` allocates; otherwise reallocate. Returning null for a
/// non-zero request makes the engine raise a memory error.
pub trait Allocator {
    /// # Safety
    /// `ptr` is null or was returned by this allocator with size `old_size`.
    unsafe fn reallocate(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    unsafe fn reallocate(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            if !ptr.is_null() && old_size != 0 {
                unsafe { alloc::dealloc(ptr, layout(old_size)) };
            }
            return ptr::null_mut();
        }
        if ptr.is_null() || old_size == 0 {
            return unsafe { alloc::alloc(layout(new_size)) };
        }
        unsafe { alloc::realloc(ptr, layout(old_size), new_size) }
    }
}

fn layout(size: usize) -> Layout {
    // size is non-zero and far below isize::MAX for anything the engine asks
    Layout::from_size_align(size, ALIGN).unwrap_or(Layout::new::<u8>())
}

/// Wraps [`SystemAllocator`] with a byte budget. Growth past the budget fails;
/// shrinking and freeing always succeed.
#[derive(Debug)]
pub struct LimitedAllocator {
    limit: usize,
    used: AtomicUsize,
}

impl LimitedAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl Allocator for LimitedAllocator {
    unsafe fn reallocate(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        let old_size = if ptr.is_null() { 0 } else { old_size };
        if new_size > old_size {
            let grow = new_size - old_size;
            if self.used().saturating_add(grow) > self.limit {
                return ptr::null_mut();
            }
        }
        let out = unsafe { SystemAllocator.reallocate(ptr, old_size, new_size) };
        if new_size == 0 || !out.is_null() {
            if new_size >= old_size {
                self.used.fetch_add(new_size - old_size, Ordering::Relaxed);
            } else {
                self.used.fetch_sub(old_size - new_size, Ordering::Relaxed);
            }
        }
        out
    }
}

/// Owns the boxed allocator handed to the engine as `ud`.
pub(crate) struct AllocatorHandle(NonNull<Box<dyn Allocator>>);

impl AllocatorHandle {
    /// Create a state whose memory comes from `allocator`.
    pub(crate) fn new_state(
        allocator: Box<dyn Allocator>,
    ) -> BridgeResult<(*mut ffi::lua_State, AllocatorHandle)> {
        let raw = Box::into_raw(Box::new(allocator));
        // SAFETY: `raw` came from Box::into_raw just above.
        let handle = AllocatorHandle(unsafe { NonNull::new_unchecked(raw) });
        let l = unsafe { ffi::lua_newstate(forward_alloc, raw.cast()) };
        if l.is_null() {
            return Err(BridgeErrorKind::StateCreation.into());
        }
        Ok((l, handle))
    }
}

impl Drop for AllocatorHandle {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

unsafe extern "C" fn forward_alloc(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let allocator = unsafe { &*ud.cast::<Box<dyn Allocator>>() };
    unsafe { allocator.reallocate(ptr.cast(), osize, nsize) }.cast()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_allocator_refuses_growth_past_budget() {
        let allocator = LimitedAllocator::new(64);
        unsafe {
            let a = allocator.reallocate(ptr::null_mut(), 0, 48);
            assert!(!a.is_null());
            assert_eq!(allocator.used(), 48);

            assert!(allocator.reallocate(ptr::null_mut(), 0, 32).is_null());
            assert_eq!(allocator.used(), 48);

            let a = allocator.reallocate(a, 48, 16);
            assert!(!a.is_null());
            assert_eq!(allocator.used(), 16);

            assert!(allocator.reallocate(a, 16, 0).is_null());
            assert_eq!(allocator.used(), 0);
        }
    }

    #[test]
    fn test_system_allocator_is_aligned() {
        unsafe {
            let p = SystemAllocator.reallocate(ptr::null_mut(), 0, 24);
            assert_eq!(p as usize % ALIGN, 0);
            let p = SystemAllocator.reallocate(p, 24, 4096);
            assert_eq!(p as usize % ALIGN, 0);
            SystemAllocator.reallocate(p, 4096, 0);
        }
    }
}
