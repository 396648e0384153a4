//! The System Page Source: an irreversible bump allocator over OS-mapped
//! regions. Pages handed out here are always fresh OS memory and therefore
//! always zero; nothing is ever returned to the OS except on `Drop`.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::page::region::{allocate_region, free_region};
use crate::progress::Progress;

/// Number of pages mapped per OS region. Amortizes the mmap/VirtualAlloc
/// syscall cost the way `BootstrapArena`/`SyscallPageAlloc` did for the
/// teacher's general-purpose allocator.
const REGION_PAGE_COUNT: usize = 32;

struct Arena {
    base: *mut u8,
    size: usize,
    cursor: AtomicUsize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// Supplies fresh, page-size/alignment OS memory. The fast path (bumping the
/// cursor within the current region) is wait-free; growing (mapping a new
/// region) takes a lock and is only attempted under `Progress::Blocking`.
pub struct SystemPageSource {
    page_size: usize,
    arena: AtomicPtr<Arena>,
    grow_lock: Mutex<()>,
    regions: Mutex<Vec<(*mut u8, usize)>>,
}

impl SystemPageSource {
    /// Creates a source that hands out pages of exactly `page_size` bytes
    /// (which must be a power of two and a multiple of the OS page size).
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            arena: AtomicPtr::new(std::ptr::null_mut()),
            grow_lock: Mutex::new(()),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Allocates one fresh page, honoring `progress`.
    ///
    /// Returns `None` if `progress` forbids blocking and no pre-mapped
    /// capacity remains, or if `progress` is `Blocking` and the OS itself
    /// refuses to grow the mapping.
    pub fn allocate_page(&self, progress: Progress) -> Option<*mut u8> {
        loop {
            let arena_ptr = self.arena.load(Ordering::Acquire);
            if !arena_ptr.is_null() {
                let arena = unsafe { &*arena_ptr };
                let offset = arena.cursor.fetch_add(self.page_size, Ordering::Relaxed);
                if offset + self.page_size <= arena.size {
                    return Some(unsafe { arena.base.add(offset) });
                }
                // This arena is exhausted (the fetch_add may have overshot by
                // a bounded amount from concurrent racers; that's fine, we
                // just fall through and try to grow).
            }

            if !progress.may_block() {
                return None;
            }

            if !self.grow(arena_ptr) {
                return None;
            }
        }
    }

    /// Maps a new region and installs it as the current arena, unless
    /// another thread already did so (observed via `expected` no longer
    /// matching). Returns `false` only on genuine OS allocation failure.
    fn grow(&self, expected: *mut Arena) -> bool {
        let _guard = self.grow_lock.lock().unwrap();

        // Someone else may have grown while we waited for the lock.
        if self.arena.load(Ordering::Acquire) != expected {
            return true;
        }

        let region_size = self.page_size * REGION_PAGE_COUNT;
        let (raw_base, raw_size, aligned_base) = match unsafe { allocate_region(region_size, self.page_size) } {
            Some(mapping) => mapping,
            None => {
                tracing::warn!(bytes = region_size, "OS region mapping failed, page source under pressure");
                return false;
            }
        };

        tracing::debug!(bytes = region_size, pages = REGION_PAGE_COUNT, "mapped new OS region");

        self.regions.lock().unwrap().push((raw_base, raw_size));

        let arena = Box::into_raw(Box::new(Arena {
            base: aligned_base,
            size: region_size,
            cursor: AtomicUsize::new(0),
        }));
        self.arena.store(arena, Ordering::Release);
        true
    }
}

impl Drop for SystemPageSource {
    fn drop(&mut self) {
        let arena_ptr = *self.arena.get_mut();
        if !arena_ptr.is_null() {
            drop(unsafe { Box::from_raw(arena_ptr) });
        }
        for (base, size) in self.regions.get_mut().unwrap().drain(..) {
            unsafe { free_region(base, size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_disjoint_pages() {
        let source = SystemPageSource::new(4096);
        let a = source.allocate_page(Progress::Blocking).unwrap();
        let b = source.allocate_page(Progress::Blocking).unwrap();
        assert_ne!(a, b);
        assert_eq!((a as usize) % 4096, 0);
        assert_eq!((b as usize) % 4096, 0);
    }

    #[test]
    fn wait_free_fails_past_region_capacity() {
        let source = SystemPageSource::new(4096);
        // Exhaust the first region with wait-free requests; the first
        // REGION_PAGE_COUNT should succeed (blocking to map), the very
        // first call must itself map (so use Blocking once to seed).
        assert!(source.allocate_page(Progress::Blocking).is_some());
        for _ in 1..REGION_PAGE_COUNT {
            assert!(source.allocate_page(Progress::WaitFree).is_some());
        }
        // Region now exhausted; a non-blocking request must fail.
        assert!(source.allocate_page(Progress::WaitFree).is_none());
        // A blocking request grows and succeeds.
        assert!(source.allocate_page(Progress::Blocking).is_some());
    }
}
