//! Raw OS region mapping, split by platform like the teacher's syscall module.
//!
//! `mmap`/`VirtualAlloc` only guarantee natural OS-page alignment, which can
//! be narrower than the `alignment` the caller actually needs (our pages are
//! much larger than 4KiB). Each platform's `allocate_region` therefore
//! over-allocates by `alignment` extra bytes and hands back both the raw
//! mapping (for freeing later, unrounded) and the `alignment`-rounded base a
//! caller can actually carve pages from.

fn align_up(addr: usize, alignment: usize) -> usize {
    (addr + alignment - 1) & !(alignment - 1)
}

#[cfg(unix)]
mod unix {
    use super::align_up;
    use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
    use std::ptr;

    /// Maps a fresh, zeroed region with at least `size` usable bytes
    /// starting at an `alignment`-aligned address. Returns
    /// `(raw_base, raw_size, aligned_base)`: `raw_base`/`raw_size` is the
    /// actual mapping, to be passed back to [`free_region`] unchanged;
    /// `aligned_base` is where the caller should start carving out
    /// `alignment`-aligned pages.
    ///
    /// # Safety
    /// `size` must be a multiple of the OS page size.
    pub unsafe fn allocate_region(size: usize, alignment: usize) -> Option<(*mut u8, usize, *mut u8)> {
        let raw_size = size + alignment;
        let ptr = mmap(
            ptr::null_mut(),
            raw_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == MAP_FAILED {
            None
        } else {
            let raw_base = ptr as *mut u8;
            let aligned_base = align_up(raw_base as usize, alignment) as *mut u8;
            Some((raw_base, raw_size, aligned_base))
        }
    }

    /// Unmaps a region previously returned by [`allocate_region`].
    ///
    /// # Safety
    /// `ptr`/`size` must be the exact `raw_base`/`raw_size` pair
    /// [`allocate_region`] returned.
    pub unsafe fn free_region(ptr: *mut u8, size: usize) {
        munmap(ptr as *mut c_void, size);
    }
}

#[cfg(windows)]
mod windows {
    use super::align_up;
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    /// Maps a fresh, zeroed region with at least `size` usable bytes
    /// starting at an `alignment`-aligned address. Returns
    /// `(raw_base, raw_size, aligned_base)`, as in the unix implementation.
    ///
    /// # Safety
    /// `size` must be a multiple of the OS allocation granularity.
    pub unsafe fn allocate_region(size: usize, alignment: usize) -> Option<(*mut u8, usize, *mut u8)> {
        let raw_size = size + alignment;
        let ptr = VirtualAlloc(ptr::null_mut(), raw_size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
        if ptr.is_null() {
            None
        } else {
            let raw_base = ptr as *mut u8;
            let aligned_base = align_up(raw_base as usize, alignment) as *mut u8;
            Some((raw_base, raw_size, aligned_base))
        }
    }

    /// Releases a region previously returned by [`allocate_region`].
    ///
    /// # Safety
    /// `ptr` must be the `raw_base` [`allocate_region`] returned.
    pub unsafe fn free_region(ptr: *mut u8, _size: usize) {
        // MEM_RELEASE requires size == 0; it frees the whole reservation,
        // keyed off the exact base VirtualAlloc returned.
        VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(unix)]
pub use unix::{allocate_region, free_region};
#[cfg(windows)]
pub use windows::{allocate_region, free_region};
