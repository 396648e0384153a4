//! The page footer: pin (hazard) count and free-list link, placed at the
//! tail of every page-sized block (see DESIGN.md decision 4).

use std::sync::atomic::{AtomicPtr, AtomicUsize};

/// Per-page metadata living just past the usable region.
#[repr(C)]
pub struct PageFooter {
    /// Hazard-style reference count. Non-zero means "do not reclaim".
    pub pin_count: AtomicUsize,
    /// Intrusive link used by the Page Allocator's free-page stacks.
    /// Points at the base of another page, or is null.
    pub free_link: AtomicPtr<u8>,
}

impl PageFooter {
    const fn new() -> Self {
        Self {
            pin_count: AtomicUsize::new(0),
            free_link: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// Total size of one page as handed out by the System Page Source: the
/// usable region plus the footer, page-aligned.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Bytes available to control blocks and elements. Per DESIGN.md decision 4
/// this mirrors `original_source`'s `page_size = page_alignment_and_size -
/// sizeof(PageFooter)`.
pub const USABLE_PAGE_SIZE: usize = PAGE_SIZE - std::mem::size_of::<PageFooter>();

/// Returns a pointer to the footer of the page based at `page`.
///
/// # Safety
/// `page` must be the base address of a page allocated by this crate's
/// Page Allocator (so that `page + USABLE_PAGE_SIZE` is in-bounds and
/// holds a live `PageFooter`).
#[inline]
pub unsafe fn footer_of(page: *mut u8) -> *mut PageFooter {
    page.add(USABLE_PAGE_SIZE).cast::<PageFooter>()
}

/// Writes a fresh, zero-pin-count footer at the end of `page`.
///
/// # Safety
/// `page` must point to a writable block of at least `PAGE_SIZE` bytes.
#[inline]
pub unsafe fn init_footer(page: *mut u8) {
    footer_of(page).write(PageFooter::new());
}
