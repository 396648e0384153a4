//! The Page Allocator: per-thread free-page caches over the System Page
//! Source, plus hazard-style pin/unpin (spec.md §4.1).

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::page::footer::{footer_of, init_footer, PAGE_SIZE, USABLE_PAGE_SIZE};
use crate::page::source::SystemPageSource;
use crate::progress::Progress;

/// Size of the per-thread slot ring (spec.md §4.1: "a fixed small ring of
/// slots (e.g. 8)").
const SLOT_COUNT: usize = 8;

/// Low bits of a page address are free for an ABA counter because pages are
/// `PAGE_SIZE`-aligned.
const TAG_BITS: u32 = PAGE_SIZE.trailing_zeros();
const TAG_MASK: usize = (1usize << TAG_BITS) - 1;

#[inline]
fn pack(page: *mut u8, tag: usize) -> usize {
    (page as usize) | (tag & TAG_MASK)
}

#[inline]
fn unpack(value: usize) -> (*mut u8, usize) {
    ((value & !TAG_MASK) as *mut u8, value & TAG_MASK)
}

/// A lock-free Treiber stack of free pages, linked through each page's own
/// footer (`PageFooter::free_link`). Adapted from
/// `alloc::segregated::freelist::BrandedFreelist`'s tagged-pointer push/pop,
/// generalized from a 48-bit-pointer/ABA-tag split to the page-alignment
/// slack this crate actually has available.
struct FreeStack {
    head: AtomicUsize,
}

impl FreeStack {
    const fn new() -> Self {
        Self { head: AtomicUsize::new(0) }
    }

    fn push(&self, page: *mut u8) {
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (top, tag) = unpack(current);
            unsafe { (*footer_of(page)).free_link.store(top, Ordering::Relaxed) };
            let new = pack(page, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(current, new, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pushes an already-linked chain `head ..= tail` (via `free_link`) in a
    /// single CAS, for stealing rebalance.
    fn push_chain(&self, head: *mut u8, tail: *mut u8) {
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (top, tag) = unpack(current);
            unsafe { (*footer_of(tail)).free_link.store(top, Ordering::Relaxed) };
            let new = pack(head, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(current, new, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn pop(&self) -> Option<*mut u8> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (top, tag) = unpack(current);
            if top.is_null() {
                return None;
            }
            let next = unsafe { (*footer_of(top)).free_link.load(Ordering::Relaxed) };
            let new = pack(next, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(top),
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically empties the whole stack, returning its former head (or
    /// null). Used by work-stealing.
    fn take_all(&self) -> *mut u8 {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (top, tag) = unpack(current);
            if top.is_null() {
                return ptr::null_mut();
            }
            let new = pack(ptr::null_mut(), tag.wrapping_add(1));
            match self.head.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return top,
                Err(actual) => current = actual,
            }
        }
    }
}

unsafe impl Send for FreeStack {}
unsafe impl Sync for FreeStack {}

struct Slot {
    zeroed: FreeStack,
    dirty: FreeStack,
}

impl Slot {
    const fn new() -> Self {
        Self { zeroed: FreeStack::new(), dirty: FreeStack::new() }
    }

    fn stack(&self, zeroed: bool) -> &FreeStack {
        if zeroed {
            &self.zeroed
        } else {
            &self.dirty
        }
    }
}

thread_local! {
    static HOME_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
    static VICTIM_CURSOR: Cell<usize> = const { Cell::new(0) };
}

fn home_slot_index() -> usize {
    HOME_SLOT.with(|cell| {
        if let Some(i) = cell.get() {
            return i;
        }
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let i = (hasher.finish() as usize) % SLOT_COUNT;
        cell.set(Some(i));
        i
    })
}

fn next_victim() -> usize {
    VICTIM_CURSOR.with(|cell| {
        let i = cell.get();
        cell.set((i + 1) % SLOT_COUNT);
        i
    })
}

/// Supplies fixed-size pages with O(1) amortized cost under any of the four
/// progress guarantees, and exposes `pin_page`/`unpin_page` so any thread
/// can guarantee a page's content is not altered while it holds a pin.
pub struct PageAllocator {
    slots: Box<[Slot; SLOT_COUNT]>,
    source: SystemPageSource,
}

impl PageAllocator {
    /// Creates a new allocator backed by its own System Page Source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Box::new(std::array::from_fn(|_| Slot::new())),
            source: SystemPageSource::new(PAGE_SIZE),
        }
    }

    /// Allocates one page, initializing its footer. If `zeroed` is `true`
    /// the usable region is guaranteed to be all-zero on return.
    pub fn allocate_page(&self, progress: Progress, zeroed: bool) -> Option<*mut u8> {
        let home = &self.slots[home_slot_index()];

        if let Some(page) = home.stack(zeroed).pop() {
            return Some(page);
        }

        // If we need a zeroed page but only dirty ones are cached locally,
        // and the guarantee permits the O(page size) zeroing work, recycle
        // a dirty page instead of mapping fresh memory.
        if zeroed && progress != Progress::WaitFree {
            if let Some(page) = home.stack(false).pop() {
                unsafe { ptr::write_bytes(page, 0, USABLE_PAGE_SIZE) };
                unsafe { init_footer(page) };
                return Some(page);
            }
        }

        // Work-steal: take a victim slot's whole stack of the requested
        // kind, keep one page, push the rest into our home slot.
        for _ in 0..SLOT_COUNT {
            let victim = &self.slots[next_victim()];
            let stolen = victim.stack(zeroed).take_all();
            if !stolen.is_null() {
                let rest = unsafe { (*footer_of(stolen)).free_link.swap(ptr::null_mut(), Ordering::Relaxed) };
                if !rest.is_null() {
                    let tail = chain_tail(rest);
                    home.stack(zeroed).push_chain(rest, tail);
                }
                return Some(stolen);
            }
        }

        // Wait-free: ask the System Page Source for a pre-mapped page. OS
        // memory is always zero, so this satisfies either request.
        if let Some(page) = self.source.allocate_page(Progress::WaitFree) {
            unsafe { init_footer(page) };
            return Some(page);
        }

        if progress.may_block() {
            if let Some(page) = self.source.allocate_page(Progress::Blocking) {
                unsafe { init_footer(page) };
                return Some(page);
            }
            tracing::warn!("blocking page allocation failed: OS refused to grow the mapping");
            return None;
        }

        // The arena is exhausted and this guarantee forbids blocking to
        // grow it: exactly the condition `PagePressure` names.
        let pressure = crate::error::PagePressure;
        tracing::debug!(error = %pressure, ?progress, "page allocator cannot satisfy request without blocking");
        None
    }

    /// Returns `page` to this allocator's caches. Wait-free.
    pub fn deallocate_page(&self, page: *mut u8, zeroed: bool) {
        self.slots[home_slot_index()].stack(zeroed).push(page);
    }

    /// Increments `page`'s pin (hazard) count. Lock-free.
    pub fn pin_page(&self, page: *mut u8) {
        unsafe { (*footer_of(page)).pin_count.fetch_add(1, Ordering::Acquire) };
    }

    /// Decrements `page`'s pin count. Lock-free.
    ///
    /// # Panics
    /// In debug builds, panics if the pin count was already zero.
    pub fn unpin_page(&self, page: *mut u8) {
        let prev = unsafe { (*footer_of(page)).pin_count.fetch_sub(1, Ordering::AcqRel) };
        debug_assert!(prev > 0, "unpin of a page with zero pin count");
    }

    /// Attempts to pin `page` with a single CAS, reporting failure rather
    /// than retrying (wait-free).
    pub fn try_pin_page(&self, page: *mut u8) -> bool {
        unsafe {
            let footer = footer_of(page);
            let current = (*footer).pin_count.load(Ordering::Relaxed);
            (*footer).pin_count.compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed).is_ok()
        }
    }

    /// Diagnostic-only relaxed read of a page's pin count.
    #[must_use]
    pub fn get_pin_count(&self, page: *mut u8) -> usize {
        unsafe { (*footer_of(page)).pin_count.load(Ordering::Relaxed) }
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a `free_link` chain to find its tail, for `push_chain`.
fn chain_tail(mut page: *mut u8) -> *mut u8 {
    loop {
        let next = unsafe { (*footer_of(page)).free_link.load(Ordering::Relaxed) };
        if next.is_null() {
            return page;
        }
        page = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_dealloc_roundtrip() {
        let alloc = PageAllocator::new();
        let page = alloc.allocate_page(Progress::Blocking, false).unwrap();
        assert_eq!(alloc.get_pin_count(page), 0);
        alloc.deallocate_page(page, false);
        let page2 = alloc.allocate_page(Progress::Blocking, false).unwrap();
        assert_eq!(page, page2);
    }

    #[test]
    fn zeroed_request_is_actually_zero() {
        let alloc = PageAllocator::new();
        let page = alloc.allocate_page(Progress::Blocking, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(page, USABLE_PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        unsafe { page.write(0xAB) };
        alloc.deallocate_page(page, false);

        let recycled = alloc.allocate_page(Progress::Blocking, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(recycled, USABLE_PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn pin_unpin_and_try_pin() {
        let alloc = PageAllocator::new();
        let page = alloc.allocate_page(Progress::Blocking, false).unwrap();
        alloc.pin_page(page);
        assert_eq!(alloc.get_pin_count(page), 1);
        assert!(alloc.try_pin_page(page));
        assert_eq!(alloc.get_pin_count(page), 2);
        alloc.unpin_page(page);
        alloc.unpin_page(page);
        assert_eq!(alloc.get_pin_count(page), 0);
    }
}
