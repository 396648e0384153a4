//! Single-producer tail (spec.md §4.2.1): a plain pointer, no contention on
//! the producer side at all.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::control::{ControlBlock, BUSY, DEAD};
use crate::external::ByteAllocator;
use crate::page::PageAllocator;
use crate::progress::Progress;
use crate::tail::{end_control_block, fits_in_page, new_chained_page, pad_to_end, required_units, user_storage_addr, Allocation, Tail};

/// A tail with exactly one producer. `tail` is an ordinary `Cell`, not an
/// atomic: correctness relies on the caller's contract that only one
/// thread ever calls into this type.
pub struct SingleProducerTail<B: ByteAllocator> {
    page_allocator: Arc<PageAllocator>,
    byte_allocator: B,
    tail: Cell<*mut u8>,
    initial_page: usize,
}

// Safety: the single-producer contract means only one thread at a time
// actually calls the producer-side methods; the type is `Send` so it can
// be handed to whichever thread is the producer, and `Sync` so it can sit
// behind a shared `Queue` alongside a head that may live on another
// thread, mirroring how `SizeClassManager` shares branded state across a
// `'brand`-scoped pair of owners.
unsafe impl<B: ByteAllocator> Send for SingleProducerTail<B> {}
unsafe impl<B: ByteAllocator> Sync for SingleProducerTail<B> {}

impl<B: ByteAllocator> SingleProducerTail<B> {
    pub fn new(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        let page = page_allocator.allocate_page(Progress::Blocking, false)?;
        let end_cb = unsafe { end_control_block(page) };
        unsafe { (*end_cb).next.store(crate::control::INVALID_NEXT_PAGE, Ordering::Relaxed) };
        Some(Self { page_allocator, byte_allocator, tail: Cell::new(page), initial_page: page as usize })
    }

    #[must_use]
    pub fn tail_ptr(&self) -> *mut u8 {
        self.tail.get()
    }
}

impl<B: ByteAllocator> Tail for SingleProducerTail<B> {
    fn try_inplace_allocate(&self, progress: Progress, control_bits: usize, size: usize, alignment: usize) -> Option<Allocation> {
        if !fits_in_page(size, alignment) {
            let external = crate::tail::external_allocate(&self.byte_allocator, size, alignment)?;
            return self.allocate_slot(progress, control_bits | crate::control::EXTERNAL, std::mem::size_of::<crate::external::ExternalBlock>(), std::mem::align_of::<crate::external::ExternalBlock>(), Some(external));
        }
        self.allocate_slot(progress, control_bits, size, alignment, None)
    }

    fn commit_put(&self, allocation: &Allocation) {
        unsafe {
            (*allocation.control_block).next.store(allocation.next_ptr_value & !BUSY, Ordering::Release);
        }
    }

    fn cancel_put(&self, allocation: &Allocation, destroy: impl FnOnce(*mut u8)) {
        destroy(allocation.payload_ptr());
        if let Some(external) = &allocation.external {
            unsafe { external.deallocate(&self.byte_allocator) };
        }
        self.cancel_put_nodestroy(allocation);
    }

    fn cancel_put_nodestroy(&self, allocation: &Allocation) {
        unsafe {
            (*allocation.control_block).next.store((allocation.next_ptr_value & !BUSY) | DEAD, Ordering::Release);
        }
    }

    fn current_tail_addr(&self) -> usize {
        self.tail.get() as usize
    }

    fn initial_page_addr(&self) -> usize {
        self.initial_page
    }
}

impl<B: ByteAllocator> SingleProducerTail<B> {
    fn allocate_slot(&self, progress: Progress, control_bits: usize, size: usize, alignment: usize, external: Option<crate::external::ExternalBlock>) -> Option<Allocation> {
        let units = required_units(size, alignment);
        loop {
            let cb_addr = self.tail.get() as usize;
            let page = crate::tail::page_of(cb_addr);
            let end_offset = crate::control::end_control_offset();
            let end_addr = page as usize + end_offset;
            let new_tail = cb_addr + units;

            if new_tail <= end_addr {
                self.tail.set(new_tail as *mut u8);
                let control_block = cb_addr as *mut ControlBlock;
                let storage = user_storage_addr(cb_addr, alignment) as *mut u8;
                let next_value = ControlBlock::pack(new_tail, control_bits | BUSY);
                unsafe { (*control_block).next.store(next_value, Ordering::Release) };
                return Some(Allocation { control_block, next_ptr_value: next_value, user_storage: storage, external });
            }

            // Doesn't fit: pad to the end-CB and advance to a new page.
            unsafe { pad_to_end(cb_addr) };

            let next_page_addr = unsafe { (*end_control_block(page)).next.load(Ordering::Acquire) };
            let next_page = crate::control::ControlBlock::pointer_of(next_page_addr);
            if crate::control::ControlBlock::is_invalid_next_page(next_page_addr) {
                let fresh = new_chained_page(&self.page_allocator, progress, false)?;
                unsafe {
                    (*end_control_block(page)).next.store((fresh as usize) | DEAD, Ordering::Release);
                }
                self.tail.set(fresh);
            } else {
                self.tail.set(next_page as *mut u8);
            }
        }
    }
}

impl<B: ByteAllocator> crate::queue::TailConstruct<B> for SingleProducerTail<B> {
    fn new_tail(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        Self::new(page_allocator, byte_allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::SystemByteAllocator;

    #[test]
    fn allocate_commit_roundtrip() {
        let page_allocator = Arc::new(PageAllocator::new());
        let tail = SingleProducerTail::new(page_allocator, SystemByteAllocator).unwrap();
        let allocation = tail.try_inplace_allocate(Progress::Blocking, 0, 8, 8).unwrap();
        assert!(ControlBlock::is_busy(allocation.next_ptr_value));
        tail.commit_put(&allocation);
    }

    #[test]
    fn chains_a_new_page_when_one_fills() {
        let page_allocator = Arc::new(PageAllocator::new());
        let tail = SingleProducerTail::new(page_allocator, SystemByteAllocator).unwrap();
        let initial_page = tail.initial_page_addr();
        loop {
            let allocation = tail.try_inplace_allocate(Progress::Blocking, 0, 64, 8).unwrap();
            tail.commit_put(&allocation);
            if crate::tail::page_of(tail.current_tail_addr()) as usize != initial_page {
                break;
            }
        }
    }
}
