//! Multi-producer, relaxed-consistency tail (spec.md §4.2.2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::control::{ControlBlock, BUSY, DEAD, INVALID_NEXT_PAGE};
use crate::external::ByteAllocator;
use crate::page::PageAllocator;
use crate::progress::Progress;
use crate::tail::{end_control_block, fits_in_page, new_chained_page, required_units, user_storage_addr, Allocation, Tail};

pub struct RelaxedTail<B: ByteAllocator> {
    page_allocator: Arc<PageAllocator>,
    byte_allocator: B,
    tail: AtomicUsize,
    initial_page: usize,
}

impl<B: ByteAllocator> RelaxedTail<B> {
    pub fn new(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        let page = page_allocator.allocate_page(Progress::Blocking, true)?;
        let end_cb = unsafe { end_control_block(page) };
        unsafe { (*end_cb).next.store(INVALID_NEXT_PAGE, Ordering::Relaxed) };
        Some(Self { page_allocator, byte_allocator, tail: AtomicUsize::new(page as usize), initial_page: page as usize })
    }
}

impl<B: ByteAllocator> Tail for RelaxedTail<B> {
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
        self.tail.load(Ordering::Relaxed)
    }

    fn initial_page_addr(&self) -> usize {
        self.initial_page
    }
}

impl<B: ByteAllocator> RelaxedTail<B> {
    fn allocate_slot(&self, progress: Progress, control_bits: usize, size: usize, alignment: usize, external: Option<crate::external::ExternalBlock>) -> Option<Allocation> {
        let units = required_units(size, alignment);
        loop {
            let cb_addr = self.tail.load(Ordering::Relaxed);
            let page = crate::tail::page_of(cb_addr);
            let end_addr = page as usize + crate::control::end_control_offset();
            let new_tail = cb_addr + units;

            if new_tail <= end_addr {
                match self.tail.compare_exchange_weak(cb_addr, new_tail, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        let control_block = cb_addr as *mut ControlBlock;
                        let storage = user_storage_addr(cb_addr, alignment) as *mut u8;
                        let next_value = ControlBlock::pack(new_tail, control_bits | BUSY);
                        unsafe { (*control_block).next.store(next_value, Ordering::Release) };
                        return Some(Allocation { control_block, next_ptr_value: next_value, user_storage: storage, external });
                    }
                    Err(_) => {
                        if !progress.retries_on_contention() {
                            return None;
                        }
                        tracing::trace!(?progress, "relaxed tail CAS lost, retrying reservation");
                        continue;
                    }
                }
            }

            if !self.page_overflow(progress, cb_addr, page, end_addr) {
                if !progress.retries_on_contention() {
                    return None;
                }
            }
        }
    }

    /// Either pads the gap before the end-CB (another thread already
    /// chained a successor) or performs the chaining protocol itself.
    /// Returns `false` only when a wait-free caller should give up instead
    /// of retrying.
    fn page_overflow(&self, progress: Progress, observed_tail: usize, page: *mut u8, end_addr: usize) -> bool {
        if observed_tail < end_addr {
            // CAS-pad the gap with a DEAD link to the end-CB.
            let cb = observed_tail as *mut ControlBlock;
            let packed = ControlBlock::pack(end_addr, DEAD);
            if unsafe { (*cb).next.compare_exchange(0, packed, Ordering::Release, Ordering::Relaxed).is_ok() } {
                let _ = self.tail.compare_exchange(observed_tail, end_addr, Ordering::Relaxed, Ordering::Relaxed);
            }
            return true;
        }

        // Safe-pin the end-CB's page: pin, reread tail, bail if it moved.
        self.page_allocator.pin_page(page);
        if self.tail.load(Ordering::Relaxed) != observed_tail {
            self.page_allocator.unpin_page(page);
            return true;
        }

        let end_cb = unsafe { end_control_block(page) };
        let observed_next = unsafe { (*end_cb).next.load(Ordering::Acquire) };

        if !ControlBlock::is_invalid_next_page(observed_next) {
            // Someone already chained a successor; adopt it.
            let successor = ControlBlock::pointer_of(observed_next);
            let _ = self.tail.compare_exchange(observed_tail, successor, Ordering::Relaxed, Ordering::Relaxed);
            self.page_allocator.unpin_page(page);
            return true;
        }

        if !progress.may_block() && progress == Progress::WaitFree {
            self.page_allocator.unpin_page(page);
            return false;
        }

        let new_page = match new_chained_page(&self.page_allocator, progress, true) {
            Some(p) => p,
            None => {
                self.page_allocator.unpin_page(page);
                return false;
            }
        };

        let packed = ControlBlock::pack(new_page as usize, DEAD);
        match unsafe { (*end_cb).next.compare_exchange(INVALID_NEXT_PAGE, packed, Ordering::Release, Ordering::Relaxed) } {
            Ok(_) => {
                let _ = self.tail.compare_exchange(observed_tail, new_page as usize, Ordering::Relaxed, Ordering::Relaxed);
            }
            Err(observed) => {
                // Another producer chained first: discard our page.
                self.page_allocator.deallocate_page(new_page, true);
                let successor = ControlBlock::pointer_of(observed);
                let _ = self.tail.compare_exchange(observed_tail, successor, Ordering::Relaxed, Ordering::Relaxed);
            }
        }

        self.page_allocator.unpin_page(page);
        true
    }
}

impl<B: ByteAllocator> crate::queue::TailConstruct<B> for RelaxedTail<B> {
    fn new_tail(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        Self::new(page_allocator, byte_allocator)
    }
}
