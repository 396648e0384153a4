//! Multi-producer, sequentially-consistent tail (spec.md §4.2.3).
//!
//! `tail`'s low bits, while a reservation is mid-flight, hold a granule
//! *count* added directly to the granule-aligned clean tail rather than a
//! byte length — the same trick `ControlBlock::pack` uses for state flags,
//! reusing bits that are otherwise always zero. Any thread that observes a
//! non-aligned tail can recover both the stalled producer's control block
//! address and how many granules it claimed, and finish publishing for it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::control::{ControlBlock, BUSY, DEAD, GRANULE, INVALID_NEXT_PAGE};
use crate::external::ByteAllocator;
use crate::page::PageAllocator;
use crate::progress::Progress;
use crate::tail::{end_control_block, fits_in_page, new_chained_page, user_storage_addr, Allocation, Tail, MIN_ALIGNMENT};

pub struct SeqCstTail<B: ByteAllocator> {
    page_allocator: Arc<PageAllocator>,
    byte_allocator: B,
    tail: AtomicUsize,
    initial_page: usize,
}

impl<B: ByteAllocator> SeqCstTail<B> {
    pub fn new(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        let page = page_allocator.allocate_page(Progress::Blocking, true)?;
        let end_cb = unsafe { end_control_block(page) };
        unsafe { (*end_cb).next.store(INVALID_NEXT_PAGE, Ordering::Relaxed) };
        Some(Self { page_allocator, byte_allocator, tail: AtomicUsize::new(page as usize), initial_page: page as usize })
    }

    /// Number of whole granules a slot of `size`/`alignment` needs,
    /// including its control block and worst-case alignment padding. Must
    /// stay below `GRANULE` so it fits in the bits a transient tail value
    /// borrows.
    fn required_units(size: usize, alignment: usize) -> usize {
        let alignment = alignment.max(MIN_ALIGNMENT);
        let padding = alignment.saturating_sub(GRANULE);
        let required_size = std::mem::size_of::<ControlBlock>() + padding + size;
        (required_size + GRANULE - 1) / GRANULE
    }
}

impl<B: ByteAllocator> Tail for SeqCstTail<B> {
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
        self.tail.load(Ordering::Relaxed) & !(GRANULE - 1)
    }

    fn initial_page_addr(&self) -> usize {
        self.initial_page
    }
}

impl<B: ByteAllocator> SeqCstTail<B> {
    fn allocate_slot(&self, progress: Progress, control_bits: usize, size: usize, alignment: usize, external: Option<crate::external::ExternalBlock>) -> Option<Allocation> {
        let required_units = Self::required_units(size, alignment);
        debug_assert!(required_units < GRANULE, "reservation too large for the seq-cst tail's transient encoding");

        let mut tail_val = self.tail.load(Ordering::Relaxed);
        loop {
            let rest = tail_val & (GRANULE - 1);

            if rest == 0 {
                let clean_tail = tail_val;
                let page = crate::tail::page_of(clean_tail);
                let end_addr = page as usize + crate::control::end_control_offset();
                let future_tail = clean_tail + required_units * GRANULE;

                if future_tail > end_addr {
                    match self.page_overflow(progress, clean_tail, page, end_addr) {
                        Some(updated) => {
                            tail_val = updated;
                            continue;
                        }
                        None => return None,
                    }
                }

                let transient = clean_tail + required_units;
                match self.tail.compare_exchange_weak(clean_tail, transient, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        let control_block = clean_tail as *mut ControlBlock;
                        let next_value = ControlBlock::pack(future_tail, control_bits | BUSY);
                        unsafe { (*control_block).next.store(next_value, Ordering::Release) };
                        let _ = self.tail.compare_exchange(transient, future_tail, Ordering::Relaxed, Ordering::Relaxed);
                        let storage = user_storage_addr(clean_tail, alignment) as *mut u8;
                        return Some(Allocation { control_block, next_ptr_value: next_value, user_storage: storage, external });
                    }
                    Err(actual) => {
                        if !progress.retries_on_contention() {
                            return None;
                        }
                        tracing::trace!(?progress, "seq-cst tail CAS lost, retrying reservation");
                        tail_val = actual;
                    }
                }
            } else {
                // Pinning to help is itself not wait-free.
                if progress == Progress::WaitFree {
                    return None;
                }

                let clean_tail = tail_val - rest;
                let page = crate::tail::page_of(clean_tail);
                self.page_allocator.pin_page(page);

                let current = self.tail.load(Ordering::Relaxed);
                if current != tail_val {
                    self.page_allocator.unpin_page(page);
                    tail_val = current;
                    continue;
                }

                let next = clean_tail + rest * GRANULE;
                let incomplete = clean_tail as *mut ControlBlock;
                let placeholder = ControlBlock::pack(next, BUSY);
                let _ = unsafe { (*incomplete).next.compare_exchange(0, placeholder, Ordering::Release, Ordering::Acquire) };
                let _ = self.tail.compare_exchange(tail_val, next, Ordering::Relaxed, Ordering::Relaxed);

                self.page_allocator.unpin_page(page);
                tail_val = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Mirrors `RelaxedTail::page_overflow`, but padding/chaining is
    /// expressed in granule counts to stay consistent with the helping
    /// protocol above. Returns the tail value to retry with, or `None` to
    /// give up under a guarantee that forbids it.
    fn page_overflow(&self, progress: Progress, observed_tail: usize, page: *mut u8, end_addr: usize) -> Option<usize> {
        if progress == Progress::WaitFree {
            return None;
        }

        if observed_tail < end_addr {
            let gap_units = ((end_addr - observed_tail) / GRANULE).min(GRANULE - 1);
            let transient = observed_tail + gap_units;
            let future_tail = observed_tail + gap_units * GRANULE;
            match self.tail.compare_exchange_weak(observed_tail, transient, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => {
                    let block = observed_tail as *mut ControlBlock;
                    unsafe { (*block).next.store(ControlBlock::pack(future_tail, DEAD), Ordering::Release) };
                    let _ = self.tail.compare_exchange(transient, future_tail, Ordering::Relaxed, Ordering::Relaxed);
                    Some(future_tail)
                }
                Err(actual) => Some(actual),
            }
        } else {
            self.page_allocator.pin_page(page);
            if self.tail.load(Ordering::Relaxed) != observed_tail {
                let updated = self.tail.load(Ordering::Relaxed);
                self.page_allocator.unpin_page(page);
                return Some(updated);
            }

            let end_cb = unsafe { end_control_block(page) };
            let observed_next = unsafe { (*end_cb).next.load(Ordering::Acquire) };

            let result = if !ControlBlock::is_invalid_next_page(observed_next) {
                ControlBlock::pointer_of(observed_next)
            } else {
                match new_chained_page(&self.page_allocator, progress, true) {
                    Some(new_page) => {
                        let packed = ControlBlock::pack(new_page as usize, DEAD);
                        match unsafe { (*end_cb).next.compare_exchange(INVALID_NEXT_PAGE, packed, Ordering::Release, Ordering::Relaxed) } {
                            Ok(_) => new_page as usize,
                            Err(observed) => {
                                self.page_allocator.deallocate_page(new_page, true);
                                ControlBlock::pointer_of(observed)
                            }
                        }
                    }
                    None => {
                        self.page_allocator.unpin_page(page);
                        return None;
                    }
                }
            };

            let _ = self.tail.compare_exchange(observed_tail, result, Ordering::Relaxed, Ordering::Relaxed);
            self.page_allocator.unpin_page(page);
            Some(result)
        }
    }
}

impl<B: ByteAllocator> crate::queue::TailConstruct<B> for SeqCstTail<B> {
    fn new_tail(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        Self::new(page_allocator, byte_allocator)
    }
}
