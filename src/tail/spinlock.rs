//! Multi-producer, spin-locking tail (spec.md §4.2.4): a single spin-lock
//! guards allocation, which then proceeds exactly as the single-producer
//! tail does. Grounded on the teacher's hand-rolled `GhostMutex` spin/park
//! state machine, simplified to pure spinning (never parks) since this
//! variant's whole purpose is low best-case latency over fairness.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::control::{ControlBlock, BUSY, DEAD, INVALID_NEXT_PAGE};
use crate::external::ByteAllocator;
use crate::page::PageAllocator;
use crate::progress::Progress;
use crate::tail::{end_control_block, fits_in_page, new_chained_page, pad_to_end, required_units, user_storage_addr, Allocation, Tail};

pub struct SpinlockTail<B: ByteAllocator> {
    page_allocator: Arc<PageAllocator>,
    byte_allocator: B,
    locked: AtomicBool,
    tail: UnsafeCell<*mut u8>,
    initial_page: usize,
}

unsafe impl<B: ByteAllocator> Sync for SpinlockTail<B> {}

impl<B: ByteAllocator> SpinlockTail<B> {
    pub fn new(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self> {
        let page = page_allocator.allocate_page(Progress::Blocking, false)?;
        let end_cb = unsafe { end_control_block(page) };
        unsafe { (*end_cb).next.store(INVALID_NEXT_PAGE, Ordering::Relaxed) };
        Some(Self { page_allocator, byte_allocator, locked: AtomicBool::new(false), tail: UnsafeCell::new(page), initial_page: page as usize })
    }

    /// Busy-waits until the lock is acquired, calling the default
    /// busy-wait functor (`crossbeam_utils::Backoff`, which spins then
    /// falls back to `std::thread::yield_now`) between attempts.
    fn lock(&self) {
        let backoff = Backoff::new();
        while self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<B: ByteAllocator> Tail for SpinlockTail<B> {
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
        unsafe { *self.tail.get() as usize }
    }

    fn initial_page_addr(&self) -> usize {
        self.initial_page
    }
}

impl<B: ByteAllocator> SpinlockTail<B> {
    fn allocate_slot(&self, progress: Progress, control_bits: usize, size: usize, alignment: usize, external: Option<crate::external::ExternalBlock>) -> Option<Allocation> {
        let units = required_units(size, alignment);

        self.lock();
        let result = loop {
            let cb_addr = unsafe { *self.tail.get() } as usize;
            let page = crate::tail::page_of(cb_addr);
            let end_addr = page as usize + crate::control::end_control_offset();
            let new_tail = cb_addr + units;

            if new_tail <= end_addr {
                unsafe { *self.tail.get() = new_tail as *mut u8 };
                let control_block = cb_addr as *mut ControlBlock;
                let storage = user_storage_addr(cb_addr, alignment) as *mut u8;
                let next_value = ControlBlock::pack(new_tail, control_bits | BUSY);
                unsafe { (*control_block).next.store(next_value, Ordering::Release) };
                break Some(Allocation { control_block, next_ptr_value: next_value, user_storage: storage, external });
            }

            unsafe { pad_to_end(cb_addr) };

            let next_page_addr = unsafe { (*end_control_block(page)).next.load(Ordering::Acquire) };
            if ControlBlock::is_invalid_next_page(next_page_addr) {
                match new_chained_page(&self.page_allocator, progress, false) {
                    Some(fresh) => {
                        unsafe { (*end_control_block(page)).next.store((fresh as usize) | DEAD, Ordering::Release) };
                        unsafe { *self.tail.get() = fresh };
                    }
                    None => break None,
                }
            } else {
                unsafe { *self.tail.get() = ControlBlock::pointer_of(next_page_addr) as *mut u8 };
            }
        };
        self.unlock();
        result
    }
}

impl<B: ByteAllocator> crate::queue::TailConstruct<B> for SpinlockTail<B> {
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
        let tail = SpinlockTail::new(page_allocator, SystemByteAllocator).unwrap();
        let allocation = tail.try_inplace_allocate(Progress::Blocking, 0, 8, 8).unwrap();
        assert!(ControlBlock::is_busy(allocation.next_ptr_value));
        tail.commit_put(&allocation);
    }
}
