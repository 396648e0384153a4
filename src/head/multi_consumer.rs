//! Multi-consumer head (spec.md §4.3.2): `head` is atomic, so several
//! consumers may race to claim the same ready control block — only one CAS
//! wins — and the commit-time cleanup sweep also advances `head` by CAS,
//! giving up (not a correctness problem) when another consumer has already
//! moved it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::control::{ControlBlock, BUSY};
use crate::external::ByteAllocator;
use crate::head::{free_external_if_any, maybe_reclaim_page, Consume, Head};
use crate::page::{PageAllocator, PinGuard};
use crate::tail::{page_of, Tail};

pub struct MultiConsumerHead<T: Tail, B: ByteAllocator> {
    page_allocator: Arc<PageAllocator>,
    byte_allocator: B,
    tail: Arc<T>,
    head: AtomicUsize,
}

impl<T: Tail, B: ByteAllocator> MultiConsumerHead<T, B> {
    pub fn new(page_allocator: Arc<PageAllocator>, byte_allocator: B, tail: Arc<T>) -> Self {
        let head = tail.initial_page_addr();
        Self { page_allocator, byte_allocator, tail, head: AtomicUsize::new(head) }
    }

    /// Advances `head` past one DEAD control block it currently names,
    /// reclaiming the page it leaves behind. Gives up silently on CAS
    /// failure: another consumer is already advancing past the same slot.
    fn try_advance_past(&self, head_addr: usize, next_addr: usize) -> bool {
        match self.head.compare_exchange(head_addr, next_addr, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                maybe_reclaim_page(&self.page_allocator, page_of(head_addr), page_of(next_addr));
                true
            }
            Err(_) => false,
        }
    }

    /// Continues the cleanup sweep from `addr` over any further already-DEAD
    /// control blocks, stopping at the first that isn't, or on lost CAS race.
    fn sweep_from(&self, mut addr: usize) {
        loop {
            let cb = addr as *mut ControlBlock;
            let raw = unsafe { (*cb).next.load(Ordering::Acquire) };
            if raw == 0 || !ControlBlock::is_dead(raw) {
                return;
            }
            let next_addr = ControlBlock::pointer_of(raw);
            if !self.try_advance_past(addr, next_addr) {
                return;
            }
            addr = next_addr;
        }
    }
}

impl<T: Tail, B: ByteAllocator> Head for MultiConsumerHead<T, B> {
    fn start_consume(&self) -> Option<Consume<'_>> {
        loop {
            let head_addr = self.head.load(Ordering::Acquire);

            // Safe-pin: pin the page head currently names, then confirm
            // head hasn't moved out from under us before trusting its CB.
            let page = page_of(head_addr);
            self.page_allocator.pin_page(page);
            if self.head.load(Ordering::Acquire) != head_addr {
                self.page_allocator.unpin_page(page);
                continue;
            }

            let cb = head_addr as *mut ControlBlock;
            let raw = unsafe { (*cb).next.load(Ordering::Acquire) };

            if raw == 0 {
                self.page_allocator.unpin_page(page);
                if head_addr == self.tail.current_tail_addr() {
                    return None;
                }
                std::hint::spin_loop();
                continue;
            }

            if ControlBlock::is_dead(raw) {
                let next_addr = ControlBlock::pointer_of(raw);
                self.try_advance_past(head_addr, next_addr);
                self.page_allocator.unpin_page(page);
                continue;
            }

            if ControlBlock::is_busy(raw) {
                self.page_allocator.unpin_page(page);
                return None;
            }

            let busy_value = raw | BUSY;
            match unsafe { (*cb).next.compare_exchange(raw, busy_value, Ordering::AcqRel, Ordering::Acquire) } {
                Ok(_) => {
                    // The pin acquired above now belongs to the returned
                    // Consume, protecting the page for as long as it lives.
                    return Some(Consume { control_block: cb, next_ptr_value: busy_value, pin: Some(PinGuard::adopt(&self.page_allocator, page)) });
                }
                Err(_) => {
                    self.page_allocator.unpin_page(page);
                    continue;
                }
            }
        }
    }

    fn commit_consume(&self, consume: Consume<'_>) {
        let cb = consume.control_block();
        let raw = consume.next_ptr_value();
        let dead_value = (raw & !BUSY) | crate::control::DEAD;
        unsafe { (*cb).next.store(dead_value, Ordering::Release) };
        free_external_if_any(cb, raw, &self.byte_allocator);

        let cb_addr = cb as usize;
        let head_addr = self.head.load(Ordering::Acquire);
        if head_addr == cb_addr {
            let next_addr = ControlBlock::pointer_of(dead_value);
            if self.try_advance_past(head_addr, next_addr) {
                self.sweep_from(next_addr);
            }
        }
        // `consume`'s pin drops here, unpinning this slot's page.
    }

    fn cancel_consume(&self, consume: Consume<'_>) {
        let cb = consume.control_block();
        let raw = consume.next_ptr_value();
        unsafe { (*cb).next.store(raw & !BUSY, Ordering::Release) };
    }

    fn is_queue_empty(&self) -> bool {
        let mut addr = self.head.load(Ordering::Acquire);
        loop {
            let raw = unsafe { (*(addr as *mut ControlBlock)).next.load(Ordering::Acquire) };
            if raw == 0 {
                return true;
            }
            if !ControlBlock::is_busy(raw) && !ControlBlock::is_dead(raw) {
                return false;
            }
            let next_addr = ControlBlock::pointer_of(raw);
            if next_addr == addr {
                return true;
            }
            addr = next_addr;
        }
    }

    fn current_head_addr(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }
}

impl<T: Tail, B: ByteAllocator> crate::queue::HeadConstruct<T, B> for MultiConsumerHead<T, B> {
    fn new_head(page_allocator: Arc<PageAllocator>, byte_allocator: B, tail: Arc<T>) -> Self {
        Self::new(page_allocator, byte_allocator, tail)
    }
}
