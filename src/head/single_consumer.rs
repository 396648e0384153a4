//! Single-consumer head (spec.md §4.3.1): a plain pointer, external-block
//! and page reclamation happen inline as head crosses them.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::control::{ControlBlock, BUSY};
use crate::external::ByteAllocator;
use crate::head::{free_external_if_any, maybe_reclaim_page, Consume, Head};
use crate::page::PageAllocator;
use crate::tail::{page_of, Tail};

pub struct SingleConsumerHead<T: Tail, B: ByteAllocator> {
    page_allocator: Arc<PageAllocator>,
    byte_allocator: B,
    tail: Arc<T>,
    head: Cell<*mut u8>,
}

unsafe impl<T: Tail, B: ByteAllocator> Send for SingleConsumerHead<T, B> {}
unsafe impl<T: Tail, B: ByteAllocator> Sync for SingleConsumerHead<T, B> {}

impl<T: Tail, B: ByteAllocator> SingleConsumerHead<T, B> {
    pub fn new(page_allocator: Arc<PageAllocator>, byte_allocator: B, tail: Arc<T>) -> Self {
        let head = tail.initial_page_addr() as *mut u8;
        Self { page_allocator, byte_allocator, tail, head: Cell::new(head) }
    }

    /// Advances `head` over a contiguous run of DEAD control blocks,
    /// reclaiming each crossed page. Stops at the first non-DEAD slot, or
    /// at a not-yet-initialized (`next == 0`) slot.
    fn skip_dead_prefix(&self) {
        loop {
            let head_addr = self.head.get() as usize;
            let cb = head_addr as *mut ControlBlock;
            let raw = unsafe { (*cb).next.load(Ordering::Acquire) };
            if raw == 0 || !ControlBlock::is_dead(raw) {
                return;
            }
            let next_addr = ControlBlock::pointer_of(raw);
            maybe_reclaim_page(&self.page_allocator, page_of(head_addr), page_of(next_addr));
            self.head.set(next_addr as *mut u8);
        }
    }
}

impl<T: Tail, B: ByteAllocator> Head for SingleConsumerHead<T, B> {
    fn start_consume(&self) -> Option<Consume<'_>> {
        loop {
            self.skip_dead_prefix();
            let head_addr = self.head.get() as usize;
            let cb = head_addr as *mut ControlBlock;
            let raw = unsafe { (*cb).next.load(Ordering::Acquire) };

            if raw == 0 {
                if head_addr == self.tail.current_tail_addr() {
                    return None;
                }
                std::hint::spin_loop();
                continue;
            }

            if ControlBlock::is_busy(raw) {
                return None;
            }

            debug_assert!(!ControlBlock::is_dead(raw), "dead prefix should already be skipped");

            let busy_value = raw | BUSY;
            unsafe { (*cb).next.store(busy_value, Ordering::Release) };
            return Some(Consume { control_block: cb, next_ptr_value: busy_value, pin: None });
        }
    }

    fn commit_consume(&self, consume: Consume<'_>) {
        let cb = consume.control_block;
        let raw = consume.next_ptr_value;
        let dead_value = (raw & !BUSY) | crate::control::DEAD;
        unsafe { (*cb).next.store(dead_value, Ordering::Release) };
        free_external_if_any(cb, raw, &self.byte_allocator);
        self.skip_dead_prefix();
    }

    fn cancel_consume(&self, consume: Consume<'_>) {
        let cb = consume.control_block;
        unsafe { (*cb).next.store(consume.next_ptr_value & !BUSY, Ordering::Release) };
    }

    fn is_queue_empty(&self) -> bool {
        let mut addr = self.head.get() as usize;
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
        self.head.get() as usize
    }
}

impl<T: Tail, B: ByteAllocator> crate::queue::HeadConstruct<T, B> for SingleConsumerHead<T, B> {
    fn new_head(page_allocator: Arc<PageAllocator>, byte_allocator: B, tail: Arc<T>) -> Self {
        Self::new(page_allocator, byte_allocator, tail)
    }
}
