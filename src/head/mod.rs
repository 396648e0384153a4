//! The Head Layer: the two consumer-side algorithms sharing one contract
//! (spec.md §4.3).

mod multi_consumer;
mod single_consumer;

pub use multi_consumer::MultiConsumerHead;
pub use single_consumer::SingleConsumerHead;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::control::ControlBlock;
use crate::external::ByteAllocator;
use crate::page::PinGuard;
use crate::tail::user_storage_addr;

/// A reservation on the oldest ready control block, returned by
/// `start_consume`. Owns a pin on its page (multi-consumer variant only;
/// the single-consumer variant has nothing else to race against reclaiming
/// it, so its pin is a no-op `None`). Dropping without commit/cancel is a
/// leak the same way an un-committed `PutTransaction` is: callers must
/// explicitly choose one.
pub struct Consume<'a> {
    control_block: *mut ControlBlock,
    next_ptr_value: usize,
    pin: Option<PinGuard<'a>>,
}

impl<'a> Consume<'a> {
    #[must_use]
    pub fn control_block(&self) -> *mut ControlBlock {
        self.control_block
    }

    #[must_use]
    pub fn next_ptr_value(&self) -> usize {
        self.next_ptr_value
    }

    #[must_use]
    pub fn is_external(&self) -> bool {
        ControlBlock::is_external(self.next_ptr_value)
    }

    /// The in-page storage address for a payload of the given alignment,
    /// laid out exactly as the tail that produced this slot laid it out.
    #[must_use]
    pub fn user_storage(&self, alignment: usize) -> *mut u8 {
        user_storage_addr(self.control_block as usize, alignment) as *mut u8
    }
}

/// Shared behavior every head variant implements (spec.md §4.3).
pub trait Head {
    /// Finds the oldest ready control block, installs BUSY on it, and
    /// returns a handle. `None` if the queue is empty.
    fn start_consume(&self) -> Option<Consume<'_>>;

    /// Sets DEAD, clears BUSY, frees `consume`'s external block (if any),
    /// then advances the head over any now-contiguous run of DEAD control
    /// blocks, reclaiming pages whose pin count has dropped to zero.
    fn commit_consume(&self, consume: Consume<'_>);

    /// Clears BUSY without setting DEAD, leaving the element consumable by
    /// a later consumer.
    fn cancel_consume(&self, consume: Consume<'_>);

    /// Walks from head to tail without modification, `true` as soon as no
    /// ready control block is found before the tail.
    fn is_queue_empty(&self) -> bool;

    /// A relaxed, diagnostic-only snapshot of the current head address, for
    /// the pin-stress test scenario (spec.md §8 scenario 6).
    fn current_head_addr(&self) -> usize;
}

/// Reads `next` relaxed and masks off the state flags, the traversal
/// primitive shared by both head variants.
#[inline]
fn next_pointer(control_block: *mut ControlBlock) -> usize {
    let raw = unsafe { (*control_block).next.load(Ordering::Relaxed) };
    ControlBlock::pointer_of(raw)
}

/// Frees a just-committed slot's external heap block, if it had one.
fn free_external_if_any<B: ByteAllocator>(control_block: *mut ControlBlock, next_ptr_value: usize, byte_allocator: &B) {
    if ControlBlock::is_external(next_ptr_value) {
        let external_addr = user_storage_addr(control_block as usize, std::mem::align_of::<crate::external::ExternalBlock>());
        let external = unsafe { &*(external_addr as *const crate::external::ExternalBlock) };
        unsafe { external.deallocate(byte_allocator) };
    }
}

/// Advances `head`-like state by one control block, reclaiming the page it
/// leaves behind if the move crosses a page boundary and the page's pin
/// count has dropped to zero. Shared by the commit-time cleanup sweeps of
/// both head variants; callers still do their own pinning of the new
/// current page for multi-consumer traversal.
///
/// Pages are always returned to the "dirty" cache, never zeroed here: a
/// zeroed-page request recycles a dirty page lazily at allocation time
/// (`PageAllocator::allocate_page`), rather than paying the zeroing cost
/// for pages a zeroed producer variant may never ask for again.
fn maybe_reclaim_page(page_allocator: &Arc<crate::page::PageAllocator>, old_page: *mut u8, new_page: *mut u8) {
    if old_page != new_page && page_allocator.get_pin_count(old_page) == 0 {
        page_allocator.deallocate_page(old_page, false);
    }
}

/// Whether `value`'s control block lives in the same page as `other`.
#[inline]
fn same_page(a: usize, b: usize) -> bool {
    crate::tail::page_of(a) == crate::tail::page_of(b)
}
