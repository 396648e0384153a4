//! The Tail Layer: four producer-side allocation algorithms sharing one
//! contract (spec.md §4.2).

mod mpmc_relaxed;
mod mpmc_seqcst;
mod single_producer;
mod spinlock;

pub use mpmc_relaxed::RelaxedTail;
pub use mpmc_seqcst::SeqCstTail;
pub use single_producer::SingleProducerTail;
pub use spinlock::SpinlockTail;

use std::sync::Arc;

use crate::control::{ceil_align, end_control_offset, ControlBlock, DEAD, GRANULE, INVALID_NEXT_PAGE};
use crate::external::{ByteAllocator, ExternalBlock};
use crate::page::PageAllocator;
use crate::progress::Progress;

/// Minimum alignment every in-page slot satisfies regardless of the
/// caller's request (spec.md §4.2: "the tail promotes the request").
pub const MIN_ALIGNMENT: usize = std::mem::align_of::<*const ()>();

/// The triple a tail hands back on a successful allocation: the control
/// block that now owns the slot, the exact value written into its `next`
/// field (so commit/cancel can validate without reloading), and a pointer
/// to the writable storage that follows the control block.
pub struct Allocation {
    pub control_block: *mut ControlBlock,
    pub next_ptr_value: usize,
    pub user_storage: *mut u8,
    /// Set when the tail externalised this allocation; the external
    /// record lives at `user_storage` and the real payload at
    /// `external.block`.
    pub external: Option<ExternalBlock>,
}

impl Allocation {
    /// The address the caller should actually construct its payload at:
    /// the external heap block if externalised, otherwise `user_storage`.
    #[must_use]
    pub fn payload_ptr(&self) -> *mut u8 {
        match &self.external {
            Some(external) => external.block,
            None => self.user_storage,
        }
    }
}

/// Shared behavior every tail variant implements (spec.md §4.2).
pub trait Tail {
    /// Reserves room for `size` bytes aligned to `alignment`, tagging the
    /// new control block with `control_bits | BUSY`. Returns `None` if the
    /// requested progress guarantee cannot be met.
    fn try_inplace_allocate(&self, progress: Progress, control_bits: usize, size: usize, alignment: usize) -> Option<Allocation>;

    /// Clears BUSY on a successfully constructed slot.
    fn commit_put(&self, allocation: &Allocation);

    /// Runs `destroy` on the payload and the external record's heap block
    /// (if any), then sets DEAD and clears BUSY.
    fn cancel_put(&self, allocation: &Allocation, destroy: impl FnOnce(*mut u8));

    /// Sets DEAD and clears BUSY without destroying anything (construction
    /// never happened).
    fn cancel_put_nodestroy(&self, allocation: &Allocation);

    /// A relaxed, diagnostic-only snapshot of the current tail address.
    /// Used by the head layer to distinguish "not yet written" from "queue
    /// empty" when it encounters a zero `next` in a relaxed-consistency
    /// queue.
    fn current_tail_addr(&self) -> usize;

    /// The address of the very first control block this tail ever created.
    /// The head layer starts its traversal here.
    fn initial_page_addr(&self) -> usize;
}

/// Total granule-aligned byte length an in-page slot of `size`/`alignment`
/// needs, including its control block and worst-case alignment padding.
#[must_use]
pub fn required_units(size: usize, alignment: usize) -> usize {
    let alignment = alignment.max(MIN_ALIGNMENT);
    let padding = alignment.saturating_sub(GRANULE);
    ceil_align(std::mem::size_of::<ControlBlock>() + padding + size, GRANULE)
}

/// Whether a slot of `size`/`alignment` fits in an otherwise-empty page.
#[must_use]
pub fn fits_in_page(size: usize, alignment: usize) -> bool {
    required_units(size, alignment) <= end_control_offset()
}

/// Rounds `cb_addr + size_of::<ControlBlock>()` up to `alignment`, the
/// in-page user storage address for a slot whose control block starts at
/// `cb_addr`.
#[must_use]
pub fn user_storage_addr(cb_addr: usize, alignment: usize) -> usize {
    ceil_align(cb_addr + std::mem::size_of::<ControlBlock>(), alignment.max(MIN_ALIGNMENT))
}

/// Allocates and records an external block for a too-large request.
pub fn external_allocate(byte_allocator: &impl ByteAllocator, size: usize, alignment: usize) -> Option<ExternalBlock> {
    ExternalBlock::allocate(byte_allocator, size, alignment)
}

/// Requests a fresh page from the allocator, and writes `INVALID_NEXT_PAGE`
/// into its end-of-page control block so followers know there is no
/// successor yet. Shared by every multi-producer tail's chaining protocol.
pub fn new_chained_page(page_allocator: &Arc<PageAllocator>, progress: Progress, zeroed: bool) -> Option<*mut u8> {
    let page = page_allocator.allocate_page(progress, zeroed)?;
    let end_cb = unsafe { end_control_block(page) };
    unsafe { (*end_cb).next.store(INVALID_NEXT_PAGE, std::sync::atomic::Ordering::Relaxed) };
    Some(page)
}

/// Returns a pointer to the control block at `offset` bytes into `page`.
///
/// # Safety
/// `offset` must be `<= end_control_offset()` and `page` must be a live
/// page base address.
#[must_use]
pub unsafe fn control_block_at(page: *mut u8, offset: usize) -> *mut ControlBlock {
    page.add(offset).cast::<ControlBlock>()
}

/// # Safety
/// `page` must be a live page base address.
#[must_use]
pub unsafe fn end_control_block(page: *mut u8) -> *mut ControlBlock {
    control_block_at(page, end_control_offset())
}

/// The page a tagged `next` pointer component falls within, given the
/// usable page size.
#[must_use]
pub fn page_of(addr: usize) -> *mut u8 {
    // The end-of-page control block lands exactly at `USABLE_PAGE_SIZE`,
    // still within the same `PAGE_SIZE`-aligned block handed out by the
    // System Page Source, so masking to `PAGE_SIZE` covers every address a
    // tagged `next` can name.
    (addr & !(crate::page::PAGE_SIZE - 1)) as *mut u8
}

/// Pads the gap between `tail_addr` and the end control block with a DEAD
/// link so it is skipped by consumers, by writing a DEAD CB at `tail_addr`
/// whose `next` points at the end-CB.
///
/// # Safety
/// `tail_addr` must name a zeroed, otherwise-unused control block slot
/// within the same page as its end-of-page control block.
pub unsafe fn pad_to_end(tail_addr: usize) {
    let page = page_of(tail_addr);
    let end_offset = end_control_offset();
    let end_addr = page as usize + end_offset;
    if tail_addr == end_addr {
        return;
    }
    let cb = tail_addr as *mut ControlBlock;
    (*cb).next.store(end_addr | DEAD, std::sync::atomic::Ordering::Release);
}
