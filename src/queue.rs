//! The Queue Façade (spec.md §4.4): composes one Tail and one Head
//! implementation behind a single `push`/`start_push`/`try_start_consume`
//! surface, generic over the element type `V`.

use std::fmt::{Debug, Display};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::control::ControlBlock;
use crate::error::ConstructError;
use crate::external::ByteAllocator;
use crate::head::{Consume, Head};
use crate::page::PageAllocator;
use crate::progress::Progress;
use crate::tail::{Allocation, Tail};

mod sealed {
    pub trait Sealed {}
}

/// Element erasure policy (spec.md §6), selected at the type level the way
/// the teacher picks a size class at compile time rather than branching on
/// a runtime enum.
pub trait Erasure: sealed::Sealed + 'static {
    const MANUAL_CLEAR: bool;
}

/// The default policy: `Queue::clear` is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct Standard;

/// Forbids `Queue::clear`; the queue must be empty by the time it drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualClear;

impl sealed::Sealed for Standard {}
impl sealed::Sealed for ManualClear {}
impl Erasure for Standard {
    const MANUAL_CLEAR: bool = false;
}
impl Erasure for ManualClear {
    const MANUAL_CLEAR: bool = true;
}

/// A reserved, uncommitted slot (spec.md §4.4). Move-only in spirit:
/// dropping without `commit`/`cancel` cancels it, matching the spec's
/// "destruction without either is equivalent to cancel".
pub struct PutTransaction<'a, TL: Tail, V> {
    tail: &'a TL,
    allocation: Option<Allocation>,
    _marker: PhantomData<V>,
}

impl<'a, TL: Tail, V> PutTransaction<'a, TL, V> {
    /// The address the element should be constructed at.
    #[must_use]
    pub fn element_ptr(&self) -> *mut V {
        self.allocation.as_ref().expect("live transaction").payload_ptr().cast()
    }

    /// A further raw-block allocation chained in the same queue, tagged DEAD
    /// at birth (consumers skip it, but it remains reachable for
    /// reclamation like any other slot). Used to attach bulk bytes to a
    /// transaction alongside its typed element.
    pub fn raw_allocate(&self, size: usize, alignment: usize) -> Option<*mut u8> {
        let raw = self.tail.try_inplace_allocate(Progress::Blocking, crate::control::DEAD, size, alignment)?;
        let ptr = raw.payload_ptr();
        self.tail.commit_put(&raw);
        Some(ptr)
    }

    pub fn commit(mut self) {
        let allocation = self.allocation.take().expect("live transaction");
        self.tail.commit_put(&allocation);
    }

    pub fn cancel(mut self) {
        let allocation = self.allocation.take().expect("live transaction");
        self.tail.cancel_put_nodestroy(&allocation);
    }
}

impl<'a, TL: Tail, V> Drop for PutTransaction<'a, TL, V> {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.tail.cancel_put_nodestroy(&allocation);
        }
    }
}

/// A claimed, uncommitted element (spec.md §4.4). Same move-only discipline
/// as `PutTransaction`.
pub struct ConsumeOperation<'a, HD: Head, V> {
    head: &'a HD,
    consume: Option<Consume<'a>>,
    _marker: PhantomData<V>,
}

impl<'a, HD: Head, V> ConsumeOperation<'a, HD, V> {
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.consume.as_ref().expect("live operation").is_external()
    }

    /// The typed element pointer, aligned as `V` requires.
    #[must_use]
    pub fn element_ptr(&self) -> *mut V {
        self.consume.as_ref().expect("live operation").user_storage(std::mem::align_of::<V>()).cast()
    }

    /// The raw storage pointer with no alignment promotion, for reading a
    /// raw block attached via `PutTransaction::raw_allocate`.
    #[must_use]
    pub fn unaligned_element_ptr(&self) -> *mut u8 {
        self.consume.as_ref().expect("live operation").user_storage(1)
    }

    /// Drops the element in place, then commits (sets DEAD, frees any
    /// external block, advances/reclaims as the head variant allows).
    pub fn commit(mut self) {
        unsafe { std::ptr::drop_in_place(self.element_ptr()) };
        let consume = self.consume.take().expect("live operation");
        self.head.commit_consume(consume);
    }

    /// Commits without running the element's destructor, for callers that
    /// already moved the value out (or for raw blocks with no destructor).
    pub fn commit_nodestroy(mut self) {
        let consume = self.consume.take().expect("live operation");
        self.head.commit_consume(consume);
    }

    /// Clears BUSY without DEAD, leaving the element consumable later.
    pub fn cancel(mut self) {
        let consume = self.consume.take().expect("live operation");
        self.head.cancel_consume(consume);
    }
}

impl<'a, HD: Head, V> Drop for ConsumeOperation<'a, HD, V> {
    fn drop(&mut self) {
        if let Some(consume) = self.consume.take() {
            self.head.cancel_consume(consume);
        }
    }
}

/// Composes a tail and a head implementation into one element-typed queue.
/// `Er` selects the element erasure policy (spec.md §6); it defaults to
/// `Standard`, under which `clear()` is available.
pub struct Queue<TL: Tail, HD: Head, V, Er: Erasure = Standard> {
    page_allocator: Arc<PageAllocator>,
    tail: Arc<TL>,
    head: HD,
    _marker: PhantomData<(V, Er)>,
}

impl<TL: Tail, HD: Head, V, Er: Erasure> Queue<TL, HD, V, Er> {
    /// Builds a queue from already-constructed layers, sharing one page
    /// allocator between them. Exposed for callers assembling a
    /// non-standard tail/head pairing; most callers want a `config` type
    /// alias's `new` instead.
    pub fn from_parts(page_allocator: Arc<PageAllocator>, tail: Arc<TL>, head: HD) -> Self {
        Self { page_allocator, tail, head, _marker: PhantomData }
    }

    /// Moves `value` into the queue, blocking on OS page pressure if
    /// necessary. Infallible: moving an already-constructed Rust value
    /// cannot fail.
    pub fn push(&self, value: V) {
        let txn = self.start_push(Progress::Blocking).expect("blocking progress always succeeds");
        unsafe { txn.element_ptr().write(value) };
        txn.commit();
    }

    /// As `push`, but gives up and returns `None` instead of retrying
    /// forever when `progress` cannot be met.
    #[must_use]
    pub fn try_push(&self, value: V, progress: Progress) -> Option<()> {
        let txn = self.start_push(progress)?;
        unsafe { txn.element_ptr().write(value) };
        txn.commit();
        Some(())
    }

    /// Constructs the element in place via `f`, canceling the slot (DEAD,
    /// no destructor run) and propagating the error if `f` fails. Models
    /// spec.md §8 scenario 3 (a constructor that throws on its third call).
    pub fn emplace<E>(&self, f: impl FnOnce(*mut V) -> Result<(), E>) -> Result<(), ConstructError<E>>
    where
        E: Debug + Display,
    {
        let txn = self.start_push(Progress::Blocking).expect("blocking progress always succeeds");
        match f(txn.element_ptr()) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(cause) => {
                txn.cancel();
                Err(ConstructError::new(cause))
            }
        }
    }

    /// Reserves a slot without constructing or committing it (spec.md
    /// §4.4). `None` if `progress` cannot be met.
    #[must_use]
    pub fn start_push(&self, progress: Progress) -> Option<PutTransaction<'_, TL, V>> {
        let allocation = self.tail.as_ref().try_inplace_allocate(progress, 0, std::mem::size_of::<V>(), std::mem::align_of::<V>())?;
        Some(PutTransaction { tail: self.tail.as_ref(), allocation: Some(allocation), _marker: PhantomData })
    }

    /// Claims the oldest ready element without running its destructor or
    /// moving it out (spec.md §4.4). `None` if the queue is empty.
    #[must_use]
    pub fn try_start_consume(&self) -> Option<ConsumeOperation<'_, HD, V>> {
        let consume = self.head.start_consume()?;
        Some(ConsumeOperation { head: &self.head, consume: Some(consume), _marker: PhantomData })
    }

    /// Reentrant put: identical algorithm to `start_push`, documented as
    /// safe to call from within a consumer callback of this same queue
    /// (spec.md §4.4, §9 "the algorithm is identical").
    #[must_use]
    pub fn reentrant_start_push(&self, progress: Progress) -> Option<PutTransaction<'_, TL, V>> {
        self.start_push(progress)
    }

    /// Reentrant consume: identical algorithm to `try_start_consume`, safe
    /// to call from within another element's consumer callback.
    #[must_use]
    pub fn reentrant_try_start_consume(&self) -> Option<ConsumeOperation<'_, HD, V>> {
        self.try_start_consume()
    }

    /// `true` once no ready element remains before the tail. Non-authoritative
    /// under concurrent producers: a `false` observed here may already be
    /// stale by the time the caller acts on it.
    #[must_use]
    pub fn is_queue_empty(&self) -> bool {
        self.head.is_queue_empty()
    }

    /// Alias of `is_queue_empty`, named for callers expecting the common
    /// collection-like spelling.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_queue_empty()
    }

    /// Walks the page chain from the first page ever allocated to the
    /// current end-of-chain marker, counting pages. Diagnostic only — never
    /// used by `push`/`try_start_consume` for correctness decisions, and
    /// racy under concurrent page chaining (spec.md's "Reclamation" testable
    /// property uses this after producers/consumers have quiesced).
    #[must_use]
    pub fn page_count(&self) -> usize {
        let mut count = 1usize;
        let mut page = crate::tail::page_of(self.tail.initial_page_addr());
        loop {
            let end_cb = unsafe { crate::tail::end_control_block(page) };
            let next = unsafe { (*end_cb).next.load(std::sync::atomic::Ordering::Acquire) };
            if ControlBlock::is_invalid_next_page(next) {
                return count;
            }
            page = crate::tail::page_of(ControlBlock::pointer_of(next));
            count += 1;
        }
    }

    /// The Page Allocator's pin count for the page the head currently
    /// occupies, for the pin-stress test scenario (spec.md §8 scenario 6).
    #[must_use]
    pub fn diagnostic_pin_count_of_head_page(&self) -> usize {
        let page = crate::tail::page_of(self.head.current_head_addr());
        self.page_allocator.get_pin_count(page)
    }
}

/// Constructs the concrete tail behind a `Queue` type alias. Every tail
/// variant shares this signature already as an inherent `new`; this trait
/// lets `Queue::build` stay generic over which one a type alias picks.
pub trait TailConstruct<B: ByteAllocator>: Tail + Sized {
    fn new_tail(page_allocator: Arc<PageAllocator>, byte_allocator: B) -> Option<Self>;
}

/// Constructs the concrete head behind a `Queue` type alias, mirroring
/// `TailConstruct`.
pub trait HeadConstruct<T: Tail, B: ByteAllocator>: Head + Sized {
    fn new_head(page_allocator: Arc<PageAllocator>, byte_allocator: B, tail: Arc<T>) -> Self;
}

impl<TL, HD, V, Er> Queue<TL, HD, V, Er>
where
    TL: Tail,
    HD: Head,
    Er: Erasure,
{
    /// Builds a fresh queue with its own page allocator, given the concrete
    /// tail/head implementations named by a `config` type alias.
    #[must_use]
    pub fn build<B>(byte_allocator: B) -> Option<Self>
    where
        B: ByteAllocator + Clone,
        TL: TailConstruct<B>,
        HD: HeadConstruct<TL, B>,
    {
        let page_allocator = Arc::new(PageAllocator::new());
        let tail = Arc::new(TL::new_tail(page_allocator.clone(), byte_allocator.clone())?);
        let head = HD::new_head(page_allocator.clone(), byte_allocator, tail.clone());
        Some(Self { page_allocator, tail, head, _marker: PhantomData })
    }
}

impl<TL: Tail, HD: Head, V> Queue<TL, HD, V, Standard> {
    /// Drops every currently consumable element, leaving the queue empty.
    /// Only available under the `Standard` erasure policy; `ManualClear`
    /// queues forbid it by construction (spec.md §6).
    pub fn clear(&self) {
        while let Some(op) = self.try_start_consume() {
            op.commit();
        }
    }
}

impl<TL: Tail, HD: Head, V> Drop for Queue<TL, HD, V, ManualClear> {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "a ManualClear queue must be drained before it drops");
    }
}
