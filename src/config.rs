//! Compile-time queue configuration (spec.md §6 "Configuration"): producer
//! cardinality, consumer cardinality, consistency, and synchronisation all
//! resolve to a type alias, never a runtime branch, the way the teacher
//! picks a size class at compile time rather than dispatching on a runtime
//! enum (`alloc::segregated::size_class::SizeClass`).

use crate::external::SystemByteAllocator;
use crate::head::{MultiConsumerHead, SingleConsumerHead};
use crate::queue::Queue;
use crate::tail::{RelaxedTail, SeqCstTail, SingleProducerTail, SpinlockTail};

pub use crate::queue::{Erasure, ManualClear, Standard};

/// Single producer, single consumer: the cheapest combination, both sides
/// plain non-atomic cursors.
pub type SpscQueue<V, B = SystemByteAllocator> = Queue<SingleProducerTail<B>, SingleConsumerHead<SingleProducerTail<B>, B>, V>;

/// Single producer, multiple consumers racing to claim each element.
pub type SpmcQueue<V, B = SystemByteAllocator> = Queue<SingleProducerTail<B>, MultiConsumerHead<SingleProducerTail<B>, B>, V>;

/// Multiple producers under relaxed ordering (per-producer FIFO only),
/// single consumer.
pub type MpscRelaxedQueue<V, B = SystemByteAllocator> = Queue<RelaxedTail<B>, SingleConsumerHead<RelaxedTail<B>, B>, V>;

/// Multiple producers under relaxed ordering, multiple consumers.
pub type MpmcRelaxedQueue<V, B = SystemByteAllocator> = Queue<RelaxedTail<B>, MultiConsumerHead<RelaxedTail<B>, B>, V>;

/// Multiple producers under sequential consistency, single consumer.
pub type MpscSeqCstQueue<V, B = SystemByteAllocator> = Queue<SeqCstTail<B>, SingleConsumerHead<SeqCstTail<B>, B>, V>;

/// Multiple producers under sequential consistency, multiple consumers —
/// the only combination with a total order across every put and consume
/// (spec.md §5).
pub type MpmcSeqCstQueue<V, B = SystemByteAllocator> = Queue<SeqCstTail<B>, MultiConsumerHead<SeqCstTail<B>, B>, V>;

/// Multiple producers serialized by a spin-lock, single consumer.
pub type MpscSpinlockQueue<V, B = SystemByteAllocator> = Queue<SpinlockTail<B>, SingleConsumerHead<SpinlockTail<B>, B>, V>;

/// Multiple producers serialized by a spin-lock, multiple consumers.
pub type MpmcSpinlockQueue<V, B = SystemByteAllocator> = Queue<SpinlockTail<B>, MultiConsumerHead<SpinlockTail<B>, B>, V>;

/// Builds a queue from runtime choices that still bottom out in the type
/// aliases above; exists for call sites that pick producer/consumer
/// cardinality and consistency from configuration rather than from source
/// code, without reintroducing a runtime dispatch inside the queue itself —
/// the builder's output is still one concrete, monomorphic `Queue` type.
pub struct QueueBuilder<B = SystemByteAllocator> {
    byte_allocator: B,
}

impl Default for QueueBuilder<SystemByteAllocator> {
    fn default() -> Self {
        Self { byte_allocator: SystemByteAllocator }
    }
}

impl QueueBuilder<SystemByteAllocator> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B> QueueBuilder<B> {
    /// Swaps in a non-default byte allocator for external (too-large)
    /// blocks.
    pub fn with_byte_allocator<B2>(self, byte_allocator: B2) -> QueueBuilder<B2> {
        QueueBuilder { byte_allocator }
    }

    /// Builds the concrete queue type named by `Q`, a `config` type alias
    /// (or a hand-assembled `Queue<TL, HD, V, Er>`), threading this
    /// builder's byte allocator through.
    #[must_use]
    pub fn build<TL, HD, V, Er>(self) -> Option<Queue<TL, HD, V, Er>>
    where
        TL: crate::tail::Tail + crate::queue::TailConstruct<B>,
        HD: crate::head::Head + crate::queue::HeadConstruct<TL, B>,
        Er: Erasure,
        B: crate::external::ByteAllocator + Clone,
    {
        Queue::build(self.byte_allocator)
    }
}
