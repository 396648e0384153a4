//! # `heteroq` — lock-free heterogeneous FIFO queues over a paged allocator
//!
//! A library of concurrent FIFO queues whose elements may have different
//! static types, sizes, and alignments, stored contiguously in large pages
//! carved from a process-wide paged allocator. Four producer-cardinality ×
//! consistency tail algorithms (single-producer, multi-producer relaxed,
//! multi-producer sequentially-consistent, multi-producer spin-locked)
//! combine with two consumer-cardinality head algorithms (single-consumer,
//! multi-consumer) behind one `Queue` façade.
//!
//! ## What this crate does not do
//!
//! Random access, ordered traversal, removal from the middle, persistence,
//! cross-process sharing, strict FIFO ordering between distinct producers
//! (only per-producer ordering is guaranteed), and fairness between
//! concurrent consumers are all out of scope by design.
//!
//! ## Example
//!
//! ```rust
//! use heteroq::config::SpscQueue;
//!
//! let queue: SpscQueue<u64> = SpscQueue::build(Default::default()).unwrap();
//! queue.push(42);
//! let op = queue.try_start_consume().unwrap();
//! assert_eq!(unsafe { *op.element_ptr() }, 42);
//! op.commit();
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod control;
pub mod error;
pub mod external;
pub mod head;
pub mod page;
pub mod progress;
pub mod queue;
pub mod runtime_type;
pub mod tail;

pub use config::{
    MpmcRelaxedQueue, MpmcSeqCstQueue, MpmcSpinlockQueue, MpscRelaxedQueue, MpscSeqCstQueue, MpscSpinlockQueue, SpmcQueue, SpscQueue,
};
pub use error::{ConstructError, PagePressure};
pub use external::{ByteAllocator, ExternalBlock, SystemByteAllocator};
pub use head::{Consume, Head, MultiConsumerHead, SingleConsumerHead};
pub use page::{PageAllocator, PageFooter, PinGuard};
pub use progress::Progress;
pub use queue::{ConsumeOperation, PutTransaction, Queue};
pub use runtime_type::{ErasedDescriptor, RuntimeType};
pub use tail::{RelaxedTail, SeqCstTail, SingleProducerTail, SpinlockTail, Tail};

// Compile-time layout assertions (mirrors the teacher's own `const _: () = { ... }`
// block of zero-overhead claims for its cell types).
const _: () = {
    use core::mem;

    // The control block is one atomic word: tagging state into its low
    // bits must never grow it past pointer width.
    assert!(mem::size_of::<control::ControlBlock>() >= mem::size_of::<usize>());
    assert!(mem::align_of::<control::ControlBlock>() >= mem::align_of::<usize>());

    // The granule must be a power of two large enough to hold every flag.
    assert!(control::GRANULE.is_power_of_two());
    assert!(control::GRANULE > control::ALL_FLAGS);

    // The page footer must fit comfortably inside one page; a footer wider
    // than a page would leave no usable region at all.
    assert!(mem::size_of::<page::PageFooter>() < page::PAGE_SIZE);
};
