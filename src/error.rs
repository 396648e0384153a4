//! Error types (spec.md §7). No `thiserror`/`anyhow`: the teacher's own
//! library target never pulled in an error-handling crate, only its xtask
//! binary did, and this crate's errors are few enough to hand-roll exactly
//! the way the contract describes them.

use std::fmt;

/// Raised from a blocking operation when the OS itself refuses to grow the
/// page mapping (genuine OOM), mirroring the contract's "allocation-failure
/// exception" for the blocking progress guarantee.
#[derive(Debug)]
pub struct PagePressure;

impl fmt::Display for PagePressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("page allocator could not satisfy a blocking request")
    }
}

impl std::error::Error for PagePressure {}

/// Propagated when a user-supplied constructor, or the runtime-type's
/// `copy_construct`, fails partway through building an element. The
/// reserved slot has already been canceled (DEAD set, BUSY cleared, any
/// already-constructed part destroyed) by the time this reaches the caller.
#[derive(Debug)]
pub struct ConstructError<E> {
    pub cause: E,
}

impl<E> ConstructError<E> {
    #[must_use]
    pub fn new(cause: E) -> Self {
        Self { cause }
    }
}

impl<E: fmt::Display> fmt::Display for ConstructError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element construction failed and its slot was canceled: {}", self.cause)
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ConstructError<E> {}
