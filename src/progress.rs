//! Progress guarantees selectable per operation (spec.md §5).

/// The strongest progress guarantee a caller requires from an operation.
///
/// Per spec.md §9's design note, the source declares but does not
/// consistently implement an obstruction-free guarantee distinct from
/// lock-free; this crate treats the two as behaviorally identical
/// everywhere while keeping them as separate enum variants so callers can
/// still express intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Progress {
    /// May block the caller (OS page acquisition, the spin-lock tail).
    Blocking,
    /// Never blocks; may retry an unbounded number of times under
    /// contention, but some thread always makes progress.
    LockFree,
    /// Treated identically to `LockFree` (spec.md §9).
    ObstructionFree,
    /// Bounded number of atomic operations; returns empty rather than
    /// retrying past that bound.
    WaitFree,
}

impl Progress {
    /// Whether this guarantee permits the operation to block the caller
    /// (e.g. to request a new OS memory region, or to busy-wait a spinlock).
    #[inline]
    #[must_use]
    pub fn may_block(self) -> bool {
        matches!(self, Progress::Blocking)
    }

    /// Whether a CAS failure under this guarantee should be retried in a
    /// loop (`true`) or should cause the whole operation to report empty
    /// immediately (`false`, for `WaitFree`).
    #[inline]
    #[must_use]
    pub fn retries_on_contention(self) -> bool {
        !matches!(self, Progress::WaitFree)
    }
}
