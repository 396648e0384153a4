//! The control-block state machine: tagged `next` pointers and the four
//! state flags BUSY/DEAD/EXTERNAL/INVALID_NEXT_PAGE (spec.md §3, §4.5).

use std::sync::atomic::AtomicUsize;

use crate::external::ExternalBlock;
use crate::page::USABLE_PAGE_SIZE;

/// A thread currently owns the slot for construction or consumption.
pub const BUSY: usize = 1 << 0;
/// The slot's payload is absent; its destructor must not run.
pub const DEAD: usize = 1 << 1;
/// The payload is an [`ExternalBlock`] record, not the payload itself.
pub const EXTERNAL: usize = 1 << 2;
/// Sentinel written into a new page's end-CB: "no successor yet".
pub const INVALID_NEXT_PAGE: usize = 1 << 3;

/// Union of all defined state flags.
pub const ALL_FLAGS: usize = BUSY | DEAD | EXTERNAL | INVALID_NEXT_PAGE;

const fn pow2_ceil(mut x: usize) -> usize {
    if x <= 1 {
        return 1;
    }
    x -= 1;
    let mut shift = 1;
    while shift < usize::BITS as usize {
        x |= x >> shift;
        shift *= 2;
    }
    x + 1
}

/// Allocation granularity `G`: the alignment every control block, tail
/// cursor, and head cursor advances by. Grounded on
/// `max(destructive_interference_size, alignof(runtime_type), alignof(external_block), 8, pow2_ceil(AllFlags+1))`.
pub const GRANULE: usize = {
    let cache_line = std::mem::align_of::<crossbeam_utils::CachePadded<u8>>();
    let runtime_type_align = std::mem::align_of::<*const ()>();
    let external_align = std::mem::align_of::<ExternalBlock>();
    let flags_align = pow2_ceil(ALL_FLAGS + 1);

    let mut g = cache_line;
    if runtime_type_align > g {
        g = runtime_type_align;
    }
    if external_align > g {
        g = external_align;
    }
    if 8 > g {
        g = 8;
    }
    if flags_align > g {
        g = flags_align;
    }
    g
};

/// Rounds `value` down to the nearest multiple of `align` (`align` a power
/// of two).
#[inline]
#[must_use]
pub const fn floor_align(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Rounds `value` up to the nearest multiple of `align` (`align` a power of
/// two).
#[inline]
#[must_use]
pub const fn ceil_align(value: usize, align: usize) -> usize {
    floor_align(value + align - 1, align)
}

/// Byte offset, within a page's usable region, of its end-of-page control
/// block.
#[must_use]
pub fn end_control_offset() -> usize {
    floor_align(USABLE_PAGE_SIZE - std::mem::size_of::<ControlBlock>(), GRANULE)
}

/// One slot in the intrusive log: a single atomic word that is either zero
/// (free, page-internal invariant: fresh pages start zeroed), or the tagged
/// address of the next control block.
#[repr(C, align(8))]
pub struct ControlBlock {
    pub next: AtomicUsize,
}

impl ControlBlock {
    #[must_use]
    pub const fn pack(pointer_bits: usize, flags: usize) -> usize {
        debug_assert!(pointer_bits & ALL_FLAGS == 0, "pointer component must be G-aligned");
        pointer_bits | (flags & ALL_FLAGS)
    }

    #[inline]
    #[must_use]
    pub const fn state_of(value: usize) -> usize {
        value & ALL_FLAGS
    }

    #[inline]
    #[must_use]
    pub const fn pointer_of(value: usize) -> usize {
        value & !ALL_FLAGS
    }

    #[inline]
    #[must_use]
    pub const fn is_busy(value: usize) -> bool {
        value & BUSY != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_dead(value: usize) -> bool {
        value & DEAD != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_external(value: usize) -> bool {
        value & EXTERNAL != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_invalid_next_page(value: usize) -> bool {
        value == INVALID_NEXT_PAGE
    }

    /// A ready slot has a non-null `next`, with neither BUSY nor DEAD set.
    #[inline]
    #[must_use]
    pub const fn is_ready(value: usize) -> bool {
        value != 0 && !Self::is_busy(value) && !Self::is_dead(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granule_is_power_of_two_and_covers_flags() {
        assert!(GRANULE.is_power_of_two());
        assert!(GRANULE >= ALL_FLAGS + 1);
        assert!(GRANULE >= 8);
    }

    #[test]
    fn pack_and_unpack_roundtrip() {
        let ptr_bits = 128 * GRANULE;
        let packed = ControlBlock::pack(ptr_bits, BUSY);
        assert_eq!(ControlBlock::pointer_of(packed), ptr_bits);
        assert_eq!(ControlBlock::state_of(packed), BUSY);
        assert!(ControlBlock::is_busy(packed));
        assert!(!ControlBlock::is_dead(packed));
    }

    #[test]
    fn busy_and_dead_are_distinguishable_and_combinable_bitwise() {
        let both = BUSY | DEAD;
        assert!(ControlBlock::is_busy(both));
        assert!(ControlBlock::is_dead(both));
    }

    #[test]
    fn end_control_offset_is_granule_aligned_and_in_range() {
        let offset = end_control_offset();
        assert_eq!(offset % GRANULE, 0);
        assert!(offset < USABLE_PAGE_SIZE);
        assert!(offset + std::mem::size_of::<ControlBlock>() <= USABLE_PAGE_SIZE);
    }
}
