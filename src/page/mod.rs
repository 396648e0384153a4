//! Paged memory management: the System Page Source, the Page Allocator's
//! per-thread caches, the page footer, and the Pin Guard (spec.md §4.1).

mod allocator;
mod footer;
mod guard;
mod region;
mod source;

pub use allocator::PageAllocator;
pub use footer::{footer_of, init_footer, PageFooter, PAGE_SIZE, USABLE_PAGE_SIZE};
pub use guard::PinGuard;
