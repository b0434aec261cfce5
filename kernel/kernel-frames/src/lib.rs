//! # Page Frame Database and Zone Allocator
//!
//! One descriptor per physical page frame, grouped into **zones** that each
//! run a buddy system over their frame range.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   FrameDb                           │
//! │    • one PageFrame descriptor per physical frame    │
//! │    • reference counts mediate COW sharing           │
//! ├──────────────────────────┬──────────────────────────┤
//! │       Zone "Normal"      │       Zone "HighMem"     │
//! │  directly mapped low RAM │  reached via scratch map │
//! │  buddy lists order 0..10 │  buddy lists order 0..10 │
//! └──────────────────────────┴──────────────────────────┘
//! ```
//!
//! Allocations name a zone through [`GfpFlags`]; the buddy system hands out
//! naturally aligned blocks of `2^order` contiguous frames and coalesces them
//! again on free. Free-list linkage runs **by frame index** through the
//! descriptor array itself, so the allocator needs no heap of its own.
//!
//! The [`LowMemWindow`] converts between frames of the Normal zone and their
//! kernel-virtual addresses in the direct window; the [`PhysAccess`] trait
//! abstracts "give me a usable pointer into this frame" so that the slab
//! allocator and the page-table walker run identically on bare metal (direct
//! window + scratch mappings) and under the hosted test arena.
//!
//! ## Invariants
//!
//! - A frame's reference count is ≥ 1 while it is mapped anywhere.
//! - Frames with a count > 1 are COW-shared and read-only in every mapping;
//!   the count is the sole mediator of that sharing.
//! - Every allocated frame knows the head of its buddy block; freeing any
//!   frame of a block frees (or, for shared blocks, releases one reference
//!   of) the whole block.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod db;
mod frame;
mod gfp;
mod lowmem;
mod zone;

pub use db::{BootLayout, FrameDb, FrameError};
pub use frame::{PageFrame, SlabSlot, FRAME_NONE};
pub use gfp::GfpFlags;
pub use lowmem::{LowMemAccess, LowMemWindow, PhysAccess};
pub use zone::MAX_ORDER;

#[cfg(any(test, feature = "test-support"))]
pub mod arena;

/// Smallest order whose blocks hold at least `pages` frames.
#[must_use]
pub fn order_for_pages(pages: u32) -> u8 {
    let mut order = 0u8;
    while (1u32 << order) < pages {
        order += 1;
    }
    order
}

/// Order of the block needed to back `[base, base + bytes)`.
///
/// The range is widened to page granularity first, so an unaligned base
/// costs an extra page, exactly as the mapping code will consume it.
#[must_use]
pub fn order_for_range(base: u32, bytes: u32) -> u8 {
    let start_pfn = base / kernel_memory_addresses::PAGE_SIZE;
    let end_pfn = (base
        .checked_add(bytes)
        .and_then(|e| e.checked_add(kernel_memory_addresses::PAGE_SIZE - 1))
        .expect("range overflows the address space"))
        / kernel_memory_addresses::PAGE_SIZE;
    debug_assert!(end_pfn > start_pfn, "empty page range");
    order_for_pages(end_pfn - start_pfn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_fit_their_page_counts() {
        assert_eq!(order_for_pages(1), 0);
        assert_eq!(order_for_pages(2), 1);
        assert_eq!(order_for_pages(3), 2);
        assert_eq!(order_for_pages(4), 2);
        assert_eq!(order_for_pages(5), 3);
    }

    #[test]
    fn unaligned_ranges_cost_an_extra_page() {
        // Aligned 16 KiB: four pages, order 2.
        assert_eq!(order_for_range(0x0800_0000, 0x4000), 2);
        // The same length off by a byte straddles five pages.
        assert_eq!(order_for_range(0x0800_0001, 0x4000), 3);
    }
}
