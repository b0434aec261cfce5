//! # Two-Level Paging Support (x86 protected mode)
//!
//! Walking and mutating the hardware page tables of a 32-bit address space.
//!
//! ## The walk
//!
//! Each 32-bit linear address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12   | 11‒0   |
//! | Directory |  Table  | Offset |
//! ```
//!
//! The CPU uses the two index fields to walk two levels of tables, each with
//! 1024 entries of 32 bits:
//!
//! ```text
//!  Page Directory  →  Page Table  →  Physical Page
//!   │                  │
//!   │                  └───► PTE (maps one 4 KiB page)
//!   └──────────────────────► PDE (points at one page table, covers 4 MiB)
//! ```
//!
//! `CR3` holds the physical address of the directory; one directory per
//! address space.
//!
//! ## What this crate provides
//!
//! - [`PageDirectoryEntry`] / [`PageTableEntry`]: the hardware entry layouts
//!   as bitfields, including the software `kernel_cow` bit kept in an
//!   available PTE bit.
//! - [`MapFlags`]: the software view of a mapping request.
//! - [`PageRangeIter`]: a cursor over a virtual range that **materializes**
//!   every directory entry it crosses (allocating zeroed table pages through
//!   [`TableAlloc`]) and yields successive table-entry slots for mutation.
//! - [`update_range`] / [`clone_range`]: the two bulk mutations everything
//!   else is built from, with the mandatory single-page TLB invalidate after
//!   every entry write, issued through the [`Mmu`] trait.
//! - [`ShadowCowTable`]: the COW indirection. When cloning a COW mapping the
//!   destination slot stays hardware-not-present and the link to the source
//!   slot lives here, keyed by (directory, virtual page); the fault handler
//!   resolves it lazily. Nothing is smuggled through entry payload bits.
//!
//! ## Invariants
//!
//! - If a directory entry is not present, no user access under it succeeds.
//! - Entry materialization widens `present`/`rw`/`user` monotonically; the
//!   `global` bit is one-way and asserted against downgrades.
//! - Every entry write is followed, in program order, by a single-page TLB
//!   invalidation for the affected address.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod entry;
mod flags;
mod mmu;
mod shadow;
mod table;
mod walker;

pub use entry::{apply_table_flags, PageDirectoryEntry, PageTableEntry};
pub use flags::MapFlags;
pub use mmu::{Mmu, X86Mmu};
pub use shadow::{ShadowCowTable, SlotRef};
pub use table::{PageDirectory, PageTable};
pub use walker::{
    clone_range, copy_directory, directory_mut, entry_slot, read_entry, table_mut, update_range,
    virt_to_page, PageRangeIter, PtSlot, TableAlloc, VmemError,
};

#[cfg(any(test, feature = "test-support"))]
pub use mmu::RecordingMmu;
