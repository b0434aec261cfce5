//! # Slab Object Caches
//!
//! Fixed-size object allocation layered on the zone allocator: one
//! [`KmemCache`] per object kind, each keeping `full` / `partial` / `free`
//! lists of slab blocks, plus the size-bucketed [`kmalloc`](SlabAllocator::kmalloc)
//! front end that almost every kernel subsystem allocates through.
//!
//! ## Slab layout
//!
//! A slab is a `2^order`-frame block carved into equal objects, with a stack
//! of free object indices at the tail:
//!
//! ```text
//! ┌──────────┬──────────┬──   ──┬──────────┬───────────────┐
//! │ object 0 │ object 1 │  ...  │ object n-1 │ free stack  │
//! └──────────┴──────────┴──   ──┴──────────┴───────────────┘
//! ^ block base (page aligned)               ^ n × u32 indices
//! ```
//!
//! Keeping the free stack outside object memory lets an optional constructor
//! run **once per object per slab lifetime**, at slab creation: a free
//! object's constructed state is never scribbled over. The matching
//! destructor runs when a slab is reclaimed to the zone allocator, not on
//! every free.
//!
//! Per-slab metadata (owning cache, object counters, list linkage) lives in
//! the frame descriptor of the block's head frame; the cache lists link slab
//! heads by frame index. Freeing by bare pointer works by walking pointer →
//! frame → block head → owning cache.
//!
//! ## Invariants
//!
//! - Every allocated object belongs to exactly one slab on the `partial` or
//!   `full` list; an object is either wholly free or wholly allocated.
//! - `free_objects` equals the sum of `obj_free` over all slabs of the cache.
//! - A cache with any object live refuses destruction with
//!   [`SlabError::Busy`] and mutates nothing.
//!
//! ## Tracing
//!
//! With the `trace-slab` / `trace-alloc` features every allocation and free
//! is logged with the caller's source location (`#[track_caller]`), which
//! takes the place of file/function/line wrapper macros.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod allocator;
mod cache;
mod list;

pub use allocator::{free_object, SlabAllocator};
pub use cache::{KmemCache, ObjFn, SlabError};

/// Objects newly created caches are pre-populated with.
pub const KMEM_START_OBJ_COUNT: u32 = 8;

/// Upper bound on objects replenished in one refill round.
pub const KMEM_MAX_REFILL_OBJ_COUNT: u32 = 64;

/// Fully-free slabs a cache keeps around; surplus is reclaimed to the zone
/// allocator as soon as a free empties a slab.
pub const KMEM_KEEP_FREE_SLABS: u32 = 1;

/// `kmalloc` buckets cover sizes up to `2^(MAX_KMALLOC_ORDER - 1)` bytes;
/// larger requests fall through to raw page blocks.
pub const MAX_KMALLOC_ORDER: u32 = 12;
