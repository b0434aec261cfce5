use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

/// Sentinel for "no frame" in the index-linked lists running through the
/// descriptor array.
pub const FRAME_NONE: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u8 {
        /// Head of a free buddy block, linked into a zone free list.
        const BUDDY_FREE = 1 << 0;
        /// Part of a slab block.
        const SLAB       = 1 << 1;
    }
}

/// Slab bookkeeping embedded in the frame descriptor.
///
/// The descriptor array is the only storage that exists before any allocator
/// does, so per-slab metadata lives here rather than in heap objects: the
/// head frame of a slab block carries the owning cache and the object
/// counters, and the cache's full/partial/free lists link slab heads to each
/// other by frame index. (The free-object stack itself sits at the tail of
/// the slab block, outside object memory, so constructed object state
/// survives while an object is free.)
#[derive(Debug)]
pub struct SlabSlot {
    /// Address of the owning cache, `0` when the frame is not a slab head.
    /// Opaque to this crate; the slab allocator casts it back.
    pub cache: usize,
    /// Objects carved into this slab.
    pub obj_count: u32,
    /// Objects currently free in this slab.
    pub obj_free: u32,
    /// Next slab head on the owning cache's list, by frame index.
    pub next: u32,
    /// Previous slab head on the owning cache's list, by frame index.
    pub prev: u32,
}

impl SlabSlot {
    pub(crate) const fn new() -> Self {
        Self {
            cache: 0,
            obj_count: 0,
            obj_free: 0,
            next: FRAME_NONE,
            prev: FRAME_NONE,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Descriptor of one physical page frame.
///
/// The reference count is atomic so the fault path can adjust sharing
/// without racing an interrupted update; everything else is guarded by the
/// allocator's lock discipline.
#[derive(Debug)]
pub struct PageFrame {
    /// Mapping reference count. 0 = unused, 1 = exclusively mapped,
    /// > 1 = COW-shared (and read-only everywhere).
    count: AtomicU32,
    /// Buddy order; meaningful on block heads and free-list heads.
    pub(crate) order: u8,
    pub(crate) flags: PageFlags,
    /// Head frame of the allocated block this frame belongs to,
    /// [`FRAME_NONE`] while free.
    pub(crate) block_head: u32,
    /// Zone free-list linkage (by frame index).
    pub(crate) next_free: u32,
    pub(crate) prev_free: u32,
    /// Slab bookkeeping, see [`SlabSlot`].
    pub slab: SlabSlot,
}

impl PageFrame {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            order: 0,
            flags: PageFlags::empty(),
            block_head: FRAME_NONE,
            next_free: FRAME_NONE,
            prev_free: FRAME_NONE,
            slab: SlabSlot::new(),
        }
    }

    /// Current mapping reference count.
    ///
    /// Single-CPU kernel: relaxed atomics are all that is needed for
    /// atomicity with respect to interrupts.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_count(&self, value: u32) {
        self.count.store(value, Ordering::Relaxed);
    }

    /// Increments the reference count, returning the new value.
    #[inline]
    pub fn inc(&self) -> u32 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the reference count, returning the new value.
    #[inline]
    pub fn dec(&self) -> u32 {
        let old = self.count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0, "reference count underflow");
        old - 1
    }

    /// Buddy order of this frame's block (meaningful on heads).
    #[inline]
    #[must_use]
    pub fn order(&self) -> u8 {
        self.order
    }

    /// Head frame index of the allocated block this frame belongs to.
    #[inline]
    #[must_use]
    pub fn block_head(&self) -> u32 {
        self.block_head
    }

    /// Whether this frame currently sits on a zone free list.
    #[inline]
    #[must_use]
    pub fn is_buddy_free(&self) -> bool {
        self.flags.contains(PageFlags::BUDDY_FREE)
    }

    /// Whether this frame belongs to a slab block.
    #[inline]
    #[must_use]
    pub fn is_slab(&self) -> bool {
        self.flags.contains(PageFlags::SLAB)
    }

    pub fn set_slab(&mut self, slab: bool) {
        self.flags.set(PageFlags::SLAB, slab);
    }
}

impl Default for PageFrame {
    fn default() -> Self {
        Self::new()
    }
}
