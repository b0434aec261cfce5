use crate::list::SlabList;
use crate::{KMEM_KEEP_FREE_SLABS, KMEM_MAX_REFILL_OBJ_COUNT, KMEM_START_OBJ_COUNT};
use core::fmt;
use core::ptr::NonNull;
use kernel_frames::{order_for_pages, FrameDb, GfpFlags, PhysAccess, MAX_ORDER};
use kernel_memory_addresses::{Pfn, PAGE_SIZE};
use log::{error, info};

#[cfg(feature = "trace-slab")]
use log::trace;

/// Constructor/destructor run on cache objects.
pub type ObjFn = fn(NonNull<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// The zone allocator could not supply a slab block.
    OutOfMemory,
    /// Destruction refused: objects are still allocated.
    Busy,
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Busy => write!(f, "cache still has live objects"),
        }
    }
}

/// Bytes per free-stack entry at the slab tail.
const INDEX_BYTES: u32 = 4;

/// Hard cap on slab block order; beyond this, more contiguity buys nothing.
const SLAB_MAX_ORDER: u8 = 3;

/// Minimum object alignment (and thus granularity of the padded size).
const MIN_ALIGN: u32 = 8;

/// A cache of same-sized kernel objects.
///
/// Caches themselves live in slab memory (allocated from the self-describing
/// cache-of-caches), so the back-pointer stored in each slab's frame
/// descriptor stays valid for the cache's whole life.
pub struct KmemCache {
    /// Registry linkage (all caches, for diagnostics and teardown).
    pub link_next: Option<NonNull<KmemCache>>,
    pub(crate) link_prev: Option<NonNull<KmemCache>>,
    name: &'static str,
    /// Caller-requested object size.
    object_size: u32,
    /// Requested alignment.
    align: u32,
    /// Padded size actually carved: `object_size` rounded up to the
    /// alignment, at least [`MIN_ALIGN`].
    size: u32,
    flags: GfpFlags,
    /// Zone-allocator order of one slab block.
    gfp_order: u8,
    ctor: Option<ObjFn>,
    dtor: Option<ObjFn>,
    slabs_full: SlabList,
    slabs_partial: SlabList,
    slabs_free: SlabList,
    total_objects: u32,
    free_objects: u32,
}

impl KmemCache {
    /// Initializes a cache descriptor. No memory is allocated until the
    /// first refill.
    pub(crate) fn new(
        name: &'static str,
        object_size: u32,
        align: u32,
        flags: GfpFlags,
        ctor: Option<ObjFn>,
        dtor: Option<ObjFn>,
    ) -> Self {
        assert!(object_size > 0, "zero-sized cache objects");
        let align = align.max(MIN_ALIGN);
        assert!(
            align <= PAGE_SIZE && align.is_power_of_two(),
            "unsupported cache alignment {align}"
        );
        let size = object_size.div_ceil(align) * align;
        assert!(
            size + INDEX_BYTES <= PAGE_SIZE << SLAB_MAX_ORDER,
            "object size {size} too large for a slab; use raw pages"
        );
        let gfp_order = Self::pick_order(size);
        info!(
            target: "slab",
            "creating cache `{name}` with objects of size {object_size} (padded {size}, order {gfp_order})"
        );
        Self {
            link_next: None,
            link_prev: None,
            name,
            object_size,
            align,
            size,
            flags,
            gfp_order,
            ctor,
            dtor,
            slabs_full: SlabList::new(),
            slabs_partial: SlabList::new(),
            slabs_free: SlabList::new(),
            total_objects: 0,
            free_objects: 0,
        }
    }

    /// Objects a slab block of `order` holds, free stack included.
    fn objects_per_slab(size: u32, order: u8) -> u32 {
        (PAGE_SIZE << order) / (size + INDEX_BYTES)
    }

    /// Smallest order that fits one object, then grown until the slab holds
    /// a useful number of objects (four) or the order cap is hit.
    fn pick_order(size: u32) -> u8 {
        let mut order = order_for_pages((size + INDEX_BYTES).div_ceil(PAGE_SIZE));
        while order < SLAB_MAX_ORDER.min(MAX_ORDER) && Self::objects_per_slab(size, order) < 4 {
            order += 1;
        }
        order
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub fn object_size(&self) -> u32 {
        self.object_size
    }

    #[inline]
    #[must_use]
    pub fn align(&self) -> u32 {
        self.align
    }

    #[inline]
    #[must_use]
    pub fn total_objects(&self) -> u32 {
        self.total_objects
    }

    #[inline]
    #[must_use]
    pub fn free_objects(&self) -> u32 {
        self.free_objects
    }

    /// Slab counts as (full, partial, free); test and diagnostic surface.
    #[must_use]
    pub fn slab_counts(&self, frames: &FrameDb<'_>) -> (u32, u32, u32) {
        let fs = frames.frames();
        (
            self.slabs_full.len(fs),
            self.slabs_partial.len(fs),
            self.slabs_free.len(fs),
        )
    }

    /// Grows the cache by one slab block.
    fn grow<A: PhysAccess>(
        &mut self,
        frames: &mut FrameDb<'_>,
        phys: &A,
        gfp: GfpFlags,
    ) -> Result<(), SlabError> {
        let head = frames
            .alloc_pages(gfp, self.gfp_order)
            .ok_or(SlabError::OutOfMemory)?;
        let obj_count = Self::objects_per_slab(self.size, self.gfp_order);
        debug_assert!(obj_count > 0, "slab order fits no object");

        let cache_addr = self as *mut Self as usize;
        {
            let fs = frames.frames_mut();
            for i in 0..(1u32 << self.gfp_order) {
                fs[(head.as_u32() + i) as usize].set_slab(true);
            }
            let slot = &mut fs[head.index()].slab;
            slot.cache = cache_addr;
            slot.obj_count = obj_count;
            slot.obj_free = obj_count;
        }

        let base = phys.frame_ptr(head);
        // Seed the free stack with every object index.
        let stack = unsafe { base.add((obj_count * self.size) as usize) }.cast::<u32>();
        for i in 0..obj_count {
            unsafe { stack.add(i as usize).write(i) };
        }
        // The constructor runs exactly once per object per slab lifetime.
        if let Some(ctor) = self.ctor {
            for i in 0..obj_count {
                let obj = unsafe { base.add((i * self.size) as usize) };
                ctor(NonNull::new(obj).expect("slab object pointer"));
            }
        }

        self.slabs_free.push(frames.frames_mut(), head.as_u32());
        self.total_objects += obj_count;
        self.free_objects += obj_count;
        Ok(())
    }

    /// Grows the cache until at least `target` objects are free.
    pub(crate) fn refill<A: PhysAccess>(
        &mut self,
        frames: &mut FrameDb<'_>,
        phys: &A,
        target: u32,
        gfp: GfpFlags,
    ) -> Result<(), SlabError> {
        while self.free_objects < target {
            if let Err(e) = self.grow(frames, phys, gfp) {
                error!(target: "slab", "refill of `{}` aborted: {e}", self.name);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Allocates one object.
    ///
    /// Policy, in order: carve from a partial slab; promote a free slab;
    /// refill from the zone allocator. Returns `None` on out-of-memory.
    #[track_caller]
    pub fn alloc<A: PhysAccess>(
        &mut self,
        frames: &mut FrameDb<'_>,
        phys: &A,
        gfp: GfpFlags,
    ) -> Option<NonNull<u8>> {
        if self.slabs_partial.is_empty() {
            if self.slabs_free.is_empty() {
                let gfp = if gfp.is_empty() { self.flags } else { gfp };
                let target = self
                    .total_objects
                    .max(KMEM_START_OBJ_COUNT)
                    .min(KMEM_MAX_REFILL_OBJ_COUNT);
                let _ = self.refill(frames, phys, target, gfp);
                if self.slabs_free.is_empty() {
                    error!(target: "slab", "cannot allocate more slabs in `{}`", self.name);
                    return None;
                }
            }
            let promoted = self.slabs_free.pop(frames.frames_mut())?;
            self.slabs_partial.push(frames.frames_mut(), promoted);
        }

        let head = self.slabs_partial.first()?;
        let base = phys.frame_ptr(Pfn::new(head));
        let (index, now_full) = {
            let slot = &mut frames.frames_mut()[head as usize].slab;
            debug_assert!(slot.obj_free > 0, "partial slab with no free object");
            slot.obj_free -= 1;
            let stack = unsafe { base.add((slot.obj_count * self.size) as usize) }.cast::<u32>();
            let index = unsafe { stack.add(slot.obj_free as usize).read() };
            (index, slot.obj_free == 0)
        };
        self.free_objects -= 1;
        if now_full {
            self.slabs_partial.remove(frames.frames_mut(), head);
            self.slabs_full.push(frames.frames_mut(), head);
        }

        let ptr = unsafe { base.add((index * self.size) as usize) };
        #[cfg(feature = "trace-slab")]
        trace!(
            target: "slab",
            "CACHE-ALLOC {ptr:p} in {:<20} at {}",
            self.name,
            core::panic::Location::caller()
        );
        NonNull::new(ptr)
    }

    /// Returns an object to the slab that owns it.
    ///
    /// `head` is the slab's head frame; `ptr` must be an object previously
    /// handed out by this cache.
    pub(crate) fn free_in<A: PhysAccess>(
        &mut self,
        frames: &mut FrameDb<'_>,
        phys: &A,
        head: Pfn,
        ptr: NonNull<u8>,
    ) {
        let base = phys.frame_ptr(head);
        let offset = ptr.as_ptr() as usize - base as usize;
        debug_assert_eq!(offset % self.size as usize, 0, "pointer not an object");
        let index = (offset / self.size as usize) as u32;

        let (was_full, now_empty) = {
            let slot = &mut frames.frames_mut()[head.index()].slab;
            debug_assert!(index < slot.obj_count);
            let was_full = slot.obj_free == 0;
            let stack = unsafe { base.add((slot.obj_count * self.size) as usize) }.cast::<u32>();
            unsafe { stack.add(slot.obj_free as usize).write(index) };
            slot.obj_free += 1;
            (was_full, slot.obj_free == slot.obj_count)
        };
        self.free_objects += 1;

        if now_empty {
            if was_full {
                self.slabs_full.remove(frames.frames_mut(), head.as_u32());
            } else {
                self.slabs_partial.remove(frames.frames_mut(), head.as_u32());
            }
            self.slabs_free.push(frames.frames_mut(), head.as_u32());
            // Reclaim beyond the keep watermark.
            if self.slabs_free.len(frames.frames_mut()) > KMEM_KEEP_FREE_SLABS {
                self.slabs_free.remove(frames.frames_mut(), head.as_u32());
                self.reclaim_slab(frames, phys, head);
            }
        } else if was_full {
            self.slabs_full.remove(frames.frames_mut(), head.as_u32());
            self.slabs_partial.push(frames.frames_mut(), head.as_u32());
        }
    }

    /// Releases an unlinked, fully-free slab block to the zone allocator.
    /// The destructor runs here, once per object per slab lifetime.
    fn reclaim_slab<A: PhysAccess>(&mut self, frames: &mut FrameDb<'_>, phys: &A, head: Pfn) {
        let obj_count = frames.frame(head).slab.obj_count;
        debug_assert_eq!(frames.frame(head).slab.obj_free, obj_count);
        if let Some(dtor) = self.dtor {
            let base = phys.frame_ptr(head);
            for i in 0..obj_count {
                let obj = unsafe { base.add((i * self.size) as usize) };
                dtor(NonNull::new(obj).expect("slab object pointer"));
            }
        }
        self.total_objects -= obj_count;
        self.free_objects -= obj_count;
        // free_pages clears the slab bookkeeping of every frame it releases.
        frames.free_pages(head);
    }

    /// Reclaims every slab on the free list. Used by cache destruction once
    /// the busy check passed (full and partial are then necessarily empty).
    pub(crate) fn reclaim_all<A: PhysAccess>(&mut self, frames: &mut FrameDb<'_>, phys: &A) {
        while let Some(head) = self.slabs_free.pop(frames.frames_mut()) {
            self.reclaim_slab(frames, phys, Pfn::new(head));
        }
        debug_assert!(self.slabs_partial.is_empty() && self.slabs_full.is_empty());
    }

    /// True when no object of this cache is allocated.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.total_objects == self.free_objects
    }

    pub(crate) fn first_full_slab(&self) -> Option<u32> {
        self.slabs_full.first()
    }

    pub(crate) fn first_partial_slab(&self) -> Option<u32> {
        self.slabs_partial.first()
    }

    pub(crate) fn first_free_slab(&self) -> Option<u32> {
        self.slabs_free.first()
    }
}
