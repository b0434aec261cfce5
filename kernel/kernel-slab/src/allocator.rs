use crate::cache::{KmemCache, ObjFn, SlabError};
use crate::{KMEM_START_OBJ_COUNT, MAX_KMALLOC_ORDER};
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use kernel_frames::{order_for_pages, FrameDb, GfpFlags, PhysAccess};
use kernel_memory_addresses::PAGE_SIZE;
use log::error;

#[cfg(feature = "trace-alloc")]
use log::trace;

/// Bucket names, one per power-of-two size class.
const KMALLOC_NAMES: [&str; MAX_KMALLOC_ORDER as usize] = [
    "kmalloc-1",
    "kmalloc-2",
    "kmalloc-4",
    "kmalloc-8",
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
];

/// The cache registry and the `kmalloc` front end.
///
/// Owns the self-describing cache-of-caches from which every other
/// [`KmemCache`] descriptor is allocated: cache descriptors therefore live in
/// slab memory with stable addresses, which is what makes the back-pointer in
/// each slab's frame descriptor sound.
pub struct SlabAllocator {
    cache_cache: NonNull<KmemCache>,
    /// Head of the registry of all live caches.
    caches: Option<NonNull<KmemCache>>,
    /// Size-class caches backing `kmalloc`.
    buckets: [Option<NonNull<KmemCache>>; MAX_KMALLOC_ORDER as usize],
}

impl SlabAllocator {
    /// Bootstraps the slab system: builds the cache-of-caches (hosting its
    /// own descriptor in its first slab) and the `kmalloc` buckets.
    pub fn init<A: PhysAccess>(frames: &mut FrameDb<'_>, phys: &A) -> Result<Self, SlabError> {
        // Stage the cache-of-caches on the stack just long enough to carve
        // its first slab, then move the descriptor into its own slab memory.
        let mut staged = KmemCache::new(
            "kmem_cache",
            size_of::<KmemCache>() as u32,
            align_of::<KmemCache>() as u32,
            GfpFlags::KERNEL,
            None,
            None,
        );
        let first = staged
            .alloc(frames, phys, GfpFlags::KERNEL)
            .ok_or(SlabError::OutOfMemory)?;
        let cache_cache = first.cast::<KmemCache>();
        unsafe { cache_cache.as_ptr().write(staged) };
        // Slabs carved while staged point at the stack copy; repoint them.
        Self::repoint_slabs(frames, cache_cache);

        let mut this = Self {
            cache_cache,
            caches: None,
            buckets: [None; MAX_KMALLOC_ORDER as usize],
        };
        this.register(cache_cache);

        for (order, name) in KMALLOC_NAMES.into_iter().enumerate() {
            let size = 1u32 << order;
            let bucket =
                this.cache_create(name, size, size, GfpFlags::KERNEL, None, None, frames, phys)?;
            this.buckets[order] = Some(bucket);
        }
        Ok(this)
    }

    /// Rewrites the owning-cache back-pointer of every slab of `cache` to
    /// `cache`'s final address.
    fn repoint_slabs(frames: &mut FrameDb<'_>, cache: NonNull<KmemCache>) {
        let addr = cache.as_ptr() as usize;
        let heads: [Option<u32>; 3] = {
            let c = unsafe { cache.as_ref() };
            [
                c.first_full_slab(),
                c.first_partial_slab(),
                c.first_free_slab(),
            ]
        };
        for head in heads.into_iter().flatten() {
            let fs = frames.frames_mut();
            let mut at = head;
            loop {
                fs[at as usize].slab.cache = addr;
                at = fs[at as usize].slab.next;
                if at == kernel_frames::FRAME_NONE {
                    break;
                }
            }
        }
    }

    fn register(&mut self, mut cache: NonNull<KmemCache>) {
        unsafe {
            cache.as_mut().link_prev = None;
            cache.as_mut().link_next = self.caches;
            if let Some(mut head) = self.caches {
                head.as_mut().link_prev = Some(cache);
            }
        }
        self.caches = Some(cache);
    }

    fn unregister(&mut self, cache: NonNull<KmemCache>) {
        let (prev, next) = {
            let c = unsafe { cache.as_ref() };
            (c.link_prev, c.link_next)
        };
        match prev {
            Some(mut p) => unsafe { p.as_mut().link_next = next },
            None => self.caches = next,
        }
        if let Some(mut n) = next {
            unsafe { n.as_mut().link_prev = prev };
        }
    }

    /// Creates a new cache, pre-populated with a starting batch of objects.
    #[allow(clippy::too_many_arguments)]
    pub fn cache_create<A: PhysAccess>(
        &mut self,
        name: &'static str,
        object_size: u32,
        align: u32,
        flags: GfpFlags,
        ctor: Option<ObjFn>,
        dtor: Option<ObjFn>,
        frames: &mut FrameDb<'_>,
        phys: &A,
    ) -> Result<NonNull<KmemCache>, SlabError> {
        let slot = unsafe { self.cache_cache.as_mut() }
            .alloc(frames, phys, GfpFlags::KERNEL)
            .ok_or(SlabError::OutOfMemory)?;
        let cache = slot.cast::<KmemCache>();
        unsafe {
            cache
                .as_ptr()
                .write(KmemCache::new(name, object_size, align, flags, ctor, dtor));
        }
        // Starting batch, as at boot; failure here only delays the first alloc.
        let _ = unsafe { &mut *cache.as_ptr() }.refill(frames, phys, KMEM_START_OBJ_COUNT, flags);
        self.register(cache);
        Ok(cache)
    }

    /// Destroys a cache. Fails with [`SlabError::Busy`], mutating nothing,
    /// while any object is still allocated.
    pub fn cache_destroy<A: PhysAccess>(
        &mut self,
        mut cache: NonNull<KmemCache>,
        frames: &mut FrameDb<'_>,
        phys: &A,
    ) -> Result<(), SlabError> {
        {
            let c = unsafe { cache.as_mut() };
            if !c.is_idle() {
                error!(target: "slab", "destroy of busy cache `{}`", c.name());
                return Err(SlabError::Busy);
            }
            c.reclaim_all(frames, phys);
        }
        self.unregister(cache);
        self.free(cache.cast(), frames, phys);
        Ok(())
    }

    /// Frees an object by bare pointer, dispatching to the owning cache via
    /// the frame descriptor, or to the zone allocator for raw page blocks.
    ///
    /// Freeing a pointer that no cache and no page block owns is a caller
    /// bug; it is logged and dropped.
    #[track_caller]
    pub fn free<A: PhysAccess>(&mut self, ptr: NonNull<u8>, frames: &mut FrameDb<'_>, phys: &A) {
        #[cfg(feature = "trace-alloc")]
        trace!(
            target: "slab",
            "KFREE   {:p} at {}",
            ptr.as_ptr(),
            core::panic::Location::caller()
        );
        free_object(frames, phys, ptr);
    }

    /// Size-bucketed kernel allocation.
    ///
    /// Requests up to the largest bucket come from a size-class cache;
    /// larger ones fall back to a raw page block from the Normal zone.
    /// Returns `None` on out-of-memory (and for zero-size requests).
    #[track_caller]
    pub fn kmalloc<A: PhysAccess>(
        &mut self,
        size: u32,
        frames: &mut FrameDb<'_>,
        phys: &A,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let order = size.next_power_of_two().trailing_zeros();
        let ptr = if order < MAX_KMALLOC_ORDER {
            let mut bucket = self.buckets[order as usize]?;
            unsafe { bucket.as_mut() }.alloc(frames, phys, GfpFlags::KERNEL)
        } else {
            let page_order = order_for_pages(size.div_ceil(PAGE_SIZE));
            let head = frames.alloc_pages(GfpFlags::KERNEL, page_order)?;
            NonNull::new(phys.frame_ptr(head))
        };
        #[cfg(feature = "trace-alloc")]
        if let Some(p) = ptr {
            trace!(
                target: "slab",
                "KMALLOC {:p} at {}",
                p.as_ptr(),
                core::panic::Location::caller()
            );
        }
        ptr
    }

    /// The registry head, for diagnostics.
    #[must_use]
    pub fn caches(&self) -> Option<NonNull<KmemCache>> {
        self.caches
    }
}

/// Frees an object by bare pointer, without an allocator handle in reach.
///
/// The owning cache is recovered from the frame descriptor of the pointer's
/// block head; raw page blocks (the `kmalloc` fallback) go straight back to
/// the zone allocator. Freeing a pointer nothing owns is a caller bug; it is
/// logged and dropped.
pub fn free_object<A: PhysAccess>(frames: &mut FrameDb<'_>, phys: &A, ptr: NonNull<u8>) {
    let Some(pfn) = phys.pfn_of_ptr(ptr.as_ptr()) else {
        error!(target: "slab", "free of unmapped pointer {:p}", ptr.as_ptr());
        return;
    };
    let Some((head, _)) = frames.block_of(pfn) else {
        error!(target: "slab", "free of unallocated pointer {:p}", ptr.as_ptr());
        return;
    };
    let cache_addr = frames.frame(head).slab.cache;
    if cache_addr == 0 {
        // Raw page block from the kmalloc fallback path.
        frames.free_pages(head);
        return;
    }
    let cache = unsafe { &mut *(cache_addr as *mut KmemCache) };
    cache.free_in(frames, phys, head, ptr);
}
