use crate::frame::{PageFrame, FRAME_NONE};
use crate::gfp::GfpFlags;
use crate::lowmem::LowMemWindow;
use crate::zone::{Zone, MAX_ORDER};
use core::fmt;
use kernel_memory_addresses::{Pfn, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use log::{debug, error};

/// Physical memory description handed over by early boot.
///
/// Both zones must be page-aligned; the database trims each zone down to a
/// multiple of the largest buddy block so the free lists start fully
/// coalesced. `lowmem_virt_base` is where `normal_start` appears in the
/// kernel's direct window.
#[derive(Debug, Clone)]
pub struct BootLayout {
    pub normal_start: PhysicalAddress,
    pub normal_end: PhysicalAddress,
    pub high_start: PhysicalAddress,
    pub high_end: PhysicalAddress,
    pub lowmem_virt_base: VirtualAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A zone boundary is not page-aligned or the ranges are inverted.
    BadLayout,
    /// The descriptor array does not cover the configured physical memory.
    MapTooSmall,
    /// An address was outside the low-memory window.
    NotLowMem,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLayout => write!(f, "zone boundaries malformed"),
            Self::MapTooSmall => write!(f, "frame descriptor array too small"),
            Self::NotLowMem => write!(f, "address outside the low-memory window"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneKind {
    Normal,
    High,
}

/// The page frame database: one descriptor per frame plus the two zones.
///
/// All physical allocation in the kernel bottoms out here.
pub struct FrameDb<'a> {
    frames: &'a mut [PageFrame],
    normal: Zone,
    high: Zone,
    window: LowMemWindow,
}

impl<'a> FrameDb<'a> {
    /// Builds the database over a caller-provided descriptor array.
    ///
    /// The array must have one entry per frame up to the end of the HighMem
    /// zone; descriptors of reserved frames (kernel image, holes) simply stay
    /// unused.
    pub fn new(frames: &'a mut [PageFrame], layout: &BootLayout) -> Result<Self, FrameError> {
        let block_bytes = PAGE_SIZE << MAX_ORDER;
        for addr in [
            layout.normal_start,
            layout.normal_end,
            layout.high_start,
            layout.high_end,
        ] {
            if !addr.is_page_aligned() {
                return Err(FrameError::BadLayout);
            }
        }
        if layout.normal_end <= layout.normal_start || layout.high_end < layout.high_start {
            return Err(FrameError::BadLayout);
        }

        // Trim both zones to a multiple of the largest block.
        let normal_bytes = (layout.normal_end - layout.normal_start) & !(block_bytes - 1);
        let high_bytes = (layout.high_end - layout.high_start) & !(block_bytes - 1);
        if normal_bytes == 0 {
            return Err(FrameError::BadLayout);
        }

        let normal_pages = normal_bytes / PAGE_SIZE;
        let high_pages = high_bytes / PAGE_SIZE;
        let normal_start = layout.normal_start.pfn().as_u32();
        let high_start = layout.high_start.pfn().as_u32();
        let last = (high_start + high_pages).max(normal_start + normal_pages);
        if frames.len() < last as usize {
            return Err(FrameError::MapTooSmall);
        }

        let normal = Zone::new("Normal", normal_start, normal_pages, frames);
        let high = Zone::new("HighMem", high_start, high_pages, frames);
        let window = LowMemWindow::new(
            layout.lowmem_virt_base,
            Pfn::new(normal_start),
            normal_pages,
        );

        debug!(
            target: "pmm",
            "zones: Normal {} pages from frame {}, HighMem {} pages from frame {}",
            normal_pages, normal_start, high_pages, high_start
        );

        Ok(Self {
            frames,
            normal,
            high,
            window,
        })
    }

    fn kind_for(gfp: GfpFlags) -> Option<ZoneKind> {
        if gfp.contains(GfpFlags::HIGHUSER) {
            Some(ZoneKind::High)
        } else if gfp.intersects(GfpFlags::KERNEL | GfpFlags::ATOMIC | GfpFlags::NOWAIT) {
            Some(ZoneKind::Normal)
        } else {
            error!(target: "pmm", "unrecognized gfp flags {gfp:?}");
            None
        }
    }

    fn kind_of(&self, pfn: u32) -> Option<ZoneKind> {
        if self.normal.contains(pfn) {
            Some(ZoneKind::Normal)
        } else if self.high.contains(pfn) {
            Some(ZoneKind::High)
        } else {
            None
        }
    }

    fn zone(&self, kind: ZoneKind) -> &Zone {
        match kind {
            ZoneKind::Normal => &self.normal,
            ZoneKind::High => &self.high,
        }
    }

    /// Allocates a contiguous block of `2^order` frames from the zone named
    /// by `gfp`. Every frame of the block starts with a reference count of 1.
    ///
    /// Returns `None` when the zone is exhausted or the request malformed.
    pub fn alloc_pages(&mut self, gfp: GfpFlags, order: u8) -> Option<Pfn> {
        if order > MAX_ORDER {
            error!(target: "pmm", "order {order} exceeds the maximum {MAX_ORDER}");
            return None;
        }
        let head = match Self::kind_for(gfp)? {
            ZoneKind::Normal => self.normal.alloc(self.frames, order),
            ZoneKind::High => self.high.alloc(self.frames, order),
        };
        let head = match head {
            Some(head) => head,
            None => {
                error!(target: "pmm", "out of memory: no order-{order} block for {gfp:?}");
                return None;
            }
        };
        for i in 0..(1u32 << order) {
            let frame = &mut self.frames[(head + i) as usize];
            frame.set_count(1);
            frame.block_head = head;
        }
        Some(Pfn::new(head))
    }

    /// Clears the descriptors of the block headed by `head` and returns it
    /// to its zone.
    fn reset_and_free_block(&mut self, head: u32) {
        let order = self.frames[head as usize].order;
        for i in 0..(1u32 << order) {
            let frame = &mut self.frames[(head + i) as usize];
            frame.set_count(0);
            frame.block_head = FRAME_NONE;
            frame.slab.reset();
            frame.set_slab(false);
        }
        match self.kind_of(head) {
            Some(ZoneKind::Normal) => self.normal.free(self.frames, head),
            Some(ZoneKind::High) => self.high.free(self.frames, head),
            None => error!(target: "pmm", "frame {head} belongs to no zone"),
        }
    }

    /// Releases the buddy block containing `pfn`.
    ///
    /// If the block head is still shared (`count > 1`) this only drops one
    /// reference from every frame of the block; the frames stay allocated
    /// until the last sharer lets go.
    pub fn free_pages(&mut self, pfn: Pfn) {
        let head = match self.frames[pfn.index()].block_head {
            FRAME_NONE => {
                error!(target: "pmm", "free of unallocated frame {pfn}");
                return;
            }
            head => head,
        };
        let order = self.frames[head as usize].order;
        if self.frames[head as usize].count() > 1 {
            for i in 0..(1u32 << order) {
                self.frames[(head + i) as usize].dec();
            }
            return;
        }
        self.reset_and_free_block(head);
    }

    /// Drops one reference from a single frame; once **every** frame of its
    /// buddy block has reached zero, the block returns to the zone.
    ///
    /// Address-space teardown uses this per-page form: after partial
    /// copy-on-write resolution the counts within one block legitimately
    /// diverge, and the block may only be freed when the last reference to
    /// its last frame is gone.
    pub fn release_frame(&mut self, pfn: Pfn) {
        let Some((head, order)) = self.block_of(pfn) else {
            error!(target: "pmm", "release of unallocated frame {pfn}");
            return;
        };
        if self.frames[pfn.index()].count() == 0 {
            error!(target: "pmm", "release of frame {pfn} with no references");
            return;
        }
        self.frames[pfn.index()].dec();
        let block = 1u32 << order;
        let all_free = (0..block).all(|i| self.frames[(head.as_u32() + i) as usize].count() == 0);
        if all_free {
            self.reset_and_free_block(head.as_u32());
        }
    }

    /// Allocates one Normal-zone frame and returns its direct-window address.
    pub fn alloc_page_lowmem(&mut self, gfp: GfpFlags) -> Option<VirtualAddress> {
        let pfn = self.alloc_pages(gfp & !GfpFlags::HIGHUSER, 0)?;
        self.window.address_of(pfn)
    }

    /// Frees a frame previously returned by [`Self::alloc_page_lowmem`].
    pub fn free_page_lowmem(&mut self, addr: VirtualAddress) -> Result<(), FrameError> {
        let pfn = self.window.pfn_of(addr).ok_or(FrameError::NotLowMem)?;
        self.free_pages(pfn);
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn frame(&self, pfn: Pfn) -> &PageFrame {
        &self.frames[pfn.index()]
    }

    #[inline]
    pub fn frame_mut(&mut self, pfn: Pfn) -> &mut PageFrame {
        &mut self.frames[pfn.index()]
    }

    /// The raw descriptor array, for subsystems that thread their own lists
    /// through it (the slab allocator's full/partial/free lists).
    #[inline]
    pub fn frames_mut(&mut self) -> &mut [PageFrame] {
        self.frames
    }

    /// Shared view of the descriptor array.
    #[inline]
    #[must_use]
    pub fn frames(&self) -> &[PageFrame] {
        self.frames
    }

    #[inline]
    #[must_use]
    pub fn window(&self) -> &LowMemWindow {
        &self.window
    }

    /// Mapping reference count of `pfn`.
    #[inline]
    #[must_use]
    pub fn page_count(&self, pfn: Pfn) -> u32 {
        self.frames[pfn.index()].count()
    }

    /// Takes one more reference on `pfn` (COW sharing).
    #[inline]
    pub fn page_inc(&self, pfn: Pfn) -> u32 {
        self.frames[pfn.index()].inc()
    }

    /// Drops one reference from `pfn`.
    #[inline]
    pub fn page_dec(&self, pfn: Pfn) -> u32 {
        self.frames[pfn.index()].dec()
    }

    /// Head and order of the allocated block containing `pfn`.
    #[must_use]
    pub fn block_of(&self, pfn: Pfn) -> Option<(Pfn, u8)> {
        match self.frames[pfn.index()].block_head {
            FRAME_NONE => None,
            head => Some((Pfn::new(head), self.frames[head as usize].order)),
        }
    }

    /// Bytes from `pfn` to the end of its buddy block.
    ///
    /// Teardown uses this to walk a virtual range block-wise: the size tells
    /// how far the current block reaches before the next lookup is needed.
    #[must_use]
    pub fn block_bytes_remaining(&self, pfn: Pfn) -> Option<u32> {
        let (head, order) = self.block_of(pfn)?;
        let end = head.as_u32() + (1 << order);
        Some((end - pfn.as_u32()) * PAGE_SIZE)
    }

    /// Total bytes of the zone selected by `gfp`.
    #[must_use]
    pub fn total_space(&self, gfp: GfpFlags) -> u64 {
        Self::kind_for(gfp).map_or(0, |k| self.zone(k).total_bytes())
    }

    /// Free bytes of the zone selected by `gfp`.
    #[must_use]
    pub fn free_space(&self, gfp: GfpFlags) -> u64 {
        Self::kind_for(gfp).map_or(0, |k| self.zone(k).free_bytes())
    }

    /// True when the zone selected by `gfp` has everything free and fully
    /// coalesced. The allocator self-tests check this between rounds.
    #[must_use]
    pub fn is_memory_clean(&self, gfp: GfpFlags) -> bool {
        Self::kind_for(gfp).is_some_and(|k| self.zone(k).is_clean())
    }
}
