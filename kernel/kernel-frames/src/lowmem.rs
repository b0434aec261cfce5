use kernel_memory_addresses::{Pfn, VirtualAddress, PAGE_SIZE};

/// The directly-mapped low-memory window.
///
/// Frames of the Normal zone appear at a fixed offset in kernel virtual
/// space, so converting between a frame and its kernel pointer is pure
/// arithmetic, both ways. HighMem frames have no standing mapping and return
/// `None`; reaching them takes a scratch mapping.
#[derive(Debug, Clone, Copy)]
pub struct LowMemWindow {
    virt_base: u32,
    first_pfn: u32,
    frame_count: u32,
}

impl LowMemWindow {
    #[must_use]
    pub const fn new(virt_base: VirtualAddress, first_pfn: Pfn, frame_count: u32) -> Self {
        Self {
            virt_base: virt_base.as_u32(),
            first_pfn: first_pfn.as_u32(),
            frame_count,
        }
    }

    /// Kernel-virtual address of the first byte of `pfn`, if the frame lies
    /// in the window.
    #[must_use]
    pub fn address_of(&self, pfn: Pfn) -> Option<VirtualAddress> {
        let rel = pfn.as_u32().checked_sub(self.first_pfn)?;
        if rel >= self.frame_count {
            return None;
        }
        Some(VirtualAddress::new(self.virt_base + rel * PAGE_SIZE))
    }

    /// Frame owning the window address `addr`, if any.
    #[must_use]
    pub fn pfn_of(&self, addr: VirtualAddress) -> Option<Pfn> {
        let rel = addr.as_u32().checked_sub(self.virt_base)? / PAGE_SIZE;
        if rel >= self.frame_count {
            return None;
        }
        Some(Pfn::new(self.first_pfn + rel))
    }

    /// Whether `addr` falls inside the window.
    #[must_use]
    pub fn contains_address(&self, addr: VirtualAddress) -> bool {
        self.pfn_of(addr).is_some()
    }

    /// First address of the window.
    #[must_use]
    pub fn virt_base(&self) -> VirtualAddress {
        VirtualAddress::new(self.virt_base)
    }

    /// First frame covered by the window.
    #[must_use]
    pub fn first_pfn(&self) -> Pfn {
        Pfn::new(self.first_pfn)
    }

    /// Frames covered by the window.
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }
}

/// Access to the bytes of a physical frame.
///
/// This is the seam between the allocators and the machine: on bare metal
/// the implementation is the low-memory window (plus scratch mappings for
/// HighMem); hosted test suites implement it over a heap-backed arena. Code
/// that carves slabs, zeroes fresh frames or copies page contents goes
/// through this trait and never hard-codes an address-space layout.
pub trait PhysAccess {
    /// A usable pointer to the first byte of `pfn`.
    ///
    /// The frame must be reachable by this mapper; unreachable frames are a
    /// caller bug and implementations may panic.
    fn frame_ptr(&self, pfn: Pfn) -> *mut u8;

    /// Reverse lookup: the frame owning a pointer previously derived from
    /// [`Self::frame_ptr`] (at any offset inside the frame).
    fn pfn_of_ptr(&self, ptr: *const u8) -> Option<Pfn>;

    /// Zeroes `count` frames starting at `pfn`.
    ///
    /// # Safety
    /// The frames must be allocated and not concurrently borrowed.
    unsafe fn zero_frames(&self, pfn: Pfn, count: u32) {
        for i in 0..count {
            let p = self.frame_ptr(pfn + i);
            unsafe { core::ptr::write_bytes(p, 0, PAGE_SIZE as usize) };
        }
    }
}

/// Bare-metal [`PhysAccess`] over the low-memory window.
///
/// Only Normal-zone frames are reachable; the memory core wraps this with
/// the scratch-window mapper where HighMem frames need touching.
#[derive(Debug, Clone, Copy)]
pub struct LowMemAccess {
    window: LowMemWindow,
}

impl LowMemAccess {
    #[must_use]
    pub const fn new(window: LowMemWindow) -> Self {
        Self { window }
    }
}

impl PhysAccess for LowMemAccess {
    fn frame_ptr(&self, pfn: Pfn) -> *mut u8 {
        let va = self
            .window
            .address_of(pfn)
            .expect("frame outside the low-memory window");
        va.as_u32() as usize as *mut u8
    }

    fn pfn_of_ptr(&self, ptr: *const u8) -> Option<Pfn> {
        self.window.pfn_of(VirtualAddress::new(ptr as usize as u32))
    }
}
