use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_memory_addresses::{Pfn, VirtualAddress, PAGE_SIZE};
use kernel_vmem::MapFlags;

/// A virtual memory area: the half-open range `[start, end)` with its
/// protection flags.
#[derive(Debug, Clone)]
pub struct VmArea {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: MapFlags,
}

impl VmArea {
    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && start < self.end
    }
}

/// Verdict of [`Mm::is_valid_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeCheck {
    /// Disjoint from every existing area and well-formed.
    Free,
    /// Intersects an existing area.
    Overlap,
    /// `end <= start`.
    Malformed,
}

/// One address space: a page directory plus its areas.
///
/// The area list is kept sorted ascending by start address and areas never
/// overlap; both are invariants every mutation below preserves. Mutation
/// happens only on the owning task (or the fault handler acting for it).
pub struct Mm {
    /// Frame of the page directory.
    pgd: Pfn,
    /// The directory as a slab object, for the free at teardown.
    pgd_object: NonNull<u8>,
    /// Sorted, disjoint areas.
    areas: Vec<VmArea>,
    /// Most-recently-used area index.
    mmap_cache: Option<usize>,
    /// Lowest address of the user stack.
    pub start_stack: VirtualAddress,
    /// Start of the heap area, zero until the first `brk`.
    pub start_brk: VirtualAddress,
    /// Current program break.
    pub brk: VirtualAddress,
    /// Pages accounted to this space, in allocation-order units.
    pub total_vm: u32,
}

impl Mm {
    pub(crate) fn new(pgd: Pfn, pgd_object: NonNull<u8>) -> Self {
        Self {
            pgd,
            pgd_object,
            areas: Vec::new(),
            mmap_cache: None,
            start_stack: VirtualAddress::zero(),
            start_brk: VirtualAddress::zero(),
            brk: VirtualAddress::zero(),
            total_vm: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn pgd(&self) -> Pfn {
        self.pgd
    }

    pub(crate) fn pgd_object(&self) -> NonNull<u8> {
        self.pgd_object
    }

    /// Number of mapped areas.
    #[inline]
    #[must_use]
    pub fn map_count(&self) -> u32 {
        self.areas.len() as u32
    }

    #[inline]
    #[must_use]
    pub fn areas(&self) -> &[VmArea] {
        &self.areas
    }

    #[must_use]
    pub fn area(&self, index: usize) -> &VmArea {
        &self.areas[index]
    }

    /// Index of the area starting exactly at `start`.
    #[must_use]
    pub fn find_area(&self, start: VirtualAddress) -> Option<usize> {
        if let Some(cached) = self.mmap_cache {
            if self
                .areas
                .get(cached)
                .is_some_and(|area| area.start == start)
            {
                return Some(cached);
            }
        }
        self.areas.iter().position(|area| area.start == start)
    }

    /// Index of the area containing `addr`.
    #[must_use]
    pub fn area_containing(&self, addr: VirtualAddress) -> Option<usize> {
        self.areas.iter().position(|area| area.contains(addr))
    }

    /// Checks `[start, end)` against the existing areas.
    #[must_use]
    pub fn is_valid_range(&self, start: VirtualAddress, end: VirtualAddress) -> RangeCheck {
        if end <= start {
            return RangeCheck::Malformed;
        }
        if self.areas.iter().any(|area| area.overlaps(start, end)) {
            return RangeCheck::Overlap;
        }
        RangeCheck::Free
    }

    /// First-fit search for a hole of `length` bytes between two consecutive
    /// areas; the hole is taken from the end of the gap.
    #[must_use]
    pub fn find_free_gap(&self, length: u32) -> Option<VirtualAddress> {
        for pair in self.areas.windows(2) {
            let gap = pair[1].start - pair[0].end;
            if gap >= length {
                return Some(VirtualAddress::new(pair[1].start.as_u32() - length));
            }
        }
        None
    }

    /// Inserts `area`, keeping the list sorted; returns its index and marks
    /// it most-recently-used.
    pub(crate) fn insert_area(&mut self, area: VmArea) -> usize {
        debug_assert_eq!(
            self.is_valid_range(area.start, area.end),
            RangeCheck::Free,
            "inserting an overlapping area"
        );
        let index = self
            .areas
            .partition_point(|existing| existing.start < area.start);
        self.areas.insert(index, area);
        self.mmap_cache = Some(index);
        index
    }

    pub(crate) fn remove_area(&mut self, index: usize) -> VmArea {
        self.mmap_cache = None;
        self.areas.remove(index)
    }

    /// Pages spanned by `[start, start + size)` at page granularity.
    #[must_use]
    pub fn pages_spanned(start: VirtualAddress, size: u32) -> u32 {
        let first = start.vpn();
        let last = (u64::from(start.as_u32()) + u64::from(size)).div_ceil(u64::from(PAGE_SIZE));
        (last as u32) - first
    }
}
