use crate::entry::{apply_table_flags, PageDirectoryEntry, PageTableEntry};
use crate::flags::MapFlags;
use crate::mmu::Mmu;
use crate::shadow::{ShadowCowTable, SlotRef};
use crate::table::{PageDirectory, PageTable};
use core::fmt;
use core::ptr::NonNull;
use kernel_frames::{FrameDb, PhysAccess};
use kernel_memory_addresses::{
    Pfn, PhysicalAddress, VirtualAddress, ENTRIES_PER_TABLE, PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmemError {
    /// The table cache could not supply a page-table frame.
    OutOfMemory,
}

impl fmt::Display for VmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of page-table frames"),
        }
    }
}

/// Source of zeroed page-table frames (the table slab cache, in practice).
pub trait TableAlloc {
    /// Allocates a zero-initialized table frame.
    fn alloc_table(&mut self) -> Option<Pfn>;

    /// Returns a table frame to its cache.
    fn free_table(&mut self, table: Pfn);
}

/// Views the frame `pgd` as a page directory.
///
/// # Safety contract
/// The frame must hold a page directory and be reachable by `phys`; the
/// caller keeps aliasing in check the same way it would for the raw frame.
#[must_use]
pub fn directory_mut<'t, A: PhysAccess>(phys: &A, pgd: Pfn) -> &'t mut PageDirectory {
    unsafe { &mut *phys.frame_ptr(pgd).cast::<PageDirectory>() }
}

/// Views the frame `table` as a page table.
///
/// # Safety contract
/// Same as [`directory_mut`].
#[must_use]
pub fn table_mut<'t, A: PhysAccess>(phys: &A, table: Pfn) -> &'t mut PageTable {
    unsafe { &mut *phys.frame_ptr(table).cast::<PageTable>() }
}

/// Byte-wise copy of the directory in `src` into `dst`.
///
/// Fresh process directories start as copies of the kernel directory and
/// diverge only below the kernel split.
pub fn copy_directory<A: PhysAccess>(phys: &A, dst: Pfn, src: Pfn) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            phys.frame_ptr(src),
            phys.frame_ptr(dst),
            PAGE_SIZE as usize,
        );
    }
}

/// Materializes the directory entry at `dir_index`, returning its table
/// frame.
///
/// A missing entry gets a zeroed table page and `{present, rw, user?,
/// global?, accessed=0, available=1}`. An existing entry has `present`,
/// `rw` and `user` widened monotonically; `global` is one-way: removing it
/// would punch a hole into every address space sharing the mapping, so a
/// mismatch is asserted as a kernel bug.
fn ensure_table<A: PhysAccess, T: TableAlloc>(
    phys: &A,
    tables: &mut T,
    pgd: Pfn,
    dir_index: usize,
    flags: MapFlags,
) -> Result<Pfn, VmemError> {
    let dir = directory_mut(phys, pgd);
    let entry = &mut dir.entries[dir_index];
    if !entry.present() {
        let table = tables.alloc_table().ok_or(VmemError::OutOfMemory)?;
        let mut fresh = PageDirectoryEntry::new();
        // Present from the start: the tables exist even where the pages are
        // still to be faulted in lazily.
        fresh.set_present(true);
        fresh.set_rw(true);
        fresh.set_user(flags.contains(MapFlags::USER));
        fresh.set_global(flags.contains(MapFlags::GLOBAL));
        fresh.set_accessed(false);
        fresh.set_available(1);
        fresh.set_frame(table.as_u32());
        *entry = fresh;
        return Ok(table);
    }
    entry.set_rw(entry.rw() || flags.contains(MapFlags::RW));
    entry.set_user(entry.user() || flags.contains(MapFlags::USER));
    debug_assert!(
        !entry.global() || flags.contains(MapFlags::GLOBAL),
        "global page table downgraded"
    );
    Ok(Pfn::new(entry.frame()))
}

/// A mutable cursor on one page-table slot.
pub struct PtSlot {
    entry: NonNull<PageTableEntry>,
    vpn: u32,
}

impl PtSlot {
    #[inline]
    #[must_use]
    pub fn vpn(&self) -> u32 {
        self.vpn
    }

    /// Base address of the page this slot maps.
    #[inline]
    #[must_use]
    pub fn address(&self) -> VirtualAddress {
        VirtualAddress::from_vpn(self.vpn)
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> PageTableEntry {
        unsafe { self.entry.as_ptr().read() }
    }

    #[inline]
    pub fn set(&mut self, entry: PageTableEntry) {
        unsafe { self.entry.as_ptr().write(entry) };
    }
}

/// Cursor over the table entries backing a virtual range.
///
/// Construction materializes the first directory entry; advancing across a
/// 4 MiB boundary materializes the next. Every slot the iterator yields is
/// therefore backed by an existing table.
pub struct PageRangeIter<'a, A: PhysAccess, T: TableAlloc> {
    phys: &'a A,
    tables: &'a mut T,
    pgd: Pfn,
    flags: MapFlags,
    vpn: u32,
    last_vpn: u32,
    table: Pfn,
}

impl<'a, A: PhysAccess, T: TableAlloc> PageRangeIter<'a, A, T> {
    pub fn new(
        phys: &'a A,
        tables: &'a mut T,
        pgd: Pfn,
        start: VirtualAddress,
        size: u32,
        flags: MapFlags,
    ) -> Result<Self, VmemError> {
        let vpn = start.vpn();
        let last_vpn =
            ((u64::from(start.as_u32()) + u64::from(size) + u64::from(PAGE_SIZE) - 1)
                / u64::from(PAGE_SIZE)) as u32;
        let table = ensure_table(phys, tables, pgd, (vpn / ENTRIES_PER_TABLE) as usize, flags)?;
        Ok(Self {
            phys,
            tables,
            pgd,
            flags,
            vpn,
            last_vpn,
            table,
        })
    }

    /// The next table-entry slot, or `Ok(None)` past the end of the range.
    pub fn next_slot(&mut self) -> Result<Option<PtSlot>, VmemError> {
        if self.vpn >= self.last_vpn {
            return Ok(None);
        }
        let table = table_mut(self.phys, self.table);
        let index = (self.vpn % ENTRIES_PER_TABLE) as usize;
        let slot = PtSlot {
            entry: NonNull::from(&mut table.entries[index]),
            vpn: self.vpn,
        };
        self.vpn += 1;
        if self.vpn % ENTRIES_PER_TABLE == 0 && self.vpn < self.last_vpn {
            self.table = ensure_table(
                self.phys,
                self.tables,
                self.pgd,
                (self.vpn / ENTRIES_PER_TABLE) as usize,
                self.flags,
            )?;
        }
        Ok(Some(slot))
    }
}

/// Rewrites the mapping of `[virt_start, virt_start + size)` in `pgd`.
///
/// For every page: with [`MapFlags::UPDADDR`] the successive physical frame
/// starting at `phys_start` is written; the permission/COW bits derived from
/// `flags` are always written. Each entry write is followed by a single-page
/// TLB invalidation.
pub fn update_range<A: PhysAccess, T: TableAlloc, M: Mmu>(
    phys: &A,
    tables: &mut T,
    mmu: &mut M,
    pgd: Pfn,
    virt_start: VirtualAddress,
    phys_start: PhysicalAddress,
    size: u32,
    flags: MapFlags,
) -> Result<(), VmemError> {
    let mut iter = PageRangeIter::new(phys, tables, pgd, virt_start, size, flags)?;
    let mut pfn = phys_start.pfn().as_u32();
    while let Some(mut slot) = iter.next_slot()? {
        let mut entry = slot.get();
        if flags.contains(MapFlags::UPDADDR) {
            entry.set_frame(pfn);
            pfn += 1;
        }
        apply_table_flags(&mut entry, flags);
        slot.set(entry);
        mmu.flush_page(slot.address());
    }
    Ok(())
}

/// Clones the mapping of a source range into a destination directory.
///
/// Walks both ranges in lockstep. A source slot marked `kernel_cow` becomes
/// a **lazy indirection**: the destination slot stays hardware-not-present
/// (only the COW marker set) and the link to the source slot is recorded in
/// `shadow`, to be resolved by the fault handler on first touch. Any other
/// source slot has its frame copied and `flags` applied. Either way the
/// destination page's TLB entry is invalidated.
#[allow(clippy::too_many_arguments)]
pub fn clone_range<A: PhysAccess, T: TableAlloc, M: Mmu>(
    phys: &A,
    tables: &mut T,
    mmu: &mut M,
    shadow: &mut ShadowCowTable,
    src_pgd: Pfn,
    dst_pgd: Pfn,
    src_start: VirtualAddress,
    dst_start: VirtualAddress,
    size: u32,
    flags: MapFlags,
) -> Result<(), VmemError> {
    let pages = size.div_ceil(PAGE_SIZE);
    let mut src_vpn = src_start.vpn();
    let mut dst_vpn = dst_start.vpn();
    // Sentinels force materialization on the first iteration.
    let mut src_dir = u32::MAX;
    let mut dst_dir = u32::MAX;
    let mut src_table = Pfn::new(0);
    let mut dst_table = Pfn::new(0);

    for _ in 0..pages {
        if src_vpn / ENTRIES_PER_TABLE != src_dir {
            src_dir = src_vpn / ENTRIES_PER_TABLE;
            src_table = ensure_table(phys, tables, src_pgd, src_dir as usize, flags)?;
        }
        if dst_vpn / ENTRIES_PER_TABLE != dst_dir {
            dst_dir = dst_vpn / ENTRIES_PER_TABLE;
            dst_table = ensure_table(phys, tables, dst_pgd, dst_dir as usize, flags)?;
        }

        let src_entry = table_mut(phys, src_table).entries[(src_vpn % ENTRIES_PER_TABLE) as usize];
        let dst_entry =
            &mut table_mut(phys, dst_table).entries[(dst_vpn % ENTRIES_PER_TABLE) as usize];

        if src_entry.kernel_cow() {
            let mut lazy = PageTableEntry::new();
            lazy.set_kernel_cow(true);
            lazy.set_available(1);
            *dst_entry = lazy;
            shadow.insert(
                dst_pgd,
                dst_vpn,
                SlotRef {
                    pgd: src_pgd,
                    vpn: src_vpn,
                },
            );
        } else {
            let mut copied = PageTableEntry::new();
            copied.set_frame(src_entry.frame());
            apply_table_flags(&mut copied, flags);
            *dst_entry = copied;
            shadow.remove(dst_pgd, dst_vpn);
        }
        mmu.flush_page(VirtualAddress::from_vpn(dst_vpn));

        src_vpn += 1;
        dst_vpn += 1;
    }
    Ok(())
}

/// Reads the table entry for `addr`, if its directory entry is present.
#[must_use]
pub fn read_entry<A: PhysAccess>(phys: &A, pgd: Pfn, addr: VirtualAddress) -> Option<PageTableEntry> {
    let dir = directory_mut(phys, pgd);
    let de = dir.entries[addr.directory_index()];
    if !de.present() {
        return None;
    }
    let table = table_mut(phys, Pfn::new(de.frame()));
    Some(table.entries[addr.table_index()])
}

/// Mutable cursor on the table entry for `addr`, if its directory entry is
/// present.
#[must_use]
pub fn entry_slot<A: PhysAccess>(phys: &A, pgd: Pfn, addr: VirtualAddress) -> Option<PtSlot> {
    let dir = directory_mut(phys, pgd);
    let de = dir.entries[addr.directory_index()];
    if !de.present() {
        return None;
    }
    let table = table_mut(phys, Pfn::new(de.frame()));
    Some(PtSlot {
        entry: NonNull::from(&mut table.entries[addr.table_index()]),
        vpn: addr.vpn(),
    })
}

/// Backing frame of `addr` in `pgd`, plus how many of `size` bytes its buddy
/// block still covers from there.
///
/// Teardown walks a range block-wise with this: the clamped size tells how
/// far the current block reaches before the next lookup.
#[must_use]
pub fn virt_to_page<A: PhysAccess>(
    phys: &A,
    frames: &FrameDb<'_>,
    pgd: Pfn,
    addr: VirtualAddress,
    size: u32,
) -> Option<(Pfn, u32)> {
    let entry = read_entry(phys, pgd, addr)?;
    let pfn = Pfn::new(entry.frame());
    let span = frames.block_bytes_remaining(pfn).unwrap_or(PAGE_SIZE);
    Some((pfn, size.min(span)))
}
