use kernel_frames::arena::ArenaAccess;
use kernel_frames::{BootLayout, FrameDb, GfpFlags, PageFrame, PhysAccess};
use kernel_memory_addresses::{Pfn, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use kernel_vmem::{
    clone_range, directory_mut, read_entry, update_range, MapFlags, RecordingMmu, ShadowCowTable,
    TableAlloc,
};

fn layout() -> BootLayout {
    BootLayout {
        normal_start: PhysicalAddress::new(0x0010_0000),
        normal_end: PhysicalAddress::new(0x0090_0000),
        high_start: PhysicalAddress::new(0x0090_0000),
        high_end: PhysicalAddress::new(0x0110_0000),
        lowmem_virt_base: VirtualAddress::new(0xC000_0000),
    }
}

struct Fixture {
    frames: Vec<PageFrame>,
    arena: ArenaAccess,
}

impl Fixture {
    fn new() -> Self {
        let frame_count = layout().high_end.as_u32() / PAGE_SIZE;
        Self {
            frames: (0..frame_count).map(|_| PageFrame::new()).collect(),
            arena: ArenaAccess::new(frame_count),
        }
    }
}

/// Table frames straight from the zone allocator, zeroed on hand-out.
struct FrameTables<'a, 'f> {
    db: &'a mut FrameDb<'f>,
    arena: &'a ArenaAccess,
}

impl TableAlloc for FrameTables<'_, '_> {
    fn alloc_table(&mut self) -> Option<Pfn> {
        let pfn = self.db.alloc_pages(GfpFlags::KERNEL, 0)?;
        unsafe { self.arena.zero_frames(pfn, 1) };
        Some(pfn)
    }

    fn free_table(&mut self, table: Pfn) {
        self.db.free_pages(table);
    }
}

fn fresh_directory(db: &mut FrameDb<'_>, arena: &ArenaAccess) -> Pfn {
    let pgd = db.alloc_pages(GfpFlags::KERNEL, 0).unwrap();
    unsafe { arena.zero_frames(pgd, 1) };
    pgd
}

#[test]
fn update_range_installs_and_flushes() {
    let mut fx = Fixture::new();
    let mut db = FrameDb::new(&mut fx.frames, &layout()).unwrap();
    let pgd = fresh_directory(&mut db, &fx.arena);
    let mut mmu = RecordingMmu::new(pgd);

    let virt = VirtualAddress::new(0x0800_0000);
    let backing = db.alloc_pages(GfpFlags::HIGHUSER, 2).unwrap();
    let mut tables = FrameTables {
        db: &mut db,
        arena: &fx.arena,
    };
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        pgd,
        virt,
        backing.address(),
        4 * PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPDADDR,
    )
    .unwrap();

    for i in 0..4 {
        let e = read_entry(&fx.arena, pgd, virt + i * PAGE_SIZE).unwrap();
        assert!(e.present() && e.rw() && e.user());
        assert!(!e.kernel_cow());
        assert_eq!(e.frame(), backing.as_u32() + i);
        // No stale translation may survive for any page touched.
        assert!(mmu.was_flushed(virt + i * PAGE_SIZE));
    }

    // Untouched neighbors stay unmapped.
    let e = read_entry(&fx.arena, pgd, virt + 4 * PAGE_SIZE).unwrap();
    assert!(!e.present());
}

#[test]
fn directory_permissions_widen_monotonically() {
    let mut fx = Fixture::new();
    let mut db = FrameDb::new(&mut fx.frames, &layout()).unwrap();
    let pgd = fresh_directory(&mut db, &fx.arena);
    let mut mmu = RecordingMmu::new(pgd);

    let virt = VirtualAddress::new(0x0800_0000);
    let mut tables = FrameTables {
        db: &mut db,
        arena: &fx.arena,
    };
    // Kernel-only read mapping first.
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        pgd,
        virt,
        PhysicalAddress::zero(),
        PAGE_SIZE,
        MapFlags::PRESENT,
    )
    .unwrap();
    {
        let de = directory_mut(&fx.arena, pgd).entries[virt.directory_index()];
        assert!(de.present());
        assert!(!de.user());
    }

    // A later user mapping in the same 4 MiB region widens the entry.
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        pgd,
        virt + 0x1000,
        PhysicalAddress::zero(),
        PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::RW | MapFlags::USER,
    )
    .unwrap();
    let de = directory_mut(&fx.arena, pgd).entries[virt.directory_index()];
    assert!(de.present() && de.rw() && de.user());
}

#[test]
fn iterator_materializes_across_table_boundaries() {
    let mut fx = Fixture::new();
    let mut db = FrameDb::new(&mut fx.frames, &layout()).unwrap();
    let pgd = fresh_directory(&mut db, &fx.arena);
    let mut mmu = RecordingMmu::new(pgd);

    // Two pages straddling a 4 MiB directory boundary.
    let virt = VirtualAddress::new(0x083F_F000);
    let mut tables = FrameTables {
        db: &mut db,
        arena: &fx.arena,
    };
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        pgd,
        virt,
        PhysicalAddress::zero(),
        2 * PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::USER,
    )
    .unwrap();

    let dir = directory_mut(&fx.arena, pgd);
    let first = dir.entries[virt.directory_index()];
    let second = dir.entries[virt.directory_index() + 1];
    assert!(first.present() && second.present());
    assert_ne!(first.frame(), second.frame());
}

#[test]
fn clone_links_cow_sources_through_the_shadow_table() {
    let mut fx = Fixture::new();
    let mut db = FrameDb::new(&mut fx.frames, &layout()).unwrap();
    let src_pgd = fresh_directory(&mut db, &fx.arena);
    let dst_pgd = fresh_directory(&mut db, &fx.arena);
    let mut mmu = RecordingMmu::new(src_pgd);
    let mut shadow = ShadowCowTable::new();

    let virt = VirtualAddress::new(0x0800_0000);
    let backing = db.alloc_pages(GfpFlags::HIGHUSER, 1).unwrap();
    let mut tables = FrameTables {
        db: &mut db,
        arena: &fx.arena,
    };
    // Source: page 0 COW-shared, page 1 a plain present mapping.
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        src_pgd,
        virt,
        backing.address(),
        PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::USER | MapFlags::COW | MapFlags::UPDADDR,
    )
    .unwrap();
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        src_pgd,
        virt + PAGE_SIZE,
        (backing + 1).address(),
        PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPDADDR,
    )
    .unwrap();
    mmu.clear();

    clone_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        &mut shadow,
        src_pgd,
        dst_pgd,
        virt,
        virt,
        2 * PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::USER | MapFlags::COW | MapFlags::UPDADDR,
    )
    .unwrap();

    // COW source: destination is a lazy indirection, hardware-not-present.
    let lazy = read_entry(&fx.arena, dst_pgd, virt).unwrap();
    assert!(!lazy.present());
    assert!(lazy.kernel_cow());
    let slot = shadow.get(dst_pgd, virt.vpn()).unwrap();
    assert_eq!(slot.pgd, src_pgd);
    assert_eq!(slot.vpn, virt.vpn());

    // Plain source: frame copied, flags applied.
    let copied = read_entry(&fx.arena, dst_pgd, virt + PAGE_SIZE).unwrap();
    assert!(copied.present());
    assert_eq!(copied.frame(), backing.as_u32() + 1);
    assert!(shadow.get(dst_pgd, virt.vpn() + 1).is_none());

    // Both destination pages were invalidated.
    assert!(mmu.was_flushed(virt));
    assert!(mmu.was_flushed(virt + PAGE_SIZE));
}

#[test]
fn virt_to_page_reports_block_reach() {
    let mut fx = Fixture::new();
    let mut db = FrameDb::new(&mut fx.frames, &layout()).unwrap();
    let pgd = fresh_directory(&mut db, &fx.arena);
    let mut mmu = RecordingMmu::new(pgd);

    let virt = VirtualAddress::new(0x0800_0000);
    let backing = db.alloc_pages(GfpFlags::HIGHUSER, 2).unwrap();
    let mut tables = FrameTables {
        db: &mut db,
        arena: &fx.arena,
    };
    update_range(
        &fx.arena,
        &mut tables,
        &mut mmu,
        pgd,
        virt,
        backing.address(),
        4 * PAGE_SIZE,
        MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPDADDR,
    )
    .unwrap();

    let (pfn, span) = kernel_vmem::virt_to_page(&fx.arena, &db, pgd, virt, u32::MAX).unwrap();
    assert_eq!(pfn, backing);
    assert_eq!(span, 4 * PAGE_SIZE);

    // From the middle of the block only the tail remains.
    let (pfn, span) =
        kernel_vmem::virt_to_page(&fx.arena, &db, pgd, virt + 3 * PAGE_SIZE, u32::MAX).unwrap();
    assert_eq!(pfn, backing + 3);
    assert_eq!(span, PAGE_SIZE);
}
