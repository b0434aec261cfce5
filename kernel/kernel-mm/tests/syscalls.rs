use kernel_frames::arena::ArenaAccess;
use kernel_frames::{BootLayout, GfpFlags, PageFrame};
use kernel_memory_addresses::{layout, Pfn, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use kernel_mm::{MemoryCore, MmError};
use kernel_vmem::{read_entry, MapFlags, RecordingMmu};

fn boot_layout() -> BootLayout {
    BootLayout {
        normal_start: PhysicalAddress::new(0x0010_0000),
        normal_end: PhysicalAddress::new(0x0090_0000),
        high_start: PhysicalAddress::new(0x0090_0000),
        high_end: PhysicalAddress::new(0x0110_0000),
        lowmem_virt_base: layout::LOWMEM_BASE,
    }
}

fn descriptors() -> Vec<PageFrame> {
    let frames = (boot_layout().high_end.as_u32() / PAGE_SIZE) as usize;
    (0..frames).map(|_| PageFrame::new()).collect()
}

fn core_init(frames: &mut [PageFrame]) -> MemoryCore<'_, ArenaAccess, RecordingMmu> {
    let arena = ArenaAccess::new(boot_layout().high_end.as_u32() / PAGE_SIZE);
    MemoryCore::init(frames, &boot_layout(), arena, RecordingMmu::new(Pfn::new(0))).unwrap()
}

const USER_RW: MapFlags = MapFlags::PRESENT.union(MapFlags::RW).union(MapFlags::USER);

#[test]
fn mmap_honors_a_free_hint() {
    let mut frames = descriptors();
    let mut core = core_init(&mut frames);
    let mut mm = core.create_blank_process_image(0x4000).unwrap();

    let hint = VirtualAddress::new(0x0800_0000);
    let got = core.sys_mmap(&mut mm, Some(hint), 0x3000).unwrap();
    assert_eq!(got, hint);
    assert_eq!(mm.map_count(), 2);

    // The mapping is lazy: present comes with the first fault.
    let entry = read_entry(core.phys(), mm.pgd(), got).unwrap();
    assert!(!entry.present() && entry.kernel_cow());

    core.destroy_process_image(mm);
}

#[test]
fn mmap_falls_back_to_gap_search() {
    let mut frames = descriptors();
    let mut core = core_init(&mut frames);
    let mut mm = core.create_blank_process_image(0x4000).unwrap();

    // With a single area there is no between-areas gap yet.
    assert!(core.sys_mmap(&mut mm, None, 0x1000).is_none());

    // A second area opens a gap; an occupied hint must divert into it.
    core.create_vm_area(
        &mut mm,
        VirtualAddress::new(0x0800_0000),
        0x2000,
        USER_RW,
        GfpFlags::HIGHUSER,
    );
    let got = core.sys_mmap(&mut mm, Some(VirtualAddress::new(0x0800_0000)), 0x1000).unwrap();
    assert_ne!(got, VirtualAddress::new(0x0800_0000));
    assert_eq!(mm.is_valid_range(got, got + 0x1000), kernel_mm::RangeCheck::Overlap);

    core.destroy_process_image(mm);
}

#[test]
fn munmap_requires_an_exact_match() {
    let mut frames = descriptors();
    let mut core = core_init(&mut frames);
    let mut mm = core.create_blank_process_image(0x4000).unwrap();

    let addr = core.sys_mmap(&mut mm, Some(VirtualAddress::new(0x0800_0000)), 0x2000).unwrap();

    assert_eq!(
        core.sys_munmap(&mut mm, addr, 0x1000),
        Err(MmError::NotFound)
    );
    assert_eq!(
        core.sys_munmap(&mut mm, addr + 0x1000, 0x1000),
        Err(MmError::NotFound)
    );
    assert_eq!(core.sys_munmap(&mut mm, addr, 0x2000), Ok(()));
    assert_eq!(mm.map_count(), 1);

    core.destroy_process_image(mm);
}

#[test]
fn brk_carves_a_heap_and_moves_the_break() {
    let mut frames = descriptors();
    let mut core = core_init(&mut frames);
    let mut mm = core.create_blank_process_image(0x4000).unwrap();

    // First call carves the heap area and reports the break.
    let brk = core.sys_brk(&mut mm, None).unwrap();
    assert_eq!(brk, mm.start_brk);
    assert_eq!(mm.start_brk, layout::PROCAREA_START);
    assert_eq!(mm.map_count(), 2);

    // Moving within the heap works and sticks.
    let target = brk + 0x2000;
    assert_eq!(core.sys_brk(&mut mm, Some(target)), Some(target));
    assert_eq!(core.sys_brk(&mut mm, None), Some(target));

    // Requests outside the heap are refused, break unchanged.
    assert_eq!(core.sys_brk(&mut mm, Some(VirtualAddress::new(0x4000_0000))), None);
    assert_eq!(core.sys_brk(&mut mm, None), Some(target));

    core.destroy_process_image(mm);
}

#[test]
fn kmalloc_through_the_core() {
    let mut frames = descriptors();
    let mut core = core_init(&mut frames);

    let p = core.kmalloc(96).unwrap();
    let q = core.kmalloc(96).unwrap();
    assert_ne!(p, q);
    core.kfree(p);
    core.kfree(q);

    // Same size class reuses the most recently freed slot.
    let r = core.kmalloc(96).unwrap();
    assert_eq!(r, q);
    core.kfree(r);
}
