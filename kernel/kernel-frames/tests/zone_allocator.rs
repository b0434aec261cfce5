use kernel_frames::{BootLayout, FrameDb, GfpFlags, PageFrame, MAX_ORDER};
use kernel_memory_addresses::{PhysicalAddress, Pfn, VirtualAddress, PAGE_SIZE};

/// Normal zone: 4 MiB at 1 MiB. HighMem zone: 8 MiB above it.
fn layout() -> BootLayout {
    BootLayout {
        normal_start: PhysicalAddress::new(0x0010_0000),
        normal_end: PhysicalAddress::new(0x0050_0000),
        high_start: PhysicalAddress::new(0x0050_0000),
        high_end: PhysicalAddress::new(0x00D0_0000),
        lowmem_virt_base: VirtualAddress::new(0xC000_0000),
    }
}

fn descriptors() -> Vec<PageFrame> {
    let frames = (layout().high_end.as_u32() / PAGE_SIZE) as usize;
    (0..frames).map(|_| PageFrame::new()).collect()
}

#[test]
fn one_lowmem_frame_round_trip() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let addr = db.alloc_page_lowmem(GfpFlags::KERNEL).unwrap();
    assert!(db.window().contains_address(addr));
    assert!(!db.is_memory_clean(GfpFlags::KERNEL));

    db.free_page_lowmem(addr).unwrap();
    assert!(db.is_memory_clean(GfpFlags::KERNEL));
}

#[test]
fn five_user_frames_round_trip() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let pages: Vec<Pfn> = (0..5)
        .map(|_| db.alloc_pages(GfpFlags::HIGHUSER, 0).unwrap())
        .collect();
    for &p in &pages {
        assert_eq!(db.page_count(p), 1);
    }
    for p in pages {
        db.free_pages(p);
    }
    assert!(db.is_memory_clean(GfpFlags::HIGHUSER));
}

#[test]
fn order_three_block_round_trip() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let head = db.alloc_pages(GfpFlags::KERNEL, 3).unwrap();
    // Naturally aligned, contiguous, all counted.
    assert_eq!(head.as_u32() % 8, 0);
    for i in 0..8 {
        assert_eq!(db.page_count(head + i), 1);
        assert_eq!(db.block_of(head + i), Some((head, 3)));
    }
    db.free_pages(head);
    assert!(db.is_memory_clean(GfpFlags::KERNEL));
}

#[test]
fn mixed_orders_round_trip() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let blocks: Vec<Pfn> = (0u8..5)
        .map(|order| db.alloc_pages(GfpFlags::HIGHUSER, order).unwrap())
        .collect();
    for p in blocks.into_iter().rev() {
        db.free_pages(p);
    }
    assert!(db.is_memory_clean(GfpFlags::HIGHUSER));

    // Interleave orders in the kernel zone, free in allocation order.
    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(db.alloc_pages(GfpFlags::KERNEL, 0).unwrap());
    }
    for _ in 0..15 {
        held.push(db.alloc_pages(GfpFlags::KERNEL, 2).unwrap());
    }
    for p in held {
        db.free_pages(p);
    }
    assert!(db.is_memory_clean(GfpFlags::KERNEL));
}

#[test]
fn shared_block_needs_two_frees() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let head = db.alloc_pages(GfpFlags::HIGHUSER, 2).unwrap();
    for i in 0..4 {
        assert_eq!(db.page_inc(head + i), 2);
    }
    // First free only drops the extra reference.
    db.free_pages(head);
    assert!(!db.is_memory_clean(GfpFlags::HIGHUSER));
    for i in 0..4 {
        assert_eq!(db.page_count(head + i), 1);
    }
    // Second free releases the block.
    db.free_pages(head);
    assert!(db.is_memory_clean(GfpFlags::HIGHUSER));
}

#[test]
fn per_frame_release_frees_the_block_last() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let head = db.alloc_pages(GfpFlags::HIGHUSER, 1).unwrap();
    // Share one frame of the block, then release per frame.
    assert_eq!(db.page_inc(head), 2);
    db.release_frame(head);
    assert_eq!(db.page_dec(head), 0);
    assert!(!db.is_memory_clean(GfpFlags::HIGHUSER), "tail still held");
    db.release_frame(head + 1);
    assert!(db.is_memory_clean(GfpFlags::HIGHUSER));
}

#[test]
fn zone_space_accounting() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let total = db.total_space(GfpFlags::KERNEL);
    assert_eq!(total, 4 * 1024 * 1024);
    assert_eq!(db.free_space(GfpFlags::KERNEL), total);

    let head = db.alloc_pages(GfpFlags::KERNEL, 4).unwrap();
    assert_eq!(db.free_space(GfpFlags::KERNEL), total - 16 * u64::from(PAGE_SIZE));
    db.free_pages(head);
    assert_eq!(db.free_space(GfpFlags::KERNEL), total);
}

#[test]
fn block_remaining_walks_to_the_end() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    let head = db.alloc_pages(GfpFlags::HIGHUSER, 2).unwrap();
    assert_eq!(db.block_bytes_remaining(head), Some(4 * PAGE_SIZE));
    assert_eq!(db.block_bytes_remaining(head + 3), Some(PAGE_SIZE));
    db.free_pages(head);
    assert_eq!(db.block_bytes_remaining(head), None);
}

#[test]
fn exhaustion_returns_none() {
    let mut frames = descriptors();
    let mut db = FrameDb::new(&mut frames, &layout()).unwrap();

    // The Normal zone is exactly one max-order block.
    let head = db.alloc_pages(GfpFlags::KERNEL, MAX_ORDER).unwrap();
    assert!(db.alloc_pages(GfpFlags::KERNEL, 0).is_none());
    db.free_pages(head);
    assert!(db.is_memory_clean(GfpFlags::KERNEL));
}

#[test]
fn window_conversions_are_inverse() {
    let mut frames = descriptors();
    let db = FrameDb::new(&mut frames, &layout()).unwrap();

    let window = db.window();
    let pfn = Pfn::new(0x100);
    let va = window.address_of(pfn).unwrap();
    assert_eq!(va, VirtualAddress::new(0xC000_0000));
    assert_eq!(window.pfn_of(va), Some(pfn));
    // Out-of-window queries refuse.
    assert_eq!(window.pfn_of(VirtualAddress::new(0x1000)), None);
    assert!(window.address_of(Pfn::new(0)).is_none());
}
