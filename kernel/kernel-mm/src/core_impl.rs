use crate::fault::{fault_panic, FaultOutcome, PageFaultError};
use crate::sched::{Scheduler, SIGSEGV};
use crate::scratch::ScratchWindow;
use crate::vma::{Mm, RangeCheck, VmArea};
use core::fmt;
use core::ptr::NonNull;
use kernel_frames::{
    order_for_range, BootLayout, FrameDb, GfpFlags, PageFrame, PhysAccess,
};
use kernel_memory_addresses::{
    layout, Pfn, PhysicalAddress, VirtualAddress, ENTRIES_PER_TABLE, PAGE_SIZE,
};
use kernel_slab::{KmemCache, SlabAllocator};
use kernel_vmem::{
    apply_table_flags, clone_range, copy_directory, directory_mut, entry_slot, read_entry,
    update_range, MapFlags, Mmu, PtSlot, ShadowCowTable, TableAlloc, VmemError,
};
use log::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// The boot layout was rejected by the frame database.
    BadLayout,
    /// The zone or slab allocator ran dry.
    OutOfMemory,
    /// No matching virtual memory area.
    NotFound,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLayout => write!(f, "malformed physical memory layout"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NotFound => write!(f, "no such virtual memory area"),
        }
    }
}

/// Slab constructor for page-table and page-directory objects: fresh tables
/// must read as empty. Freed table objects are re-zeroed before going back
/// to their cache, so this holds for reused objects too.
fn zero_page_object(obj: NonNull<u8>) {
    unsafe { core::ptr::write_bytes(obj.as_ptr(), 0, PAGE_SIZE as usize) };
}

/// [`TableAlloc`] over the page-table slab cache.
struct TableSource<'a, 'f, A: PhysAccess> {
    cache: NonNull<KmemCache>,
    frames: &'a mut FrameDb<'f>,
    phys: &'a A,
}

impl<A: PhysAccess> TableAlloc for TableSource<'_, '_, A> {
    fn alloc_table(&mut self) -> Option<Pfn> {
        let mut cache = self.cache;
        let obj = unsafe { cache.as_mut() }.alloc(self.frames, self.phys, GfpFlags::KERNEL)?;
        self.phys.pfn_of_ptr(obj.as_ptr())
    }

    fn free_table(&mut self, table: Pfn) {
        let ptr = self.phys.frame_ptr(table);
        // Keep the cache's all-objects-zeroed contract.
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
        kernel_slab::free_object(
            self.frames,
            self.phys,
            NonNull::new(ptr).expect("table pointer"),
        );
    }
}

/// Bulk page-table update with table allocation from the table cache.
fn map_update<A: PhysAccess, M: Mmu>(
    frames: &mut FrameDb<'_>,
    phys: &A,
    mmu: &mut M,
    table_cache: NonNull<KmemCache>,
    pgd: Pfn,
    virt: VirtualAddress,
    phys_start: PhysicalAddress,
    size: u32,
    flags: MapFlags,
) -> Result<(), VmemError> {
    let mut tables = TableSource {
        cache: table_cache,
        frames,
        phys,
    };
    update_range(phys, &mut tables, mmu, pgd, virt, phys_start, size, flags)
}

/// The memory core: every process-wide singleton of the memory subsystems,
/// held in one explicit context.
///
/// `A` is the physical-access seam (low-memory window plus scratch mappings
/// on bare metal, a byte arena in hosted tests); `M` is the MMU (CR3 and
/// `invlpg`, or a recording double).
pub struct MemoryCore<'f, A: PhysAccess, M: Mmu> {
    frames: FrameDb<'f>,
    phys: A,
    mmu: M,
    slab: SlabAllocator,
    pgdir_cache: NonNull<KmemCache>,
    pgtbl_cache: NonNull<KmemCache>,
    shadow: ShadowCowTable,
    scratch: ScratchWindow,
    kernel_mm: Mm,
}

impl<'f, A: PhysAccess, M: Mmu> MemoryCore<'f, A, M> {
    /// Brings up the whole memory core over the boot-provided physical
    /// layout: frame database, slab system, the kernel address space with
    /// its global mappings, and the scratch window.
    pub fn init(
        descriptors: &'f mut [PageFrame],
        boot: &BootLayout,
        phys: A,
        mut mmu: M,
    ) -> Result<Self, MmError> {
        let mut frames = FrameDb::new(descriptors, boot).map_err(|e| {
            error!(target: "pmm", "frame database rejected the boot layout: {e}");
            MmError::BadLayout
        })?;
        let mut slab =
            SlabAllocator::init(&mut frames, &phys).map_err(|_| MmError::OutOfMemory)?;
        let pgdir_cache = slab
            .cache_create(
                "page_directory",
                PAGE_SIZE,
                PAGE_SIZE,
                GfpFlags::KERNEL,
                Some(zero_page_object),
                None,
                &mut frames,
                &phys,
            )
            .map_err(|_| MmError::OutOfMemory)?;
        let pgtbl_cache = slab
            .cache_create(
                "page_table",
                PAGE_SIZE,
                PAGE_SIZE,
                GfpFlags::KERNEL,
                Some(zero_page_object),
                None,
                &mut frames,
                &phys,
            )
            .map_err(|_| MmError::OutOfMemory)?;

        // The kernel address space.
        let mut dir_cache = pgdir_cache;
        let pgd_obj = unsafe { dir_cache.as_mut() }
            .alloc(&mut frames, &phys, GfpFlags::KERNEL)
            .ok_or(MmError::OutOfMemory)?;
        let pgd = phys
            .pfn_of_ptr(pgd_obj.as_ptr())
            .expect("directory object outside physical reach");
        let kernel_mm = Mm::new(pgd, pgd_obj);

        // Global mappings, shared by every process directory and never
        // removed: the identity-mapped first megabyte (BIOS data, video
        // memory), the direct low-memory window, and the scratch window
        // (tables only; its entries are written per mapping).
        let global_rw =
            MapFlags::PRESENT | MapFlags::RW | MapFlags::GLOBAL | MapFlags::UPDADDR;
        map_update(
            &mut frames,
            &phys,
            &mut mmu,
            pgtbl_cache,
            pgd,
            VirtualAddress::zero(),
            PhysicalAddress::zero(),
            layout::IDENTITY_END.as_u32(),
            global_rw,
        )
        .map_err(|_| MmError::OutOfMemory)?;
        let window = *frames.window();
        map_update(
            &mut frames,
            &phys,
            &mut mmu,
            pgtbl_cache,
            pgd,
            window.virt_base(),
            window.first_pfn().address(),
            window.frame_count() * PAGE_SIZE,
            global_rw,
        )
        .map_err(|_| MmError::OutOfMemory)?;
        map_update(
            &mut frames,
            &phys,
            &mut mmu,
            pgtbl_cache,
            pgd,
            layout::VMAP_BASE,
            PhysicalAddress::zero(),
            layout::VMAP_SIZE,
            MapFlags::RW | MapFlags::GLOBAL,
        )
        .map_err(|_| MmError::OutOfMemory)?;

        mmu.switch_directory(pgd);
        info!(target: "paging", "kernel address space ready, directory at frame {pgd}");

        Ok(Self {
            frames,
            phys,
            mmu,
            slab,
            pgdir_cache,
            pgtbl_cache,
            shadow: ShadowCowTable::new(),
            scratch: ScratchWindow::new(layout::VMAP_BASE, layout::VMAP_SIZE),
            kernel_mm,
        })
    }

    #[inline]
    #[must_use]
    pub fn frames(&self) -> &FrameDb<'f> {
        &self.frames
    }

    #[inline]
    pub fn frames_mut(&mut self) -> &mut FrameDb<'f> {
        &mut self.frames
    }

    #[inline]
    #[must_use]
    pub fn phys(&self) -> &A {
        &self.phys
    }

    #[inline]
    #[must_use]
    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }

    #[inline]
    #[must_use]
    pub fn kernel_mm(&self) -> &Mm {
        &self.kernel_mm
    }

    #[inline]
    #[must_use]
    pub fn shadow(&self) -> &ShadowCowTable {
        &self.shadow
    }

    /// Size-bucketed kernel allocation; see the slab crate.
    pub fn kmalloc(&mut self, size: u32) -> Option<NonNull<u8>> {
        let Self {
            frames, phys, slab, ..
        } = self;
        slab.kmalloc(size, frames, phys)
    }

    /// Frees a `kmalloc`/cache allocation by pointer.
    pub fn kfree(&mut self, ptr: NonNull<u8>) {
        let Self {
            frames, phys, slab, ..
        } = self;
        slab.free(ptr, frames, phys);
    }

    /// Allocates a blank address space whose directory starts as a byte-wise
    /// copy of the kernel directory.
    fn alloc_mm(&mut self) -> Result<Mm, MmError> {
        let mut cache = self.pgdir_cache;
        let pgd_obj = unsafe { cache.as_mut() }
            .alloc(&mut self.frames, &self.phys, GfpFlags::KERNEL)
            .ok_or(MmError::OutOfMemory)?;
        let pgd = self
            .phys
            .pfn_of_ptr(pgd_obj.as_ptr())
            .expect("directory object outside physical reach");
        copy_directory(&self.phys, pgd, self.kernel_mm.pgd());
        Ok(Mm::new(pgd, pgd_obj))
    }

    /// Creates a virtual memory area in `mm`.
    ///
    /// With [`MapFlags::COW`] the mapping is installed not-present and
    /// faulted in lazily; otherwise frames are allocated eagerly at the
    /// order covering the range and mapped present.
    ///
    /// # Panics
    /// On a range conflict (a kernel invariant violation by the caller) and
    /// on out-of-memory, which has no recovery on this path.
    pub fn create_vm_area(
        &mut self,
        mm: &mut Mm,
        vm_start: VirtualAddress,
        size: u32,
        pgflags: MapFlags,
        gfpflags: GfpFlags,
    ) -> usize {
        let vm_end = vm_start + size;
        match mm.is_valid_range(vm_start, vm_end) {
            RangeCheck::Free => {}
            verdict => {
                error!(
                    target: "paging",
                    "virtual memory area [{vm_start}, {vm_end}) rejected: {verdict:?}"
                );
                panic!("wrong virtual memory area range");
            }
        }
        let order = order_for_range(vm_start.as_u32(), size);
        let (phys_start, map_flags) = if pgflags.contains(MapFlags::COW) {
            (
                PhysicalAddress::zero(),
                pgflags & !(MapFlags::PRESENT | MapFlags::UPDADDR),
            )
        } else {
            let head = self
                .frames
                .alloc_pages(gfpflags, order)
                .unwrap_or_else(|| panic!("out of memory backing a virtual memory area"));
            (head.address(), pgflags | MapFlags::UPDADDR)
        };
        map_update(
            &mut self.frames,
            &self.phys,
            &mut self.mmu,
            self.pgtbl_cache,
            mm.pgd(),
            vm_start,
            phys_start,
            size,
            map_flags,
        )
        .unwrap_or_else(|e| panic!("mapping a fresh virtual memory area failed: {e}"));

        let index = mm.insert_area(VmArea {
            start: vm_start,
            end: vm_end,
            flags: pgflags,
        });
        mm.total_vm += 1 << order;
        index
    }

    /// Clones area `index` of `src` into `dst`.
    ///
    /// With `cow == false` fresh frames are allocated, mapped writable, and
    /// the source contents copied. With `cow == true` the source mapping is
    /// downgraded to COW read-only (taking one reference per backing frame
    /// for the new sharer) and the destination installed as lazy
    /// indirections resolved on first write.
    pub fn clone_vm_area(
        &mut self,
        dst: &mut Mm,
        src: &Mm,
        index: usize,
        cow: bool,
        gfpflags: GfpFlags,
    ) -> Result<usize, MmError> {
        let area = src.area(index).clone();
        let size = area.size();
        let order = order_for_range(area.start.as_u32(), size);

        if cow {
            self.share_range_cow(src.pgd(), area.start, size);
            let Self {
                frames,
                phys,
                mmu,
                shadow,
                pgtbl_cache,
                ..
            } = self;
            let phys: &A = phys;
            let mut tables = TableSource {
                cache: *pgtbl_cache,
                frames,
                phys,
            };
            clone_range(
                phys,
                &mut tables,
                mmu,
                shadow,
                src.pgd(),
                dst.pgd(),
                area.start,
                area.start,
                size,
                MapFlags::COW | MapFlags::PRESENT | MapFlags::UPDADDR | MapFlags::USER,
            )
            .map_err(|_| MmError::OutOfMemory)?;
        } else {
            let head = self
                .frames
                .alloc_pages(gfpflags, order)
                .ok_or(MmError::OutOfMemory)?;
            map_update(
                &mut self.frames,
                &self.phys,
                &mut self.mmu,
                self.pgtbl_cache,
                dst.pgd(),
                area.start,
                head.address(),
                size,
                MapFlags::RW | MapFlags::PRESENT | MapFlags::UPDADDR | MapFlags::USER,
            )
            .map_err(|_| MmError::OutOfMemory)?;
            self.copy_area_contents(src.pgd(), area.start, head, size);
        }

        let index = dst.insert_area(area);
        dst.total_vm += 1 << order;
        Ok(index)
    }

    /// Downgrades every present page of the range to COW read-only and takes
    /// one reference per backing frame for the sharer about to be created.
    fn share_range_cow(&mut self, pgd: Pfn, start: VirtualAddress, size: u32) {
        let pages = Mm::pages_spanned(start, size);
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            let Some(mut slot) = entry_slot(&self.phys, pgd, va) else {
                continue;
            };
            let mut entry = slot.get();
            if !entry.present() {
                continue;
            }
            entry.set_rw(false);
            entry.set_kernel_cow(true);
            slot.set(entry);
            self.frames.page_inc(Pfn::new(entry.frame()));
            self.mmu.flush_page(va);
        }
    }

    /// Copies the contents of a source range into a freshly mapped
    /// destination block, page by page through the physical-access seam.
    /// Source pages that were never faulted in read as zeroes.
    fn copy_area_contents(
        &mut self,
        src_pgd: Pfn,
        start: VirtualAddress,
        dst_head: Pfn,
        size: u32,
    ) {
        let pages = Mm::pages_spanned(start, size);
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            let dst = self.phys.frame_ptr(dst_head + i);
            match read_entry(&self.phys, src_pgd, va) {
                Some(entry) if entry.present() => unsafe {
                    core::ptr::copy_nonoverlapping(
                        self.phys.frame_ptr(Pfn::new(entry.frame())),
                        dst,
                        PAGE_SIZE as usize,
                    );
                },
                _ => unsafe {
                    core::ptr::write_bytes(dst, 0, PAGE_SIZE as usize);
                },
            }
        }
    }

    /// Clears one table entry (if its table exists) and invalidates the
    /// translation.
    fn clear_entry(&mut self, pgd: Pfn, va: VirtualAddress) {
        if let Some(mut slot) = entry_slot(&self.phys, pgd, va) {
            slot.set(kernel_vmem::PageTableEntry::new());
        }
        self.mmu.flush_page(va);
    }

    /// Unmaps and unlinks area `index` of `mm`, releasing its backing.
    ///
    /// Walks the range page by page: present frames lose one reference
    /// (freeing their buddy block once its last frame reference is gone),
    /// unresolved lazy pages drop the reference their indirection held on
    /// the source frame.
    pub fn destroy_vm_area(&mut self, mm: &mut Mm, index: usize) {
        let area = mm.remove_area(index);
        let order = order_for_range(area.start.as_u32(), area.size());
        let pages = Mm::pages_spanned(area.start, area.size());
        for i in 0..pages {
            let va = area.start + i * PAGE_SIZE;
            match read_entry(&self.phys, mm.pgd(), va) {
                Some(entry) if entry.present() => {
                    self.frames.release_frame(Pfn::new(entry.frame()));
                }
                _ => {
                    if let Some(source) = self.shadow.remove(mm.pgd(), va.vpn()) {
                        if let Some(src_slot) = entry_slot(
                            &self.phys,
                            source.pgd,
                            VirtualAddress::from_vpn(source.vpn),
                        ) {
                            let se = src_slot.get();
                            if se.present() {
                                self.frames.release_frame(Pfn::new(se.frame()));
                            }
                        }
                    }
                }
            }
            self.clear_entry(mm.pgd(), va);
        }
        mm.total_vm -= 1 << order;
    }

    /// Creates a blank process image: a copy of the kernel directory plus a
    /// single lazily-faulted user stack ending at the top of the process
    /// area.
    pub fn create_blank_process_image(&mut self, stack_size: u32) -> Result<Mm, MmError> {
        let mut mm = self.alloc_mm()?;
        let stack_start = VirtualAddress::new(layout::PROCAREA_END.as_u32() - stack_size);
        self.create_vm_area(
            &mut mm,
            stack_start,
            stack_size,
            MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::COW,
            GfpFlags::HIGHUSER,
        );
        mm.start_stack = stack_start;
        Ok(mm)
    }

    /// Clones an address space for fork.
    ///
    /// The new directory starts from the **kernel** directory, not from a
    /// copy of the source's, since sharing page-table pages would alias
    /// later mutations. Every area is then cloned copy-on-write: both sides end up
    /// read-only on shared frames and diverge on first write.
    pub fn clone_process_image(&mut self, src: &Mm) -> Result<Mm, MmError> {
        let mut mm = self.alloc_mm()?;
        mm.start_stack = src.start_stack;
        mm.start_brk = src.start_brk;
        mm.brk = src.brk;
        for index in 0..src.areas().len() {
            self.clone_vm_area(&mut mm, src, index, true, GfpFlags::HIGHUSER)?;
        }
        Ok(mm)
    }

    /// Tears an address space down: every area, every lazy link, every
    /// non-global page table, then the directory itself.
    ///
    /// If the hardware is currently translating through this directory, it
    /// is switched to the kernel directory first.
    pub fn destroy_process_image(&mut self, mut mm: Mm) {
        if self.mmu.current_directory() == mm.pgd() {
            self.mmu.switch_directory(self.kernel_mm.pgd());
        }

        while mm.map_count() > 0 {
            self.destroy_vm_area(&mut mm, 0);
        }

        // Lazy pages elsewhere that shadowed this space lose their source;
        // drop the references those links carried. Their owners fault in
        // fresh zeroed pages later.
        for source in self.shadow.drain_sources(mm.pgd()) {
            if let Some(slot) = entry_slot(
                &self.phys,
                source.pgd,
                VirtualAddress::from_vpn(source.vpn),
            ) {
                let entry = slot.get();
                if entry.present() {
                    self.frames.release_frame(Pfn::new(entry.frame()));
                }
            }
        }
        self.shadow.remove_directory(mm.pgd());

        // Free every page table this space materialized for itself. Global
        // entries are the kernel's shared mappings and must survive.
        for i in 0..ENTRIES_PER_TABLE as usize {
            let entry = directory_mut(&self.phys, mm.pgd()).entries[i];
            if entry.present() && !entry.global() {
                self.free_table(Pfn::new(entry.frame()));
            }
        }

        // The directory object goes back to its cache zeroed, keeping the
        // cache's constructor contract.
        unsafe {
            core::ptr::write_bytes(mm.pgd_object().as_ptr(), 0, PAGE_SIZE as usize);
        }
        let Self {
            frames, phys, slab, ..
        } = self;
        slab.free(mm.pgd_object(), frames, phys);
    }

    fn free_table(&mut self, table: Pfn) {
        let ptr = self.phys.frame_ptr(table);
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
        let Self {
            frames, phys, slab, ..
        } = self;
        slab.free(
            NonNull::new(ptr).expect("table pointer"),
            frames,
            phys,
        );
    }

    /// Resolves copy-on-write on one table entry.
    ///
    /// Clears the COW marker; a not-present entry gets a fresh zeroed
    /// user-zone frame, a present one gets its write access back. Returns
    /// `false` when the entry was not COW at all, or no frame could be had.
    fn resolve_cow(&mut self, slot: &mut PtSlot) -> bool {
        let mut entry = slot.get();
        if !entry.kernel_cow() {
            error!(target: "paging", "page not copy-on-write");
            return false;
        }
        entry.set_kernel_cow(false);
        if entry.present() {
            entry.set_rw(true);
        } else {
            let Some(pfn) = self.frames.alloc_pages(GfpFlags::HIGHUSER, 0) else {
                return false;
            };
            unsafe { self.phys.zero_frames(pfn, 1) };
            entry.set_frame(pfn.as_u32());
            entry.set_present(true);
        }
        slot.set(entry);
        true
    }

    /// The page-fault handler.
    ///
    /// `fault_addr` is the faulting linear address (CR2), `err` the error
    /// code the CPU pushed. Resolves demand paging and copy-on-write against
    /// the directory the MMU is currently translating through; illegal user
    /// accesses become `SIGSEGV` plus a scheduler re-entry, anything
    /// indicating corrupt kernel state panics. The TLB entry of the faulting
    /// page is invalidated after any repair.
    pub fn handle_page_fault<S: Scheduler>(
        &mut self,
        fault_addr: VirtualAddress,
        err: PageFaultError,
        sched: &mut S,
    ) -> FaultOutcome {
        let pgd = self.mmu.current_directory();
        let dir_entry = directory_mut(&self.phys, pgd).entries[fault_addr.directory_index()];
        if !dir_entry.present() {
            if err.user() {
                if let Some(pid) = sched.current() {
                    warn!(
                        target: "paging",
                        "segmentation fault: pid {pid} at {fault_addr} ({})",
                        err.explain()
                    );
                    sched.post_signal(pid, SIGSEGV);
                    sched.reschedule();
                    return FaultOutcome::Signalled;
                }
            }
            fault_panic(fault_addr, err, "no page table for a kernel access");
        }

        let mut slot =
            entry_slot(&self.phys, pgd, fault_addr).expect("directory entry checked present");

        if self.scratch.contains(fault_addr) {
            // A kernel access through the scratch window hit a lazy clone:
            // resolve the source mapping, then mirror its frame here.
            let Some(source) = self.shadow.get(pgd, fault_addr.vpn()) else {
                fault_panic(fault_addr, err, "scratch mapping with no shadow link");
            };
            let Some(mut src_slot) = entry_slot(
                &self.phys,
                source.pgd,
                VirtualAddress::from_vpn(source.vpn),
            ) else {
                fault_panic(fault_addr, err, "shadow link to a missing table");
            };
            if !self.resolve_cow(&mut src_slot) {
                fault_panic(fault_addr, err, "unresolvable scratch-window fault");
            }
            let mut entry = slot.get();
            entry.set_frame(src_slot.get().frame());
            apply_table_flags(
                &mut entry,
                MapFlags::PRESENT
                    | MapFlags::RW
                    | MapFlags::GLOBAL
                    | MapFlags::COW
                    | MapFlags::UPDADDR,
            );
            slot.set(entry);
            self.shadow.remove(pgd, fault_addr.vpn());
        } else {
            let entry = slot.get();
            if entry.kernel_cow() {
                let from_clone = if entry.present() {
                    None
                } else {
                    self.shadow.remove(pgd, fault_addr.vpn())
                };
                if let Some(source) = from_clone {
                    // The sharing ends here: the source gets its write
                    // access back and this space's claim on the shared
                    // frame is dropped.
                    if let Some(mut src_slot) = entry_slot(
                        &self.phys,
                        source.pgd,
                        VirtualAddress::from_vpn(source.vpn),
                    ) {
                        let mut se = src_slot.get();
                        if se.present() {
                            if se.kernel_cow() {
                                se.set_kernel_cow(false);
                                se.set_rw(true);
                                src_slot.set(se);
                            }
                            self.frames.release_frame(Pfn::new(se.frame()));
                        }
                    }
                }
                if !self.resolve_cow(&mut slot) {
                    fault_panic(fault_addr, err, "out of memory resolving copy-on-write");
                }
                if from_clone.is_some() {
                    // Lazy clone entries carry no permissions of their own.
                    let mut entry = slot.get();
                    entry.set_rw(true);
                    entry.set_user(true);
                    slot.set(entry);
                }
            } else if err.user_write_protection() {
                if let Some(pid) = sched.current() {
                    warn!(
                        target: "paging",
                        "segmentation fault: pid {pid} write to {fault_addr}"
                    );
                    sched.post_signal(pid, SIGSEGV);
                    sched.reschedule();
                    return FaultOutcome::Signalled;
                }
                fault_panic(fault_addr, err, "write protection fault with no current task");
            } else {
                fault_panic(fault_addr, err, "unresolvable fault");
            }
        }

        self.mmu.flush_page(fault_addr);
        FaultOutcome::Resolved
    }

    /// `mmap`: honors `hint` when the range is free, otherwise takes the
    /// first fitting gap. Returns `None` when no spot exists.
    pub fn sys_mmap(
        &mut self,
        mm: &mut Mm,
        hint: Option<VirtualAddress>,
        length: u32,
    ) -> Option<VirtualAddress> {
        if length == 0 {
            return None;
        }
        let start = match hint {
            Some(addr) if mm.is_valid_range(addr, addr + length) == RangeCheck::Free => addr,
            _ => match mm.find_free_gap(length) {
                Some(start) => start,
                None => {
                    error!(
                        target: "paging",
                        "no suitable spot for a new {length}-byte virtual memory area"
                    );
                    return None;
                }
            },
        };
        self.create_vm_area(
            mm,
            start,
            length,
            MapFlags::PRESENT | MapFlags::RW | MapFlags::COW | MapFlags::USER,
            GfpFlags::HIGHUSER,
        );
        Some(start)
    }

    /// `munmap`: requires an exact (start, length) match with an existing
    /// area.
    pub fn sys_munmap(
        &mut self,
        mm: &mut Mm,
        addr: VirtualAddress,
        length: u32,
    ) -> Result<(), MmError> {
        let index = mm
            .areas()
            .iter()
            .position(|area| area.start == addr && area.size() == length)
            .ok_or(MmError::NotFound)?;
        info!(target: "paging", "[{addr}, {}) found it, destroying it", addr + length);
        self.destroy_vm_area(mm, index);
        Ok(())
    }

    /// `brk`: moves the program break within the heap area, carving the
    /// heap lazily on first use. `None` reports the current break.
    pub fn sys_brk(
        &mut self,
        mm: &mut Mm,
        request: Option<VirtualAddress>,
    ) -> Option<VirtualAddress> {
        const HEAP_SIZE: u32 = 0x0040_0000; // 4 MiB

        if mm.start_brk == VirtualAddress::zero() {
            let base = layout::PROCAREA_START;
            let start = mm.find_free_gap(HEAP_SIZE).or_else(|| {
                (mm.is_valid_range(base, base + HEAP_SIZE) == RangeCheck::Free).then_some(base)
            })?;
            self.create_vm_area(
                mm,
                start,
                HEAP_SIZE,
                MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::COW,
                GfpFlags::HIGHUSER,
            );
            mm.start_brk = start;
            mm.brk = start;
        }

        let heap_end = mm.area(mm.find_area(mm.start_brk)?).end;
        match request {
            None => Some(mm.brk),
            Some(addr) if addr >= mm.start_brk && addr <= heap_end => {
                mm.brk = addr;
                Some(addr)
            }
            Some(addr) => {
                warn!(target: "paging", "brk request {addr} outside the heap area");
                None
            }
        }
    }

    /// Maps `count` contiguous frames into the scratch window, returning
    /// their window address. The window's tables are global, so the mapping
    /// is visible through every directory.
    pub fn scratch_map(&mut self, pfn: Pfn, count: u32) -> Option<VirtualAddress> {
        let addr = self.scratch.reserve(count)?;
        let mapped = map_update(
            &mut self.frames,
            &self.phys,
            &mut self.mmu,
            self.pgtbl_cache,
            self.kernel_mm.pgd(),
            addr,
            pfn.address(),
            count * PAGE_SIZE,
            MapFlags::PRESENT | MapFlags::RW | MapFlags::GLOBAL | MapFlags::UPDADDR,
        );
        if mapped.is_err() {
            self.scratch.release(addr, count);
            return None;
        }
        Some(addr)
    }

    /// Releases a scratch mapping made with [`Self::scratch_map`].
    pub fn scratch_unmap(&mut self, addr: VirtualAddress, count: u32) {
        let _ = map_update(
            &mut self.frames,
            &self.phys,
            &mut self.mmu,
            self.pgtbl_cache,
            self.kernel_mm.pgd(),
            addr,
            PhysicalAddress::zero(),
            count * PAGE_SIZE,
            MapFlags::RW | MapFlags::GLOBAL,
        );
        self.scratch.release(addr, count);
    }

    /// Whether `addr` lies in the scratch window (test and stub surface).
    #[must_use]
    pub fn in_scratch_window(&self, addr: VirtualAddress) -> bool {
        self.scratch.contains(addr)
    }

    /// Installs a lazy scratch link for tests and collaborators that stage
    /// scratch clones directly.
    pub fn link_scratch_shadow(&mut self, addr: VirtualAddress, source_pgd: Pfn, source: VirtualAddress) {
        debug_assert!(self.scratch.contains(addr));
        self.shadow.insert(
            self.mmu.current_directory(),
            addr.vpn(),
            kernel_vmem::SlotRef {
                pgd: source_pgd,
                vpn: source.vpn(),
            },
        );
    }
}
