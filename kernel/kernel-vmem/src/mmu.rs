use kernel_memory_addresses::{Pfn, VirtualAddress};

/// The hardware MMU surface the walkers depend on.
///
/// Mutating a live mapping is only complete once the stale translation is
/// gone: every entry write is followed by [`Mmu::flush_page`] in program
/// order. Hosted test suites substitute a recording implementation and
/// assert the flush set instead of trusting it.
pub trait Mmu {
    /// Invalidates the single TLB entry for the page containing `addr`.
    fn flush_page(&mut self, addr: VirtualAddress);

    /// Frame of the page directory the MMU currently translates through.
    fn current_directory(&self) -> Pfn;

    /// Loads a new page directory (CR3).
    fn switch_directory(&mut self, pgd: Pfn);
}

/// The real MMU: `invlpg` and CR3 accesses.
#[derive(Debug, Default)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    #[inline]
    fn flush_page(&mut self, addr: VirtualAddress) {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) addr.as_u32(),
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = addr;
    }

    #[inline]
    fn current_directory(&self) -> Pfn {
        #[cfg(target_arch = "x86")]
        {
            let cr3: u32;
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            }
            kernel_memory_addresses::PhysicalAddress::new(cr3).pfn()
        }
        #[cfg(not(target_arch = "x86"))]
        {
            Pfn::new(0)
        }
    }

    #[inline]
    fn switch_directory(&mut self, pgd: Pfn) {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) pgd.address().as_u32(),
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = pgd;
    }
}

/// Test double: records every flush and models CR3 as a field.
#[cfg(any(test, feature = "test-support"))]
pub struct RecordingMmu {
    current: Pfn,
    flushed: alloc::vec::Vec<u32>,
    switches: alloc::vec::Vec<Pfn>,
}

#[cfg(any(test, feature = "test-support"))]
impl RecordingMmu {
    #[must_use]
    pub fn new(current: Pfn) -> Self {
        Self {
            current,
            flushed: alloc::vec::Vec::new(),
            switches: alloc::vec::Vec::new(),
        }
    }

    /// Virtual page numbers flushed since the last [`Self::clear`].
    #[must_use]
    pub fn flushed_vpns(&self) -> &[u32] {
        &self.flushed
    }

    #[must_use]
    pub fn was_flushed(&self, addr: VirtualAddress) -> bool {
        self.flushed.contains(&addr.vpn())
    }

    /// Directory switches observed, oldest first.
    #[must_use]
    pub fn switches(&self) -> &[Pfn] {
        &self.switches
    }

    pub fn clear(&mut self) {
        self.flushed.clear();
        self.switches.clear();
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Mmu for RecordingMmu {
    fn flush_page(&mut self, addr: VirtualAddress) {
        self.flushed.push(addr.vpn());
    }

    fn current_directory(&self) -> Pfn {
        self.current
    }

    fn switch_directory(&mut self, pgd: Pfn) {
        self.current = pgd;
        self.switches.push(pgd);
    }
}
