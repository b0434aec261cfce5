use bitflags::bitflags;

bitflags! {
    /// Get-free-pages flags: who is asking, and from which zone.
    ///
    /// The zone split is the part the allocator acts on: [`GfpFlags::HIGHUSER`]
    /// requests draw from the HighMem zone, everything else from Normal.
    /// [`GfpFlags::ATOMIC`] and [`GfpFlags::NOWAIT`] mark requests from
    /// contexts that must not sleep (interrupt handlers, the fault path);
    /// with a single CPU and no reclaim the allocator never sleeps anyway,
    /// but callers record the constraint and slab caches pass it through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// Ordinary kernel allocation from the Normal zone.
        const KERNEL   = 1 << 0;
        /// Interrupt-context allocation; must not sleep.
        const ATOMIC   = 1 << 1;
        /// Must not sleep; no other constraint.
        const NOWAIT   = 1 << 2;
        /// User-page allocation from the HighMem zone.
        const HIGHUSER = 1 << 3;
    }
}
