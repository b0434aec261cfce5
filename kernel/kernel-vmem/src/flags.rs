use bitflags::bitflags;

bitflags! {
    /// Software view of a mapping request, translated into hardware entry
    /// bits by [`apply_table_flags`](crate::apply_table_flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Mapping is resident; hardware may translate through it.
        const PRESENT = 1 << 0;
        /// Writable.
        const RW      = 1 << 1;
        /// Accessible from ring 3.
        const USER    = 1 << 2;
        /// Survives address-space switches; never removed from any
        /// directory once installed.
        const GLOBAL  = 1 << 3;
        /// Copy-on-write: kept read-only (or not-present) and privately
        /// duplicated by the fault handler on first write.
        const COW     = 1 << 4;
        /// Walkers should also rewrite the physical frame numbers, not just
        /// the permission bits.
        const UPDADDR = 1 << 5;
    }
}
