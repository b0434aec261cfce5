use crate::flags::MapFlags;
use bitfield_struct::bitfield;

/// Page directory entry (PDE) layout for 4 KiB pages.
///
/// Reference: Intel SDM Vol. 3A, §4.3 "32-Bit Paging".
#[bitfield(u32)]
pub struct PageDirectoryEntry {
    /// The pointed-to page table may be walked.
    pub present: bool, // bit 0
    /// Writes may reach pages under this entry (combined with PTE rw).
    pub rw: bool, // bit 1
    /// Ring-3 accesses may reach pages under this entry.
    pub user: bool, // bit 2
    pub write_through: bool, // bit 3
    pub cache_disable: bool, // bit 4
    /// Set by hardware on first use of the entry.
    pub accessed: bool, // bit 5
    __: bool, // bit 6, ignored
    /// 4 MiB page when set; never used here (two-level, 4 KiB only).
    pub page_size: bool, // bit 7
    /// Kernel mapping shared by every directory; never removed.
    pub global: bool, // bit 8
    /// Free for the kernel; set to 1 on materialized entries.
    #[bits(3)]
    pub available: u8, // bits 9-11
    /// Physical frame number of the page table.
    #[bits(20)]
    pub frame: u32, // bits 12-31
}

/// Page table entry (PTE) layout.
///
/// `kernel_cow` lives in available bit 9: hardware ignores it, the fault
/// handler keys copy-on-write resolution off it.
#[bitfield(u32)]
pub struct PageTableEntry {
    /// The page is resident; hardware may translate to it.
    pub present: bool, // bit 0
    /// Writable; clear on COW-shared pages.
    pub rw: bool, // bit 1
    /// Accessible from ring 3.
    pub user: bool, // bit 2
    pub write_through: bool, // bit 3
    pub cache_disable: bool, // bit 4
    /// Set by hardware on access.
    pub accessed: bool, // bit 5
    /// Set by hardware on write.
    pub dirty: bool, // bit 6
    __: bool, // bit 7, PAT
    /// Translation survives CR3 reloads (with CR4.PGE).
    pub global: bool, // bit 8
    /// Software copy-on-write marker.
    pub kernel_cow: bool, // bit 9
    /// Free for the kernel; set to 1 on installed entries.
    #[bits(2)]
    pub available: u8, // bits 10-11
    /// Physical frame number of the mapped page.
    #[bits(20)]
    pub frame: u32, // bits 12-31
}

/// Writes the permission/COW bits derived from `flags` into a table entry.
///
/// The frame field is left untouched; address updates are a separate,
/// explicitly-requested step (`MapFlags::UPDADDR`).
pub fn apply_table_flags(entry: &mut PageTableEntry, flags: MapFlags) {
    entry.set_rw(flags.contains(MapFlags::RW));
    entry.set_present(flags.contains(MapFlags::PRESENT));
    entry.set_kernel_cow(flags.contains(MapFlags::COW));
    entry.set_available(1);
    entry.set_global(flags.contains(MapFlags::GLOBAL));
    entry.set_user(flags.contains(MapFlags::USER));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bits_match_the_manual() {
        let mut e = PageTableEntry::new();
        e.set_present(true);
        e.set_rw(true);
        e.set_frame(0x12345);
        assert_eq!(e.into_bits(), 0x1234_5003);

        let mut d = PageDirectoryEntry::new();
        d.set_present(true);
        d.set_global(true);
        d.set_frame(1);
        assert_eq!(d.into_bits(), 0x0000_1101);
    }

    #[test]
    fn cow_bit_is_invisible_to_hardware_presence() {
        let mut e = PageTableEntry::new();
        e.set_kernel_cow(true);
        assert!(!e.present());
        assert_eq!(e.into_bits() & 1, 0);
    }

    #[test]
    fn apply_flags_translates() {
        let mut e = PageTableEntry::new();
        apply_table_flags(
            &mut e,
            MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::COW,
        );
        assert!(e.present() && e.rw() && e.user() && e.kernel_cow());
        assert!(!e.global());
        assert_eq!(e.available(), 1);

        // Re-applying a downgrade clears what it does not name.
        apply_table_flags(&mut e, MapFlags::PRESENT | MapFlags::USER | MapFlags::COW);
        assert!(!e.rw());
        assert!(e.present() && e.kernel_cow());
    }
}
