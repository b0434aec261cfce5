use alloc::collections::BTreeMap;
use kernel_memory_addresses::Pfn;

/// Location of a page-table slot: directory frame plus virtual page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub pgd: Pfn,
    pub vpn: u32,
}

/// The copy-on-write indirection table.
///
/// When a COW mapping is cloned, the destination slot must stay not-present
/// for the hardware yet remember which source slot it shadows. Instead of
/// smuggling a pointer through the entry's payload bits, the link lives
/// here, keyed by `(destination directory, virtual page)`; the fault handler
/// looks it up, resolves the source, and removes the link once the
/// destination has a real mapping.
///
/// Entries for a virtual range are dropped when the range is unmapped, and
/// for a whole directory when its address space dies.
#[derive(Debug, Default)]
pub struct ShadowCowTable {
    slots: BTreeMap<(u32, u32), SlotRef>,
}

impl ShadowCowTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, pgd: Pfn, vpn: u32, source: SlotRef) {
        self.slots.insert((pgd.as_u32(), vpn), source);
    }

    #[must_use]
    pub fn get(&self, pgd: Pfn, vpn: u32) -> Option<SlotRef> {
        self.slots.get(&(pgd.as_u32(), vpn)).copied()
    }

    pub fn remove(&mut self, pgd: Pfn, vpn: u32) -> Option<SlotRef> {
        self.slots.remove(&(pgd.as_u32(), vpn))
    }

    /// Drops every link whose **destination** is `pgd` (a dying directory's
    /// own lazy pages). Links where `pgd` is the source side are taken out
    /// with [`Self::drain_sources`], which returns them so the caller can
    /// release the references they held.
    pub fn remove_directory(&mut self, pgd: Pfn) {
        self.slots.retain(|&(d, _), _| d != pgd.as_u32());
    }

    /// Removes and returns every link whose **source** lies in `pgd`.
    ///
    /// When a directory dies, lazy pages in other address spaces that
    /// shadowed it lose their source: the caller drops the frame references
    /// those links carried, and the orphaned destinations fault in fresh
    /// zeroed pages later.
    pub fn drain_sources(&mut self, pgd: Pfn) -> alloc::vec::Vec<SlotRef> {
        let keys: alloc::vec::Vec<(u32, u32)> = self
            .slots
            .iter()
            .filter(|(_, src)| src.pgd == pgd)
            .map(|(&k, _)| k)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.slots.remove(&k))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
