use std::collections::HashMap;

use bitflags::bitflags;

use crate::config::page_round_down;
use crate::frame::FrameId;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageTableEntry {
    pub frame: FrameId,
    pub flags: PteFlags,
}

impl PageTableEntry {
    pub fn writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }
}

/// Hardware translation for one address space.
///
/// This only caches the translations of resident pages; the supplemental page
/// table stays the authoritative record. Addresses are page aligned.
pub trait PageTable: Send {
    /// Maps `va` to `frame`. A fresh mapping starts clean and not accessed.
    fn install(&mut self, va: usize, frame: FrameId, writable: bool) -> bool;

    fn clear(&mut self, va: usize);

    fn lookup(&self, va: usize) -> Option<PageTableEntry>;

    fn set_flag(&mut self, va: usize, flag: PteFlags, value: bool);

    fn is_dirty(&self, va: usize) -> bool {
        self.lookup(va)
            .is_some_and(|entry| entry.flags.contains(PteFlags::DIRTY))
    }

    fn set_dirty(&mut self, va: usize, dirty: bool) {
        self.set_flag(va, PteFlags::DIRTY, dirty);
    }

    fn is_accessed(&self, va: usize) -> bool {
        self.lookup(va)
            .is_some_and(|entry| entry.flags.contains(PteFlags::ACCESSED))
    }

    fn set_accessed(&mut self, va: usize, accessed: bool) {
        self.set_flag(va, PteFlags::ACCESSED, accessed);
    }
}

/// A page table kept in a hash map, standing in for the hardware tables.
#[derive(Debug, Default)]
pub struct SoftPageTable {
    table: HashMap<usize, PageTableEntry>,
    capacity: Option<usize>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        SoftPageTable::default()
    }

    /// A table that refuses to hold more than `capacity` translations, the way
    /// a real one fails when it cannot allocate an intermediate table.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        SoftPageTable {
            table: HashMap::new(),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl PageTable for SoftPageTable {
    fn install(&mut self, va: usize, frame: FrameId, writable: bool) -> bool {
        let va = page_round_down(va);

        let full = self.capacity.is_some_and(|cap| self.table.len() >= cap);
        if full && !self.table.contains_key(&va) {
            return false;
        }

        let mut flags = PteFlags::empty();
        flags.set(PteFlags::WRITABLE, writable);

        self.table.insert(va, PageTableEntry { frame, flags });

        true
    }

    fn clear(&mut self, va: usize) {
        self.table.remove(&page_round_down(va));
    }

    fn lookup(&self, va: usize) -> Option<PageTableEntry> {
        self.table.get(&page_round_down(va)).copied()
    }

    fn set_flag(&mut self, va: usize, flag: PteFlags, value: bool) {
        if let Some(entry) = self.table.get_mut(&page_round_down(va)) {
            entry.flags.set(flag, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_starts_clean() {
        let mut pt = SoftPageTable::new();

        assert!(pt.install(0x4000, FrameId::new(3), true));

        let entry = pt.lookup(0x4123).unwrap();
        assert_eq!(entry.frame, FrameId::new(3));
        assert!(entry.writable());
        assert!(!pt.is_dirty(0x4000));
        assert!(!pt.is_accessed(0x4000));
    }

    #[test]
    fn bits_follow_the_mapping() {
        let mut pt = SoftPageTable::new();
        pt.install(0x4000, FrameId::new(0), false);

        pt.set_dirty(0x4000, true);
        pt.set_accessed(0x4000, true);
        assert!(pt.is_dirty(0x4000));
        assert!(pt.is_accessed(0x4000));

        pt.clear(0x4000);
        assert!(pt.lookup(0x4000).is_none());
        assert!(!pt.is_dirty(0x4000));

        // setting a bit on a missing entry is a no-op
        pt.set_dirty(0x4000, true);
        assert!(pt.is_empty());
    }

    #[test]
    fn capacity_limit_refuses_new_entries() {
        let mut pt = SoftPageTable::with_capacity_limit(1);

        assert!(pt.install(0x1000, FrameId::new(0), true));
        assert!(!pt.install(0x2000, FrameId::new(1), true));
        // remapping an existing address still works
        assert!(pt.install(0x1000, FrameId::new(2), true));
        assert_eq!(pt.len(), 1);
    }
}
