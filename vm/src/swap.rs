//! Swap store: frame-sized slots on a block device, tracked by a bitmap.
//!
//! Slot `s` occupies sectors `[s * SECTORS_PER_SLOT, (s + 1) * SECTORS_PER_SLOT)`.

use std::fmt;

use log::debug;

use crate::config::{PAGE_SIZE, SECTORS_PER_SLOT, SECTOR_SIZE};
use crate::disk::BlockDevice;
use crate::error::{VmError, VmResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_SLOT
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

pub struct SwapStore {
    disk: Option<Box<dyn BlockDevice>>,
    /// One bit per slot, 1 = in use.
    bitmap: Vec<u64>,
    slot_count: usize,
    used: usize,
    /// Where the next scan starts.
    hint: usize,
}

impl SwapStore {
    pub fn new(disk: Box<dyn BlockDevice>) -> Self {
        let slot_count = disk.sector_count() / SECTORS_PER_SLOT;

        SwapStore {
            disk: Some(disk),
            bitmap: vec![0; slot_count.div_ceil(64)],
            slot_count,
            used: 0,
            hint: 0,
        }
    }

    /// A store without a device: every allocation reports "full".
    pub fn disabled() -> Self {
        SwapStore {
            disk: None,
            bitmap: Vec::new(),
            slot_count: 0,
            used: 0,
            hint: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn used_slots(&self) -> usize {
        self.used
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        slot.0 < self.slot_count && self.bitmap[slot.0 / 64] & (1 << (slot.0 % 64)) != 0
    }

    /// Reserves a free slot. `None` when the device is full, which callers
    /// must treat as an ordinary allocation failure.
    pub fn alloc_slot(&mut self) -> Option<SwapSlot> {
        for step in 0..self.slot_count {
            let index = (self.hint + step) % self.slot_count;
            let (word, bit) = (index / 64, index % 64);

            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                self.used += 1;
                self.hint = (index + 1) % self.slot_count;
                return Some(SwapSlot(index));
            }
        }

        None
    }

    pub fn free_slot(&mut self, slot: SwapSlot) {
        assert!(self.is_allocated(slot), "double free of swap {slot}");

        self.bitmap[slot.0 / 64] &= !(1 << (slot.0 % 64));
        self.used -= 1;
    }

    /// Writes one frame to `slot`.
    pub fn write(&mut self, slot: SwapSlot, frame: &[u8]) -> VmResult<()> {
        assert_eq!(frame.len(), PAGE_SIZE);
        let disk = self.device(slot)?;

        for (i, sector) in frame.chunks_exact(SECTOR_SIZE).enumerate() {
            let index = slot.first_sector() + i;
            if !disk.write_sector(index, sector) {
                return Err(VmError::Disk { op: "write", sector: index });
            }
        }

        debug!("swap: wrote {slot}");
        Ok(())
    }

    /// Reads one frame back from `slot`.
    pub fn read(&mut self, slot: SwapSlot, frame: &mut [u8]) -> VmResult<()> {
        assert_eq!(frame.len(), PAGE_SIZE);
        let disk = self.device(slot)?;

        for (i, sector) in frame.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let index = slot.first_sector() + i;
            if !disk.read_sector(index, sector) {
                return Err(VmError::Disk { op: "read", sector: index });
            }
        }

        debug!("swap: read {slot}");
        Ok(())
    }

    fn device(&self, slot: SwapSlot) -> VmResult<&dyn BlockDevice> {
        assert!(self.is_allocated(slot), "I/O on unallocated swap {slot}");

        match &self.disk {
            Some(disk) => Ok(disk.as_ref()),
            None => Err(VmError::Disk { op: "access", sector: slot.first_sector() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::disk::RamDisk;

    /// Lets a test keep looking at the disk the store writes to.
    struct Shared(Arc<RamDisk>);

    impl BlockDevice for Shared {
        fn read_sector(&self, index: usize, buf: &mut [u8]) -> bool {
            self.0.read_sector(index, buf)
        }

        fn write_sector(&self, index: usize, buf: &[u8]) -> bool {
            self.0.write_sector(index, buf)
        }

        fn sector_count(&self) -> usize {
            self.0.sector_count()
        }
    }

    #[test]
    fn slots_are_never_handed_out_twice() {
        let mut swap = SwapStore::new(Box::new(RamDisk::new(3 * SECTORS_PER_SLOT)));
        assert_eq!(swap.slot_count(), 3);

        let slots: Vec<_> = (0..3).map(|_| swap.alloc_slot().unwrap()).collect();
        assert_eq!(swap.alloc_slot(), None);
        assert_eq!(swap.used_slots(), 3);

        swap.free_slot(slots[1]);
        assert_eq!(swap.alloc_slot(), Some(slots[1]));
        assert_eq!(swap.alloc_slot(), None);
    }

    #[test]
    fn partial_slots_are_not_counted() {
        let swap = SwapStore::new(Box::new(RamDisk::new(SECTORS_PER_SLOT + 3)));
        assert_eq!(swap.slot_count(), 1);

        let mut disabled = SwapStore::disabled();
        assert_eq!(disabled.alloc_slot(), None);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut swap = SwapStore::new(Box::new(RamDisk::new(SECTORS_PER_SLOT)));

        let slot = swap.alloc_slot().unwrap();
        swap.free_slot(slot);
        swap.free_slot(slot);
    }

    #[test]
    fn slot_maps_to_its_sector_run() {
        let disk = Arc::new(RamDisk::new(2 * SECTORS_PER_SLOT));
        let mut swap = SwapStore::new(Box::new(Shared(disk.clone())));

        let first = swap.alloc_slot().unwrap();
        let second = swap.alloc_slot().unwrap();

        let frame: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        swap.write(second, &frame).unwrap();

        let raw = disk.raw_data();
        assert!(raw[..PAGE_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&raw[PAGE_SIZE..], &frame[..]);

        let mut back = vec![0u8; PAGE_SIZE];
        swap.read(second, &mut back).unwrap();
        assert_eq!(back, frame);

        swap.read(first, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0));
    }
}
