use spin::Mutex;

use crate::config::SECTOR_SIZE;

/// A sector-addressed block device. Buffers are exactly [`SECTOR_SIZE`] bytes.
pub trait BlockDevice: Send {
    fn read_sector(&self, index: usize, buf: &mut [u8]) -> bool;

    fn write_sector(&self, index: usize, buf: &[u8]) -> bool;

    fn sector_count(&self) -> usize;
}

/// A block device held in memory.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        RamDisk {
            data: Mutex::new(vec![0; sector_count * SECTOR_SIZE]),
        }
    }

    /// Copy of the whole device, for inspection.
    pub fn raw_data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn sector_range(&self, index: usize, len: usize) -> Option<std::ops::Range<usize>> {
        if len != SECTOR_SIZE || index >= self.sector_count() {
            return None;
        }

        Some(index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read_sector(&self, index: usize, buf: &mut [u8]) -> bool {
        let Some(range) = self.sector_range(index, buf.len()) else {
            return false;
        };

        buf.copy_from_slice(&self.data.lock()[range]);
        true
    }

    fn write_sector(&self, index: usize, buf: &[u8]) -> bool {
        let Some(range) = self.sector_range(index, buf.len()) else {
            return false;
        };

        self.data.lock()[range].copy_from_slice(buf);
        true
    }

    fn sector_count(&self) -> usize {
        self.data.lock().len() / SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_are_independent() {
        let disk = RamDisk::new(4);
        let sector = [7u8; SECTOR_SIZE];

        assert!(disk.write_sector(2, &sector));

        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read_sector(2, &mut buf));
        assert_eq!(buf, sector);
        assert!(disk.read_sector(1, &mut buf));
        assert_eq!(buf, [0u8; SECTOR_SIZE]);

        let raw = disk.raw_data();
        assert_eq!(raw[2 * SECTOR_SIZE], 7);
        assert_eq!(raw[3 * SECTOR_SIZE], 0);
    }

    #[test]
    fn rejects_out_of_range_and_short_buffers() {
        let disk = RamDisk::new(1);

        assert!(!disk.write_sector(1, &[0u8; SECTOR_SIZE]));
        assert!(!disk.write_sector(0, &[0u8; 16]));
        assert_eq!(disk.sector_count(), 1);
    }
}
