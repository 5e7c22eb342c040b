//! Host-backed collaborators: a file on the host filesystem as a mappable
//! file, and another one as the swap disk.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use vm::{BlockDevice, File, SECTOR_SIZE};

/// A host file opened for reading and writing.
pub struct HostFile {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl HostFile {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::options().read(true).write(true).open(&path)?;

        Ok(HostFile {
            path,
            file: Mutex::new(file),
        })
    }

    fn transfer<T>(&self, op: impl FnOnce(&mut fs::File) -> io::Result<T>) -> Option<T> {
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };

        match op(&mut file) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("{}: {err}", self.path.display());
                None
            }
        }
    }
}

impl File for HostFile {
    fn reopen(&self) -> Option<Arc<dyn File>> {
        match HostFile::open(&self.path) {
            Ok(file) => Some(Arc::new(file)),
            Err(err) => {
                warn!("reopening {}: {err}", self.path.display());
                None
            }
        }
    }

    fn length(&self) -> usize {
        self.transfer(|file| file.metadata()).map_or(0, |meta| meta.len() as usize)
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.transfer(|file| {
            file.seek(SeekFrom::Start(offset as u64))?;

            let mut done = 0;
            while done < buf.len() {
                match file.read(&mut buf[done..])? {
                    0 => break,
                    n => done += n,
                }
            }
            Ok(done)
        })
        .unwrap_or(0)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let len = self.length();
        if offset >= len {
            return 0;
        }
        let buf = &buf[..buf.len().min(len - offset)];

        self.transfer(|file| {
            file.seek(SeekFrom::Start(offset as u64))?;
            file.write_all(buf)?;
            Ok(buf.len())
        })
        .unwrap_or(0)
    }

    fn close(&self) {
        debug!("closing {}", self.path.display());
        self.transfer(|file| file.sync_all());
    }
}

/// A swap disk stored in a host file of `sector_count * SECTOR_SIZE` bytes.
pub struct FileDisk {
    file: Mutex<fs::File>,
    sector_count: usize,
}

impl FileDisk {
    pub fn create<P: AsRef<Path>>(path: P, sector_count: usize) -> io::Result<Self> {
        let file = fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((sector_count * SECTOR_SIZE) as u64)?;

        Ok(FileDisk {
            file: Mutex::new(file),
            sector_count,
        })
    }

    fn seek_to(file: &mut fs::File, index: usize) -> io::Result<()> {
        file.seek(SeekFrom::Start((index * SECTOR_SIZE) as u64)).map(|_| ())
    }
}

impl BlockDevice for FileDisk {
    fn read_sector(&self, index: usize, buf: &mut [u8]) -> bool {
        if index >= self.sector_count || buf.len() != SECTOR_SIZE {
            return false;
        }

        let Ok(mut file) = self.file.lock() else {
            return false;
        };
        Self::seek_to(&mut file, index).and_then(|_| file.read_exact(buf)).is_ok()
    }

    fn write_sector(&self, index: usize, buf: &[u8]) -> bool {
        if index >= self.sector_count || buf.len() != SECTOR_SIZE {
            return false;
        }

        let Ok(mut file) = self.file.lock() else {
            return false;
        };
        Self::seek_to(&mut file, index).and_then(|_| file.write_all(buf)).is_ok()
    }

    fn sector_count(&self) -> usize {
        self.sector_count
    }
}
