use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

/// A byte-addressable file handle, as handed over by the filesystem layer.
pub trait File: Send + Sync {
    /// A new, independent handle to the same file. `None` if the
    /// filesystem could not allocate one.
    fn reopen(&self) -> Option<Arc<dyn File>>;

    fn length(&self) -> usize;

    /// Reads up to `buf.len()` bytes at `offset`, returning how many were read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes up to `buf.len()` bytes at `offset`, returning how many were written.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;

    fn close(&self);
}

struct MemFileInner {
    data: Mutex<Vec<u8>>,
    open_handles: AtomicUsize,
    writes: Mutex<Vec<(usize, usize)>>,
}

/// An in-memory file. All handles from [`File::reopen`] share the contents.
///
/// Like the files of a simple teaching filesystem it never grows: writes past
/// the end are cut short.
#[derive(Clone)]
pub struct MemFile {
    inner: Arc<MemFileInner>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        let inner = MemFileInner {
            data: Mutex::new(data),
            open_handles: AtomicUsize::new(1),
            writes: Mutex::new(Vec::new()),
        };

        MemFile {
            inner: Arc::new(inner),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    /// Handles opened and not yet closed, including the original one.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// `(offset, len)` of every write so far, oldest first.
    pub fn write_log(&self) -> Vec<(usize, usize)> {
        self.inner.writes.lock().clone()
    }
}

impl File for MemFile {
    fn reopen(&self) -> Option<Arc<dyn File>> {
        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(self.clone()))
    }

    fn length(&self) -> usize {
        self.inner.data.lock().len()
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.inner.data.lock();
        if offset >= data.len() {
            return 0;
        }

        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.inner.data.lock();
        if offset >= data.len() {
            return 0;
        }

        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        self.inner.writes.lock().push((offset, n));
        n
    }

    fn close(&self) {
        self.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}
