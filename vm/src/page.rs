//! Pages: the unit of virtual memory bookkeeping.
//!
//! A page starts out uninitialized, carrying what it needs to produce its
//! first contents. The first fault turns it into an anonymous or file-backed
//! page for good; from then on it moves between a frame and its backing store
//! (swap for anonymous pages, the file for file-backed ones).

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;

use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::file::File;
use crate::frame::FrameId;
use crate::page_table::PageTable;
use crate::swap::{SwapSlot, SwapStore};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageType {
    Anon,
    File,
}

/// One reopened file handle shared by a run of pages.
///
/// `remaining` counts the pages still referring to it, across every address
/// space they were duplicated into. The handle is closed when it drops to zero.
pub struct Mapping {
    file: Arc<dyn File>,
    base: usize,
    pages: usize,
    /// Created by a memory-map request rather than by program loading.
    mmapped: bool,
    remaining: AtomicUsize,
}

impl Mapping {
    /// A memory-mapped file region.
    pub(crate) fn new(file: Arc<dyn File>, base: usize, pages: usize) -> Arc<Self> {
        Self::with_origin(file, base, pages, true)
    }

    /// The pages of a program segment.
    pub(crate) fn segment(file: Arc<dyn File>, base: usize, pages: usize) -> Arc<Self> {
        Self::with_origin(file, base, pages, false)
    }

    fn with_origin(file: Arc<dyn File>, base: usize, pages: usize, mmapped: bool) -> Arc<Self> {
        Arc::new(Mapping {
            file,
            base,
            pages,
            mmapped,
            remaining: AtomicUsize::new(pages),
        })
    }

    /// Address of the first page of the mapping.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of pages the mapping was created with.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Whether the region can be removed with an unmap request.
    pub fn is_mmapped(&self) -> bool {
        self.mmapped
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    fn retain(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let before = self.remaining.fetch_sub(1, Ordering::SeqCst);
        assert!(before > 0, "mapping at {:#x} released too many times", self.base);

        if before == 1 {
            debug!("closing file of mapping at {:#x}", self.base);
            self.file.close();
        }
    }
}

/// The part of a file one page shows: `read_bytes` from `offset`, then
/// `zero_bytes` of zeroes. Dropping it releases its hold on the mapping.
pub struct FileSlice {
    mapping: Arc<Mapping>,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FileSlice {
    pub(crate) fn new(mapping: Arc<Mapping>, offset: usize, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_SIZE);

        FileSlice {
            mapping,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    /// Another slice over the same bytes, counted in the mapping.
    fn share(&self) -> FileSlice {
        self.mapping.retain();

        FileSlice {
            mapping: self.mapping.clone(),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }

    fn load(&self, frame: &mut [u8]) -> VmResult<()> {
        let (valid, zeroes) = frame.split_at_mut(self.read_bytes);

        let got = self.mapping.file.read_at(valid, self.offset);
        if got != self.read_bytes {
            return Err(VmError::ShortRead {
                offset: self.offset,
                wanted: self.read_bytes,
                got,
            });
        }

        zeroes.fill(0);
        Ok(())
    }

    fn store(&self, frame: &[u8]) -> VmResult<()> {
        if self.read_bytes == 0 {
            return Ok(());
        }

        let got = self.mapping.file.write_at(&frame[..self.read_bytes], self.offset);
        if got != self.read_bytes {
            return Err(VmError::ShortWrite {
                offset: self.offset,
                wanted: self.read_bytes,
                got,
            });
        }

        Ok(())
    }
}

impl Drop for FileSlice {
    fn drop(&mut self) {
        self.mapping.release();
    }
}

/// What an uninitialized page runs on its first fault.
pub enum Initializer {
    /// A zero-filled page.
    Zero,
    /// Contents read from a file.
    File(FileSlice),
}

impl Initializer {
    fn share(&self) -> Initializer {
        match self {
            Initializer::Zero => Initializer::Zero,
            Initializer::File(slice) => Initializer::File(slice.share()),
        }
    }
}

enum PageState {
    Uninit { target: PageType, init: Initializer },
    Anon { slot: Option<SwapSlot> },
    File { slice: FileSlice },
}

pub struct Page {
    va: usize,
    writable: bool,
    state: PageState,
    frame: Option<FrameId>,
}

impl Page {
    /// An uninitialized page that becomes `target` on its first fault.
    pub(crate) fn new(
        va: usize,
        writable: bool,
        target: PageType,
        init: Initializer,
    ) -> VmResult<Page> {
        if target == PageType::File && matches!(init, Initializer::Zero) {
            return Err(VmError::InvalidArgument("file-backed page without a file"));
        }

        Ok(Page {
            va,
            writable,
            state: PageState::Uninit { target, init },
            frame: None,
        })
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: Option<FrameId>) {
        self.frame = frame;
    }

    /// The page's type; for an uninitialized page, the type it will become.
    pub fn page_type(&self) -> PageType {
        match &self.state {
            PageState::Uninit { target, .. } => *target,
            PageState::Anon { .. } => PageType::Anon,
            PageState::File { .. } => PageType::File,
        }
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.state, PageState::Uninit { .. })
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.state {
            PageState::Anon { slot } => slot,
            _ => None,
        }
    }

    /// The file slice behind the page, if it has one.
    pub fn file_slice(&self) -> Option<&FileSlice> {
        match &self.state {
            PageState::Uninit {
                init: Initializer::File(slice),
                ..
            } => Some(slice),
            PageState::File { slice } => Some(slice),
            _ => None,
        }
    }

    /// The mapping this page was created by, if it is file-backed.
    pub fn mapping(&self) -> Option<&Arc<Mapping>> {
        match self.page_type() {
            PageType::File => self.file_slice().map(FileSlice::mapping),
            PageType::Anon => None,
        }
    }

    /// Brings the page's contents into `frame`.
    ///
    /// On error the page is left exactly as it was.
    pub(crate) fn materialize(&mut self, frame: &mut [u8], swap: &mut SwapStore) -> VmResult<()> {
        match &mut self.state {
            PageState::Uninit { init, .. } => {
                match init {
                    Initializer::Zero => frame.fill(0),
                    Initializer::File(slice) => slice.load(frame)?,
                }
                self.finish_init();
            }
            PageState::Anon { slot } => {
                if let Some(from) = *slot {
                    swap.read(from, frame)?;
                    swap.free_slot(from);
                    *slot = None;
                }
            }
            PageState::File { slice } => slice.load(frame)?,
        }

        debug!("materialized page {:#x}", self.va);
        Ok(())
    }

    fn finish_init(&mut self) {
        let state = mem::replace(&mut self.state, PageState::Anon { slot: None });
        let PageState::Uninit { target, init } = state else {
            unreachable!("page {:#x} initialized twice", self.va);
        };

        self.state = match (target, init) {
            // a private copy: the file slice is dropped and releases the mapping
            (PageType::Anon, _) => PageState::Anon { slot: None },
            (PageType::File, Initializer::File(slice)) => PageState::File { slice },
            (PageType::File, Initializer::Zero) => unreachable!(),
        };
    }

    /// Moves the resident contents in `frame` to the backing store and
    /// clears the hardware mapping. On error nothing changes.
    pub(crate) fn evict<P: PageTable>(
        &mut self,
        frame: &[u8],
        swap: &mut SwapStore,
        pt: &mut P,
    ) -> VmResult<()> {
        match &mut self.state {
            PageState::Uninit { .. } => {
                panic!("uninitialized page {:#x} cannot own a frame", self.va)
            }
            PageState::Anon { slot } => {
                let to = swap.alloc_slot().ok_or(VmError::SwapFull)?;
                if let Err(err) = swap.write(to, frame) {
                    swap.free_slot(to);
                    return Err(err);
                }
                *slot = Some(to);
                debug!("page {:#x} swapped out to {to}", self.va);
            }
            PageState::File { slice } => {
                flush(slice, self.va, frame, pt)?;
            }
        }

        pt.clear(self.va);
        Ok(())
    }

    /// Writes a dirty file-backed page back to its file. Returns whether
    /// anything was written.
    pub(crate) fn write_back<P: PageTable>(&self, frame: &[u8], pt: &mut P) -> VmResult<bool> {
        match &self.state {
            PageState::File { slice } => flush(slice, self.va, frame, pt),
            _ => Ok(false),
        }
    }

    /// Releases what the page holds besides its frame.
    pub(crate) fn destroy(self, swap: &mut SwapStore) {
        if let Some(slot) = self.swap_slot() {
            swap.free_slot(slot);
        }
        // a file slice releases the mapping when it drops
    }

    /// The page a forked child starts with: same metadata, no frame. An
    /// anonymous page comes back empty and needs its contents copied.
    pub(crate) fn duplicate(&self) -> Page {
        let state = match &self.state {
            PageState::Uninit { target, init } => PageState::Uninit {
                target: *target,
                init: init.share(),
            },
            PageState::Anon { .. } => PageState::Anon { slot: None },
            PageState::File { slice } => PageState::File {
                slice: slice.share(),
            },
        };

        Page {
            va: self.va,
            writable: self.writable,
            state,
            frame: None,
        }
    }

    /// Whether a child needs a copy of the current contents rather than
    /// loading them again on its own.
    pub(crate) fn needs_copy(&self) -> bool {
        match self.state {
            PageState::Uninit { .. } => false,
            PageState::Anon { .. } => true,
            PageState::File { .. } => self.frame.is_some(),
        }
    }
}

fn flush<P: PageTable>(slice: &FileSlice, va: usize, frame: &[u8], pt: &mut P) -> VmResult<bool> {
    if !pt.is_dirty(va) {
        return Ok(false);
    }

    slice.store(frame)?;
    pt.set_dirty(va, false);
    debug!("flushed page {va:#x} to file offset {:#x}", slice.offset);

    Ok(true)
}
