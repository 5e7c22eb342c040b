//! Memory-mapped files and lazily loaded program segments.

use std::sync::Arc;

use log::{info, warn};

use crate::config::{is_page_aligned, page_round_down, PAGE_SIZE};
use crate::error::{VmError, VmResult};
use crate::file::File;
use crate::mmu::{Inner, Mmu, SpaceId};
use crate::page::{FileSlice, Initializer, Mapping, Page, PageType};
use crate::page_replacer::PageReplacer;
use crate::page_table::PageTable;

impl<R: PageReplacer, P: PageTable> Mmu<R, P> {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// Nothing is read until the pages are touched. The mapping keeps its own
    /// handle to the file, so the caller may close `file` right away. Bytes
    /// past the end of the file read as zero and are never written back.
    pub fn map_file(
        &self,
        id: SpaceId,
        addr: usize,
        length: usize,
        writable: bool,
        file: &dyn File,
        offset: usize,
    ) -> VmResult<usize> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::InvalidAddress(addr));
        }
        if length == 0 {
            return Err(VmError::InvalidArgument("zero-length mapping"));
        }
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgument("file offset is not page aligned"));
        }
        if offset.checked_add(length).is_none() {
            return Err(VmError::InvalidArgument("file range overflows"));
        }
        self.check_range(addr, length)?;

        let file_len = file.length();
        if file_len == 0 {
            return Err(VmError::InvalidArgument("cannot map an empty file"));
        }

        let pages = length.div_ceil(PAGE_SIZE);
        let mut inner = self.lock();
        check_free(&inner, id, addr, pages)?;

        let handle = file.reopen().ok_or(VmError::ReopenFailed)?;
        let mapping = Mapping::new(handle, addr, pages);

        let space = inner.space_mut(id)?;
        for i in 0..pages {
            let page_offset = offset + i * PAGE_SIZE;
            let read_bytes = PAGE_SIZE
                .min(length - i * PAGE_SIZE)
                .min(file_len.saturating_sub(page_offset));

            let slice = FileSlice::new(mapping.clone(), page_offset, read_bytes);
            let page = Page::new(
                addr + i * PAGE_SIZE,
                writable,
                PageType::File,
                Initializer::File(slice),
            )?;
            space.spt.insert(page)?;
        }

        info!("space {id}: mapped {length} bytes of a file at {addr:#x} ({pages} pages)");
        Ok(addr)
    }

    /// Removes the mapping that starts at `addr`, writing dirty pages back
    /// to the file. The file handle is closed once no page of the mapping is
    /// left in any address space.
    pub fn unmap_file(&self, id: SpaceId, addr: usize) -> VmResult<()> {
        let mut inner = self.lock();

        let mapping = match inner.space(id)?.spt.find(addr).and_then(Page::mapping) {
            Some(mapping) => mapping.clone(),
            None => return Err(VmError::NotMapped(addr)),
        };
        if !mapping.is_mmapped() {
            return Err(VmError::InvalidArgument("address is not in a memory-mapped region"));
        }
        if mapping.base() != page_round_down(addr) {
            return Err(VmError::InvalidArgument("address is not the start of a mapping"));
        }

        let mut first_err = None;
        for i in 0..mapping.pages() {
            let va = mapping.base() + i * PAGE_SIZE;

            let ours = inner
                .space(id)?
                .spt
                .find(va)
                .and_then(Page::mapping)
                .is_some_and(|m| Arc::ptr_eq(m, &mapping));
            if !ours {
                continue;
            }

            if let Err(err) = inner.remove_page(id, va) {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            None => {
                info!("space {id}: unmapped file at {:#x}", mapping.base());
                Ok(())
            }
            Some(err) => {
                warn!("space {id}: unmapped file at {:#x} with errors", mapping.base());
                Err(err)
            }
        }
    }

    /// Registers a program segment at `va`: `read_bytes` from `file` at
    /// `offset`, followed by `zero_bytes` of zeroes.
    ///
    /// Read-only segments become file-backed pages. Writable segments are
    /// private copies: they load from the file once and are swapped, never
    /// written back.
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        id: SpaceId,
        file: &dyn File,
        offset: usize,
        va: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        let length = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidArgument("segment too large"))?;

        if !is_page_aligned(va) {
            return Err(VmError::InvalidAddress(va));
        }
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgument("segment offset is not page aligned"));
        }
        if offset.checked_add(read_bytes).is_none() {
            return Err(VmError::InvalidArgument("file range overflows"));
        }
        if length == 0 || length % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument("segment is not a whole number of pages"));
        }
        self.check_range(va, length)?;

        let pages = length / PAGE_SIZE;
        let mut inner = self.lock();
        check_free(&inner, id, va, pages)?;

        let handle = file.reopen().ok_or(VmError::ReopenFailed)?;
        let mapping = Mapping::segment(handle, va, pages);
        let target = if writable { PageType::Anon } else { PageType::File };

        let space = inner.space_mut(id)?;
        let mut left = read_bytes;
        let mut file_offset = offset;
        for i in 0..pages {
            let page_read = left.min(PAGE_SIZE);

            let slice = FileSlice::new(mapping.clone(), file_offset, page_read);
            let page = Page::new(va + i * PAGE_SIZE, writable, target, Initializer::File(slice))?;
            space.spt.insert(page)?;

            left -= page_read;
            file_offset += page_read;
        }

        info!(
            "space {id}: segment at {va:#x}, {read_bytes} bytes from file offset {offset:#x}, {zero_bytes} zero bytes"
        );
        Ok(())
    }

    fn check_range(&self, addr: usize, length: usize) -> VmResult<()> {
        let end = addr.checked_add(length).ok_or(VmError::InvalidAddress(addr))?;

        if !self.config().is_user_address(addr) || end > self.config().user_top {
            return Err(VmError::InvalidAddress(addr));
        }

        Ok(())
    }
}

fn check_free<R: PageReplacer, P: PageTable>(
    inner: &Inner<R, P>,
    id: SpaceId,
    addr: usize,
    pages: usize,
) -> VmResult<()> {
    let space = inner.space(id)?;

    for i in 0..pages {
        let va = addr + i * PAGE_SIZE;
        if space.spt.contains(va) {
            return Err(VmError::AlreadyMapped(va));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::file::MemFile;
    use crate::page_replacer::ClockReplacer;
    use crate::page_table::SoftPageTable;
    use crate::swap::SwapStore;

    const ADDR: usize = 0x1000_0000;

    fn mmu() -> Mmu<ClockReplacer, SoftPageTable> {
        let config = VmConfig::default().with_frame_count(8);
        Mmu::new(config, ClockReplacer::new(), SwapStore::disabled()).unwrap()
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let file = MemFile::new(vec![1; 100]);
        let empty = MemFile::new(Vec::new());

        assert_eq!(mmu.map_file(space, 0, 10, true, &file, 0), Err(VmError::InvalidAddress(0)));
        assert_eq!(
            mmu.map_file(space, ADDR + 1, 10, true, &file, 0),
            Err(VmError::InvalidAddress(ADDR + 1))
        );
        assert!(mmu.map_file(space, ADDR, 0, true, &file, 0).is_err());
        assert!(mmu.map_file(space, ADDR, 10, true, &file, 3).is_err());
        assert!(mmu.map_file(space, ADDR, 10, true, &empty, 0).is_err());

        let top = mmu.config().user_top;
        assert_eq!(
            mmu.map_file(space, top - PAGE_SIZE, 2 * PAGE_SIZE, true, &file, 0),
            Err(VmError::InvalidAddress(top - PAGE_SIZE))
        );

        assert_eq!(file.open_handles(), 1);
        assert_eq!(mmu.page_count(space), 0);
    }

    #[test]
    fn overlapping_mappings_are_rejected() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let file = MemFile::new(vec![1; 3 * PAGE_SIZE]);

        mmu.map_file(space, ADDR + PAGE_SIZE, PAGE_SIZE, true, &file, 0).unwrap();

        assert_eq!(
            mmu.map_file(space, ADDR, 3 * PAGE_SIZE, true, &file, 0),
            Err(VmError::AlreadyMapped(ADDR + PAGE_SIZE))
        );
        assert_eq!(mmu.page_count(space), 1);
        assert_eq!(file.open_handles(), 2);
    }

    #[test]
    fn mapped_pages_read_the_file_lazily() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let data: Vec<u8> = (0..PAGE_SIZE + 10).map(|i| (i % 200) as u8).collect();
        let file = MemFile::new(data.clone());

        mmu.map_file(space, ADDR, 2 * PAGE_SIZE, false, &file, 0).unwrap();
        assert!(!mmu.is_resident(space, ADDR));
        assert_eq!(mmu.page_type(space, ADDR), Some(PageType::File));

        let mut back = vec![0xff; 2 * PAGE_SIZE];
        mmu.read_bytes(space, ADDR, &mut back).unwrap();
        assert_eq!(&back[..data.len()], &data[..]);
        assert!(back[data.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn unmap_requires_the_start_of_a_mapping() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let file = MemFile::new(vec![1; 2 * PAGE_SIZE]);

        mmu.map_file(space, ADDR, 2 * PAGE_SIZE, true, &file, 0).unwrap();

        assert!(mmu.unmap_file(space, ADDR + PAGE_SIZE).is_err());
        assert_eq!(mmu.unmap_file(space, ADDR + 5), Ok(()));
        assert_eq!(file.open_handles(), 1);
        assert_eq!(mmu.unmap_file(space, ADDR), Err(VmError::NotMapped(ADDR)));
    }

    #[test]
    fn file_ranges_past_the_end_of_the_address_space_are_rejected() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let file = MemFile::new(vec![1; PAGE_SIZE]);
        let last_page = usize::MAX & !(PAGE_SIZE - 1);

        assert_eq!(
            mmu.map_file(space, ADDR, 2 * PAGE_SIZE, true, &file, last_page),
            Err(VmError::InvalidArgument("file range overflows"))
        );
        assert_eq!(
            mmu.load_segment(space, &file, last_page, ADDR, PAGE_SIZE, 0, false),
            Err(VmError::InvalidArgument("file range overflows"))
        );

        assert_eq!(mmu.page_count(space), 0);
        assert_eq!(file.open_handles(), 1);

        // the manager is still usable afterwards
        mmu.map_file(space, ADDR, PAGE_SIZE, false, &file, 0).unwrap();
        assert_eq!(mmu.read(space, ADDR), Ok(1));
    }

    #[test]
    fn segments_cannot_be_unmapped() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let image = MemFile::new(vec![7; PAGE_SIZE]);

        mmu.load_segment(space, &image, 0, ADDR, PAGE_SIZE, 0, false).unwrap();
        mmu.read(space, ADDR).unwrap();

        assert_eq!(
            mmu.unmap_file(space, ADDR),
            Err(VmError::InvalidArgument("address is not in a memory-mapped region"))
        );
        assert_eq!(mmu.page_count(space), 1);
        assert_eq!(mmu.read(space, ADDR), Ok(7));
    }

    #[test]
    fn writable_segment_is_private() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let image = MemFile::new(vec![7; PAGE_SIZE + 100]);

        mmu.load_segment(space, &image, 0, ADDR, PAGE_SIZE + 100, PAGE_SIZE - 100, true)
            .unwrap();
        assert_eq!(mmu.page_type(space, ADDR), Some(PageType::Anon));

        mmu.write(space, ADDR + PAGE_SIZE + 50, 1).unwrap();
        assert_eq!(mmu.read(space, ADDR + PAGE_SIZE + 99), Ok(7));
        assert_eq!(mmu.read(space, ADDR + PAGE_SIZE + 100), Ok(0));

        mmu.destroy_address_space(space).unwrap();
        assert!(image.write_log().is_empty());
        assert_eq!(image.open_handles(), 1);
    }

    #[test]
    fn segment_must_be_whole_pages() {
        let mmu = mmu();
        let space = mmu.create_address_space(SoftPageTable::new());
        let image = MemFile::new(vec![7; 100]);

        assert!(mmu.load_segment(space, &image, 0, ADDR, 100, 100, false).is_err());
        assert!(mmu.load_segment(space, &image, 0, ADDR, 0, 0, false).is_err());
        assert!(mmu.load_segment(space, &image, 1, ADDR, 100, PAGE_SIZE - 100, false).is_err());
    }
}
