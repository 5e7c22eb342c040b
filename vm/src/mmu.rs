//! The memory manager: frame table, swap store and every address space's
//! pages, behind one lock.
//!
//! A fault in one address space may evict a frame that belongs to another, so
//! all of this state is shared and every operation runs with the lock held
//! from start to end, I/O included.

use std::collections::HashMap;
use std::fmt;

use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::config::{page_offset, page_round_down, VmConfig, PAGE_SIZE};
use crate::error::{VmError, VmResult};
use crate::fault::{FaultFlags, FaultVerdict, PageFault};
use crate::frame::{FrameId, FrameOwner, FrameTable};
use crate::page::{Initializer, Page, PageType};
use crate::page_replacer::PageReplacer;
use crate::page_table::PageTable;
use crate::spt::SupplementalPageTable;
use crate::swap::SwapStore;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(u32);

impl SpaceId {
    pub const fn new(id: u32) -> Self {
        SpaceId(id)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct AddressSpace<P> {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) page_table: P,
    pub(crate) rsp: usize,
    pub(crate) exit_status: Option<i32>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub frames: usize,
    pub free_frames: usize,
    pub swap_slots: usize,
    pub used_swap_slots: usize,
}

impl MemoryStats {
    pub fn resident_frames(&self) -> usize {
        self.frames - self.free_frames
    }
}

pub(crate) struct Inner<R, P> {
    pub(crate) frames: FrameTable<R>,
    pub(crate) swap: SwapStore,
    pub(crate) spaces: HashMap<SpaceId, AddressSpace<P>>,
    next_space: u32,
}

impl<R: PageReplacer, P: PageTable> Inner<R, P> {
    pub(crate) fn space(&self, id: SpaceId) -> VmResult<&AddressSpace<P>> {
        self.spaces.get(&id).ok_or(VmError::UnknownSpace(id))
    }

    pub(crate) fn space_mut(&mut self, id: SpaceId) -> VmResult<&mut AddressSpace<P>> {
        self.spaces.get_mut(&id).ok_or(VmError::UnknownSpace(id))
    }

    /// Makes the page at `va` resident and mapped, returning its frame.
    ///
    /// On error the page is left non-resident and no mapping is installed.
    pub(crate) fn claim(&mut self, id: SpaceId, va: usize) -> VmResult<FrameId> {
        let va = page_round_down(va);

        let page = self.space(id)?.spt.find(va).ok_or(VmError::NotMapped(va))?;
        if let Some(frame) = page.frame() {
            return Ok(frame);
        }

        // may evict any page but this one, which is not resident
        let frame = self.frames.allocate(&mut self.swap, &mut self.spaces)?;

        let Inner {
            frames,
            swap,
            spaces,
            ..
        } = self;
        let Some(space) = spaces.get_mut(&id) else {
            panic!("address space {id} vanished while claiming {va:#x}");
        };
        let Some(page) = space.spt.find_mut(va) else {
            panic!("page {va:#x} vanished while being claimed");
        };

        if !space.page_table.install(va, frame, page.writable()) {
            frames.release(frame);
            return Err(VmError::InstallFailed(va));
        }

        if let Err(err) = page.materialize(frames.bytes_mut(frame), swap) {
            space.page_table.clear(va);
            frames.release(frame);
            return Err(err);
        }

        page.set_frame(Some(frame));
        frames.assign(frame, FrameOwner { space: id, va });

        debug!("space {id}: page {va:#x} resident in frame {frame}");
        Ok(frame)
    }

    /// Unlinks the page at `va` and destroys it, flushing it first if it is a
    /// dirty file-backed page. The page is gone even if the flush fails.
    pub(crate) fn remove_page(&mut self, id: SpaceId, va: usize) -> VmResult<()> {
        let Inner {
            frames,
            swap,
            spaces,
            ..
        } = self;
        let space = spaces.get_mut(&id).ok_or(VmError::UnknownSpace(id))?;
        let page = space.spt.remove(va).ok_or(VmError::NotMapped(va))?;

        let mut result = Ok(());
        if let Some(frame) = page.frame() {
            result = page
                .write_back(frames.bytes(frame), &mut space.page_table)
                .map(|_| ());
            space.page_table.clear(page.va());
            frames.release(frame);
        }

        if let Err(err) = &result {
            warn!("space {id}: lost the contents of page {:#x}: {err}", page.va());
        }

        page.destroy(swap);
        result
    }

    /// Copies every page of `src` into `dst`. On error `dst` is left
    /// partially populated and must be destroyed by the caller.
    pub(crate) fn duplicate(&mut self, dst: SpaceId, src: SpaceId) -> VmResult<()> {
        if dst == src {
            return Err(VmError::InvalidArgument("cannot duplicate an address space into itself"));
        }
        self.space(dst)?;

        let vas = self.space(src)?.spt.addresses();
        for va in vas {
            let (child, needs_copy) = {
                let page = self.space(src)?.spt.find(va).ok_or(VmError::NotMapped(va))?;
                (page.duplicate(), page.needs_copy())
            };

            if needs_copy {
                self.copy_resident(dst, src, child)?;
            } else {
                self.space_mut(dst)?.spt.insert(child)?;
            }
        }

        Ok(())
    }

    fn copy_resident(&mut self, dst: SpaceId, src: SpaceId, mut child: Page) -> VmResult<()> {
        let va = child.va();
        if self.space(dst)?.spt.contains(va) {
            return Err(VmError::AlreadyMapped(va));
        }

        let from = self.claim(src, va)?;

        self.frames.pin(from);
        let to = self.frames.allocate(&mut self.swap, &mut self.spaces);
        self.frames.unpin(from);
        let to = to?;

        self.frames.copy(from, to);
        let dirty = self.space(src)?.page_table.is_dirty(va);

        let Inner { frames, spaces, .. } = self;
        let Some(space) = spaces.get_mut(&dst) else {
            frames.release(to);
            return Err(VmError::UnknownSpace(dst));
        };

        if !space.page_table.install(va, to, child.writable()) {
            frames.release(to);
            return Err(VmError::InstallFailed(va));
        }
        space.page_table.set_dirty(va, dirty);

        child.set_frame(Some(to));
        space.spt.insert(child)?;
        frames.assign(to, FrameOwner { space: dst, va });

        trace!("copied page {va:#x} from frame {from} to {to}");
        Ok(())
    }

    /// Destroys every page of `id` and forgets the address space.
    pub(crate) fn teardown(&mut self, id: SpaceId) -> VmResult<()> {
        let mut first_err = None;

        let vas = self.space(id)?.spt.addresses();
        for va in vas {
            if let Err(err) = self.remove_page(id, va) {
                first_err.get_or_insert(err);
            }
        }

        self.spaces.remove(&id);
        first_err.map_or(Ok(()), Err)
    }
}

/// The virtual memory manager of the kernel.
///
/// `R` picks eviction victims; `P` is the hardware page table of each
/// address space.
pub struct Mmu<R, P> {
    config: VmConfig,
    inner: Mutex<Inner<R, P>>,
}

impl<R: PageReplacer, P: PageTable> Mmu<R, P> {
    pub fn new(config: VmConfig, replacer: R, swap: SwapStore) -> VmResult<Self> {
        config.validate()?;

        info!(
            "mmu: {} frames of {PAGE_SIZE} bytes, {} swap slots",
            config.frame_count,
            swap.slot_count()
        );

        let inner = Inner {
            frames: FrameTable::new(config.frame_count, replacer),
            swap,
            spaces: HashMap::new(),
            next_space: 1,
        };

        Ok(Mmu {
            config,
            inner: Mutex::new(inner),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, Inner<R, P>> {
        self.inner.lock()
    }

    /// Registers a new, empty address space translated by `page_table`.
    pub fn create_address_space(&self, page_table: P) -> SpaceId {
        let mut inner = self.lock();

        let id = SpaceId(inner.next_space);
        inner.next_space += 1;

        inner.spaces.insert(
            id,
            AddressSpace {
                spt: SupplementalPageTable::new(),
                page_table,
                rsp: self.config.stack_top,
                exit_status: None,
            },
        );

        info!("space {id}: created");
        id
    }

    /// Gives `dst` a private copy of every page of `src`.
    ///
    /// Anonymous pages and resident file-backed pages are copied right away;
    /// pages that were never loaded are copied as their loading recipe. On
    /// error the caller must destroy `dst`.
    pub fn duplicate_address_space(&self, dst: SpaceId, src: SpaceId) -> VmResult<()> {
        let mut inner = self.lock();

        let result = inner.duplicate(dst, src);
        match &result {
            Ok(()) => info!("space {dst}: duplicated from {src}"),
            Err(err) => warn!("space {dst}: duplicating {src} failed: {err}"),
        }

        result
    }

    /// Tears down an address space, writing dirty file-backed pages back and
    /// releasing every frame and swap slot it holds.
    pub fn destroy_address_space(&self, id: SpaceId) -> VmResult<()> {
        let result = self.lock().teardown(id);
        info!("space {id}: destroyed");
        result
    }

    /// Exit status forced on the space by an unresolved fault, if any.
    pub fn exit_status(&self, id: SpaceId) -> Option<i32> {
        self.lock().space(id).ok().and_then(|space| space.exit_status)
    }

    /// Records the user stack pointer used to judge stack growth on
    /// simulated accesses and on faults taken in kernel mode.
    pub fn set_stack_pointer(&self, id: SpaceId, rsp: usize) -> VmResult<()> {
        self.lock().space_mut(id)?.rsp = rsp;
        Ok(())
    }

    /// Maps and loads the first stack page. Returns the initial stack pointer.
    pub fn setup_stack(&self, id: SpaceId) -> VmResult<usize> {
        let va = self.config.stack_top - PAGE_SIZE;
        let mut inner = self.lock();

        let page = Page::new(va, true, PageType::Anon, Initializer::Zero)?;
        inner.space_mut(id)?.spt.insert(page)?;
        if let Err(err) = inner.claim(id, va) {
            inner.space_mut(id)?.spt.remove(va);
            return Err(err);
        }
        inner.space_mut(id)?.rsp = self.config.stack_top;

        Ok(self.config.stack_top)
    }

    /// Registers an uninitialized page at `va` that becomes `target` on its
    /// first fault. No frame is allocated.
    pub fn create_page(
        &self,
        id: SpaceId,
        target: PageType,
        va: usize,
        writable: bool,
        init: Initializer,
    ) -> VmResult<()> {
        if va != page_round_down(va) || !self.config.is_user_address(va) {
            return Err(VmError::InvalidAddress(va));
        }

        let page = Page::new(va, writable, target, init)?;
        self.lock().space_mut(id)?.spt.insert(page)
    }

    /// Loads the page at `va` now instead of on its first fault.
    pub fn claim_page(&self, id: SpaceId, va: usize) -> VmResult<()> {
        self.lock().claim(id, va).map(|_| ())
    }

    pub fn read(&self, id: SpaceId, va: usize) -> VmResult<u8> {
        let mut byte = [0u8];
        self.read_bytes(id, va, &mut byte)?;
        Ok(byte[0])
    }

    pub fn write(&self, id: SpaceId, va: usize, value: u8) -> VmResult<()> {
        self.write_bytes(id, va, &[value])
    }

    /// Reads user memory the way the process would, faulting pages in.
    pub fn read_bytes(&self, id: SpaceId, va: usize, buf: &mut [u8]) -> VmResult<()> {
        let mut inner = self.lock();

        let mut done = 0;
        while done < buf.len() {
            let addr = va.checked_add(done).ok_or(VmError::InvalidAddress(va))?;
            let offset = page_offset(addr);
            let n = (PAGE_SIZE - offset).min(buf.len() - done);

            let frame = self.translate(&mut inner, id, addr, false)?;
            buf[done..done + n].copy_from_slice(&inner.frames.bytes(frame)[offset..offset + n]);
            done += n;
        }

        Ok(())
    }

    /// Writes user memory the way the process would, faulting pages in and
    /// leaving them dirty.
    pub fn write_bytes(&self, id: SpaceId, va: usize, data: &[u8]) -> VmResult<()> {
        let mut inner = self.lock();

        let mut done = 0;
        while done < data.len() {
            let addr = va.checked_add(done).ok_or(VmError::InvalidAddress(va))?;
            let offset = page_offset(addr);
            let n = (PAGE_SIZE - offset).min(data.len() - done);

            let frame = self.translate(&mut inner, id, addr, true)?;
            inner.frames.bytes_mut(frame)[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }

        Ok(())
    }

    /// Resolves `addr` to its frame like the hardware would, setting the
    /// accessed and dirty bits and raising faults for missing translations.
    fn translate(
        &self,
        inner: &mut Inner<R, P>,
        id: SpaceId,
        addr: usize,
        write: bool,
    ) -> VmResult<FrameId> {
        let space = inner.space(id)?;
        if space.exit_status.is_some() {
            return Err(VmError::Terminated(id));
        }
        let rsp = space.rsp;

        let mut flags = FaultFlags::USER;
        flags.set(FaultFlags::WRITE, write);

        // a resolved fault installs the translation, so two rounds suffice
        for _ in 0..2 {
            let space = inner.space_mut(id)?;

            match space.page_table.lookup(addr) {
                Some(entry) if write && !entry.writable() => {
                    let fault = PageFault::new(addr, flags | FaultFlags::PRESENT, rsp);
                    return match self.fault_locked(inner, id, fault) {
                        FaultVerdict::Terminate(err) => Err(err),
                        FaultVerdict::Handled => Err(VmError::ProtectionViolation(addr)),
                    };
                }
                Some(entry) => {
                    space.page_table.set_accessed(addr, true);
                    if write {
                        space.page_table.set_dirty(addr, true);
                    }

                    trace!("space {id}: {addr:#x} -> frame {}", entry.frame);
                    return Ok(entry.frame);
                }
                None => {
                    let fault = PageFault::new(addr, flags, rsp);
                    if let FaultVerdict::Terminate(err) = self.fault_locked(inner, id, fault) {
                        return Err(err);
                    }
                }
            }
        }

        Err(VmError::NotMapped(addr))
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.lock();

        MemoryStats {
            frames: inner.frames.frame_count(),
            free_frames: inner.frames.free_count(),
            swap_slots: inner.swap.slot_count(),
            used_swap_slots: inner.swap.used_slots(),
        }
    }

    pub fn frame_of(&self, id: SpaceId, va: usize) -> Option<FrameId> {
        let inner = self.lock();
        inner.space(id).ok()?.spt.find(va)?.frame()
    }

    pub fn is_resident(&self, id: SpaceId, va: usize) -> bool {
        self.frame_of(id, va).is_some()
    }

    /// Type of the page at `va`; for an uninitialized page, the type it
    /// will become.
    pub fn page_type(&self, id: SpaceId, va: usize) -> Option<PageType> {
        let inner = self.lock();
        inner.space(id).ok()?.spt.find(va).map(Page::page_type)
    }

    /// Number of pages registered in the address space.
    pub fn page_count(&self, id: SpaceId) -> usize {
        self.lock().space(id).map_or(0, |space| space.spt.len())
    }

    /// Copy of a resident page's frame. Does not fault and does not touch
    /// the accessed bit.
    pub fn snapshot_page(&self, id: SpaceId, va: usize) -> Option<Vec<u8>> {
        let inner = self.lock();
        let frame = inner.space(id).ok()?.spt.find(va)?.frame()?;
        Some(inner.frames.bytes(frame).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECTORS_PER_SLOT;
    use crate::disk::RamDisk;
    use crate::page_replacer::ClockReplacer;
    use crate::page_table::SoftPageTable;

    fn mmu(frames: usize, slots: usize) -> Mmu<ClockReplacer, SoftPageTable> {
        let config = VmConfig::default().with_frame_count(frames);
        let swap = SwapStore::new(Box::new(RamDisk::new(slots * SECTORS_PER_SLOT)));
        Mmu::new(config, ClockReplacer::new(), swap).unwrap()
    }

    const VA: usize = 0x1000_0000;

    #[test]
    fn pages_are_lazy() {
        let mmu = mmu(2, 2);
        let space = mmu.create_address_space(SoftPageTable::new());

        mmu.create_page(space, PageType::Anon, VA, true, Initializer::Zero).unwrap();
        assert!(!mmu.is_resident(space, VA));
        assert_eq!(mmu.stats().free_frames, 2);

        assert_eq!(mmu.read(space, VA + 10).unwrap(), 0);
        assert!(mmu.is_resident(space, VA));
        assert_eq!(mmu.stats().free_frames, 1);
    }

    #[test]
    fn create_page_rejects_duplicates_and_bad_addresses() {
        let mmu = mmu(1, 0);
        let space = mmu.create_address_space(SoftPageTable::new());

        mmu.create_page(space, PageType::Anon, VA, true, Initializer::Zero).unwrap();
        assert_eq!(
            mmu.create_page(space, PageType::Anon, VA, true, Initializer::Zero),
            Err(VmError::AlreadyMapped(VA))
        );
        assert_eq!(
            mmu.create_page(space, PageType::Anon, VA + 1, true, Initializer::Zero),
            Err(VmError::InvalidAddress(VA + 1))
        );
        assert_eq!(
            mmu.create_page(space, PageType::Anon, 0, true, Initializer::Zero),
            Err(VmError::InvalidAddress(0))
        );
    }

    #[test]
    fn failed_install_leaves_page_unloaded() {
        let mmu = mmu(2, 0);
        let space = mmu.create_address_space(SoftPageTable::with_capacity_limit(0));

        mmu.create_page(space, PageType::Anon, VA, true, Initializer::Zero).unwrap();

        assert_eq!(mmu.claim_page(space, VA), Err(VmError::InstallFailed(VA)));
        assert!(!mmu.is_resident(space, VA));
        assert_eq!(mmu.stats().free_frames, 2);
    }

    #[test]
    fn accesses_span_page_boundaries() {
        let mmu = mmu(4, 0);
        let space = mmu.create_address_space(SoftPageTable::new());
        mmu.create_page(space, PageType::Anon, VA, true, Initializer::Zero).unwrap();
        mmu.create_page(space, PageType::Anon, VA + PAGE_SIZE, true, Initializer::Zero).unwrap();

        let data: Vec<u8> = (0..100).collect();
        mmu.write_bytes(space, VA + PAGE_SIZE - 50, &data).unwrap();

        let mut back = vec![0; 100];
        mmu.read_bytes(space, VA + PAGE_SIZE - 50, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(mmu.snapshot_page(space, VA + PAGE_SIZE).unwrap()[..50], data[50..]);
    }

    #[test]
    fn setup_stack_maps_the_top_page() {
        let mmu = mmu(2, 0);
        let space = mmu.create_address_space(SoftPageTable::new());

        let rsp = mmu.setup_stack(space).unwrap();

        assert_eq!(rsp, mmu.config().stack_top);
        assert!(mmu.is_resident(space, rsp - 1));
        assert_eq!(mmu.page_type(space, rsp - 1), Some(PageType::Anon));
    }

    #[test]
    fn failed_stack_setup_leaves_no_page_behind() {
        let mmu = mmu(2, 0);
        let space = mmu.create_address_space(SoftPageTable::with_capacity_limit(0));

        let top = mmu.config().stack_top;
        assert_eq!(
            mmu.setup_stack(space),
            Err(VmError::InstallFailed(top - PAGE_SIZE))
        );
        assert_eq!(mmu.page_count(space), 0);
        assert_eq!(mmu.stats().free_frames, 2);
    }

    #[test]
    fn teardown_returns_every_frame() {
        let mmu = mmu(2, 4);
        let space = mmu.create_address_space(SoftPageTable::new());
        for i in 0..4 {
            let va = VA + i * PAGE_SIZE;
            mmu.create_page(space, PageType::Anon, va, true, Initializer::Zero).unwrap();
            mmu.write(space, va, i as u8 + 1).unwrap();
        }
        assert_eq!(mmu.stats().used_swap_slots, 2);

        mmu.destroy_address_space(space).unwrap();

        let stats = mmu.stats();
        assert_eq!(stats.free_frames, 2);
        assert_eq!(stats.used_swap_slots, 0);
        assert_eq!(mmu.page_count(space), 0);
        assert_eq!(
            mmu.destroy_address_space(space),
            Err(VmError::UnknownSpace(space))
        );
    }
}
