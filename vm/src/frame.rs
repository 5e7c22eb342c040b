//! The frame table: physical memory, who owns each frame, and eviction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;

use log::debug;

use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::mmu::{AddressSpace, SpaceId};
use crate::page_replacer::{Candidate, PageEvent, PageReplacer};
use crate::page_table::PageTable;
use crate::swap::SwapStore;

/// Index of a physical frame in the frame table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(usize);

impl FrameId {
    pub const fn new(index: usize) -> Self {
        FrameId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame.
    pub fn phys_addr(self) -> usize {
        self.0 * PAGE_SIZE
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The resident page a frame belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameOwner {
    pub space: SpaceId,
    pub va: usize,
}

#[derive(Clone, Debug, Default)]
struct FrameEntry {
    owner: Option<FrameOwner>,
    pinned: bool,
}

pub struct FrameTable<R> {
    memory: Vec<u8>,
    entries: Vec<FrameEntry>,
    free_frames: VecDeque<FrameId>,
    replacer: R,
}

impl<R: PageReplacer> FrameTable<R> {
    pub fn new(frame_count: usize, replacer: R) -> Self {
        FrameTable {
            memory: vec![0; frame_count * PAGE_SIZE],
            entries: vec![FrameEntry::default(); frame_count],
            free_frames: (0..frame_count).map(FrameId).collect(),
            replacer,
        }
    }

    fn frame_range(frame: FrameId) -> Range<usize> {
        Range {
            start: frame.0 * PAGE_SIZE,
            end: (frame.0 + 1) * PAGE_SIZE,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_frames.len()
    }

    pub fn owner(&self, frame: FrameId) -> Option<FrameOwner> {
        self.entries[frame.0].owner
    }

    pub fn bytes(&self, frame: FrameId) -> &[u8] {
        &self.memory[Self::frame_range(frame)]
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        &mut self.memory[Self::frame_range(frame)]
    }

    pub fn copy(&mut self, from: FrameId, to: FrameId) {
        self.memory
            .copy_within(Self::frame_range(from), Self::frame_range(to).start);
    }

    /// Takes a zeroed frame from the free pool, if any is left.
    pub fn take_free(&mut self) -> Option<FrameId> {
        let frame = self.free_frames.pop_front()?;
        self.bytes_mut(frame).fill(0);
        Some(frame)
    }

    /// Records `owner` as the resident page of `frame`.
    pub fn assign(&mut self, frame: FrameId, owner: FrameOwner) {
        let entry = &mut self.entries[frame.0];
        assert!(
            entry.owner.is_none(),
            "frame {frame} reassigned while still owned by {:?}",
            entry.owner
        );

        entry.owner = Some(owner);
        self.replacer.page_event(PageEvent::Loaded(frame));
    }

    /// Returns `frame` to the free pool. The caller must already have cleared
    /// the hardware mapping that pointed at it.
    pub fn release(&mut self, frame: FrameId) {
        self.disown(frame);
        self.free_frames.push_back(frame);
    }

    fn disown(&mut self, frame: FrameId) {
        let entry = &mut self.entries[frame.0];
        if entry.owner.take().is_some() {
            self.replacer.page_event(PageEvent::Released(frame));
        }
        entry.pinned = false;
    }

    /// Keeps `frame` out of victim selection until [`FrameTable::unpin`].
    pub fn pin(&mut self, frame: FrameId) {
        self.entries[frame.0].pinned = true;
    }

    pub fn unpin(&mut self, frame: FrameId) {
        self.entries[frame.0].pinned = false;
    }

    /// Hands out a zeroed frame, evicting a resident page when the pool is
    /// empty. The frame is not assigned to anyone yet.
    pub fn allocate<P: PageTable>(
        &mut self,
        swap: &mut SwapStore,
        spaces: &mut HashMap<SpaceId, AddressSpace<P>>,
    ) -> VmResult<FrameId> {
        if let Some(frame) = self.take_free() {
            return Ok(frame);
        }

        let victim = self.select_victim(spaces).ok_or(VmError::OutOfFrames)?;

        let Some(owner) = self.entries[victim.0].owner else {
            panic!("victim frame {victim} has no owner");
        };
        let Some(space) = spaces.get_mut(&owner.space) else {
            panic!("frame {victim} owned by unknown address space {}", owner.space);
        };
        let Some(page) = space.spt.find_mut(owner.va) else {
            panic!("frame {victim} owned by missing page {:#x}", owner.va);
        };

        debug!("evicting page {:#x} of space {} from frame {victim}", owner.va, owner.space);

        page.evict(&self.memory[Self::frame_range(victim)], swap, &mut space.page_table)?;
        page.set_frame(None);

        self.disown(victim);
        self.bytes_mut(victim).fill(0);

        Ok(victim)
    }

    fn select_victim<P: PageTable>(
        &mut self,
        spaces: &mut HashMap<SpaceId, AddressSpace<P>>,
    ) -> Option<FrameId> {
        let FrameTable { entries, replacer, .. } = self;

        replacer.pick_replacement_frame(entries.len(), &mut |frame| {
            let entry = &entries[frame.0];
            let owner = match entry.owner {
                Some(owner) if !entry.pinned => owner,
                _ => return Candidate::Unavailable,
            };

            let Some(space) = spaces.get_mut(&owner.space) else {
                return Candidate::Unavailable;
            };

            if space.page_table.is_accessed(owner.va) {
                space.page_table.set_accessed(owner.va, false);
                Candidate::Referenced
            } else {
                Candidate::Idle
            }
        })
    }
}
