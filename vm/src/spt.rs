use std::collections::HashMap;

use crate::config::{is_page_aligned, page_round_down};
use crate::error::{VmError, VmResult};
use crate::page::Page;

/// Supplemental page table: every page of one address space, keyed by its
/// page-aligned virtual address.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: HashMap<usize, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable::default()
    }

    pub fn insert(&mut self, page: Page) -> VmResult<()> {
        let va = page.va();
        assert!(is_page_aligned(va), "page address {va:#x} is not aligned");

        if self.pages.contains_key(&va) {
            return Err(VmError::AlreadyMapped(va));
        }

        self.pages.insert(va, page);
        Ok(())
    }

    /// Looks up the page containing `va`.
    pub fn find(&self, va: usize) -> Option<&Page> {
        self.pages.get(&page_round_down(va))
    }

    pub fn find_mut(&mut self, va: usize) -> Option<&mut Page> {
        self.pages.get_mut(&page_round_down(va))
    }

    pub fn contains(&self, va: usize) -> bool {
        self.pages.contains_key(&page_round_down(va))
    }

    pub fn remove(&mut self, va: usize) -> Option<Page> {
        self.pages.remove(&page_round_down(va))
    }

    /// Addresses of every page, in ascending order.
    pub fn addresses(&self) -> Vec<usize> {
        let mut vas: Vec<usize> = self.pages.keys().copied().collect();
        vas.sort_unstable();
        vas
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
