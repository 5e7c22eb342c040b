//! Page fault resolution.

use bitflags::bitflags;
use log::{debug, warn};

use crate::config::{page_round_down, KILLED_EXIT_STATUS};
use crate::error::{VmError, VmResult};
use crate::mmu::{Inner, Mmu, SpaceId};
use crate::page::{Initializer, Page, PageType};
use crate::page_replacer::PageReplacer;
use crate::page_table::PageTable;

bitflags! {
    /// Error code pushed by the processor with the fault.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FaultFlags: u8 {
        /// The translation existed: a protection violation.
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// Raised while running in user mode.
        const USER = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub flags: FaultFlags,
    /// Stack pointer at the time of the fault. Only meaningful for faults
    /// raised in user mode.
    pub rsp: usize,
}

impl PageFault {
    pub fn new(addr: usize, flags: FaultFlags, rsp: usize) -> Self {
        PageFault { addr, flags, rsp }
    }

    pub fn not_present(&self) -> bool {
        !self.flags.contains(FaultFlags::PRESENT)
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(FaultFlags::WRITE)
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(FaultFlags::USER)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultVerdict {
    Handled,
    /// The faulting address space must be killed.
    Terminate(VmError),
}

impl FaultVerdict {
    pub fn is_handled(&self) -> bool {
        matches!(self, FaultVerdict::Handled)
    }
}

impl<R: PageReplacer, P: PageTable> Mmu<R, P> {
    /// Resolves a page fault raised by address space `id`.
    ///
    /// Either the page ends up resident with its translation installed, or
    /// the address space is marked as killed with [`KILLED_EXIT_STATUS`] and
    /// nothing about its pages has changed.
    pub fn handle_fault(&self, id: SpaceId, fault: PageFault) -> FaultVerdict {
        let mut inner = self.lock();
        self.fault_locked(&mut inner, id, fault)
    }

    pub(crate) fn fault_locked(
        &self,
        inner: &mut Inner<R, P>,
        id: SpaceId,
        fault: PageFault,
    ) -> FaultVerdict {
        debug!(
            "space {id}: fault at {:#x} ({:?}, rsp {:#x})",
            fault.addr, fault.flags, fault.rsp
        );

        match self.resolve(inner, id, &fault) {
            Ok(()) => FaultVerdict::Handled,
            Err(err) => {
                if err.is_address_violation() {
                    warn!("space {id}: segmentation fault at {:#x}: {err}", fault.addr);
                } else {
                    warn!("space {id}: fault at {:#x} could not be served: {err}", fault.addr);
                }

                if let Ok(space) = inner.space_mut(id) {
                    space.exit_status.get_or_insert(KILLED_EXIT_STATUS);
                }

                FaultVerdict::Terminate(err)
            }
        }
    }

    fn resolve(&self, inner: &mut Inner<R, P>, id: SpaceId, fault: &PageFault) -> VmResult<()> {
        let addr = fault.addr;

        if !self.config().is_user_address(addr) {
            return Err(VmError::InvalidAddress(addr));
        }
        if !fault.not_present() {
            return Err(VmError::ProtectionViolation(addr));
        }

        let space = inner.space(id)?;
        if space.exit_status.is_some() {
            return Err(VmError::Terminated(id));
        }

        let va = page_round_down(addr);
        let grown = match space.spt.find(va) {
            Some(page) if fault.is_write() && !page.writable() => {
                return Err(VmError::ProtectionViolation(addr));
            }
            Some(_) => false,
            None => {
                // a fault taken in kernel mode carries the kernel's stack pointer
                let rsp = if fault.is_user() { fault.rsp } else { space.rsp };
                self.check_stack_growth(addr, rsp)?;

                debug!("space {id}: growing the stack to {va:#x}");
                let page = Page::new(va, true, PageType::Anon, Initializer::Zero)?;
                inner.space_mut(id)?.spt.insert(page)?;
                true
            }
        };

        if let Err(err) = inner.claim(id, va) {
            if grown {
                inner.space_mut(id)?.spt.remove(va);
            }
            return Err(err);
        }

        Ok(())
    }

    /// An unmapped address is a legal stack access when it lies inside the
    /// stack region and no further below the stack pointer than a push.
    fn check_stack_growth(&self, addr: usize, rsp: usize) -> VmResult<()> {
        let config = self.config();

        if addr >= config.stack_top {
            return Err(VmError::NotMapped(addr));
        }

        if addr.saturating_add(config.stack_slack) < rsp {
            return Err(VmError::NotMapped(addr));
        }

        if addr < config.stack_bottom() {
            return Err(VmError::StackLimit(addr));
        }

        Ok(())
    }
}
