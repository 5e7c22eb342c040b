use thiserror::Error;

use crate::mmu::SpaceId;

pub type VmResult<T> = Result<T, VmError>;

/// Errors surfaced by the memory manager.
///
/// None of these are fatal to the kernel: the fault handler turns them into the
/// termination of the faulting address space only. Contract violations (a
/// double swap-slot free, a frame handed out twice) panic instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("address {0:#x} is outside the user address space")]
    InvalidAddress(usize),

    #[error("no page is mapped at {0:#x}")]
    NotMapped(usize),

    #[error("access at {0:#x} exceeds the stack growth limit")]
    StackLimit(usize),

    #[error("protection violation at {0:#x}")]
    ProtectionViolation(usize),

    #[error("a page is already mapped at {0:#x}")]
    AlreadyMapped(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no frame can be evicted")]
    OutOfFrames,

    #[error("swap device is full")]
    SwapFull,

    #[error("{op} of disk sector {sector} failed")]
    Disk { op: &'static str, sector: usize },

    #[error("short read at file offset {offset:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: usize, wanted: usize, got: usize },

    #[error("short write at file offset {offset:#x}: wanted {wanted} bytes, got {got}")]
    ShortWrite { offset: usize, wanted: usize, got: usize },

    #[error("could not reopen the backing file")]
    ReopenFailed,

    #[error("page table refused to map {0:#x}")]
    InstallFailed(usize),

    #[error("unknown address space {0}")]
    UnknownSpace(SpaceId),

    #[error("address space {0} has been terminated")]
    Terminated(SpaceId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl VmError {
    /// True for the errors caused by the process touching memory it does not own.
    pub fn is_address_violation(&self) -> bool {
        matches!(
            self,
            VmError::InvalidAddress(_)
                | VmError::NotMapped(_)
                | VmError::StackLimit(_)
                | VmError::ProtectionViolation(_)
        )
    }
}
