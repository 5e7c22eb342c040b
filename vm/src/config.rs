use crate::error::{VmError, VmResult};

/// Size of a page and of a physical frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of one sector of the swap device, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors backing one swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Exit status recorded for an address space whose fault could not be resolved.
pub const KILLED_EXIT_STATUS: i32 = -1;

/// Layout and sizing of the memory manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames in the user pool.
    pub frame_count: usize,
    /// Lowest legal user address. The null page is never mapped.
    pub user_base: usize,
    /// First address past the user range (the kernel base).
    pub user_top: usize,
    /// Address right above the initial stack page.
    pub stack_top: usize,
    /// How far below `stack_top` the stack may grow.
    pub stack_limit: usize,
    /// Faults this many bytes below the stack pointer still count as stack growth.
    pub stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            frame_count: 64,
            user_base: PAGE_SIZE,
            user_top: 0x80_0400_0000,
            stack_top: 0x4748_0000,
            stack_limit: 1 << 20,
            stack_slack: 8,
        }
    }
}

impl VmConfig {
    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_stack(mut self, stack_top: usize, stack_limit: usize) -> Self {
        self.stack_top = stack_top;
        self.stack_limit = stack_limit;
        self
    }

    /// Lowest address the stack may grow down to.
    pub fn stack_bottom(&self) -> usize {
        self.stack_top.saturating_sub(self.stack_limit)
    }

    pub fn is_user_address(&self, addr: usize) -> bool {
        addr >= self.user_base && addr < self.user_top
    }

    pub fn validate(&self) -> VmResult<()> {
        if self.frame_count == 0 {
            return Err(VmError::InvalidConfig("frame pool is empty"));
        }

        let bounds = [self.user_base, self.user_top, self.stack_top, self.stack_limit];
        if bounds.iter().any(|b| !is_page_aligned(*b)) {
            return Err(VmError::InvalidConfig("bounds must be page aligned"));
        }

        if self.user_base == 0 || self.user_base >= self.user_top {
            return Err(VmError::InvalidConfig("empty user range"));
        }

        if self.stack_top > self.user_top || self.stack_bottom() < self.user_base {
            return Err(VmError::InvalidConfig("stack lies outside the user range"));
        }

        Ok(())
    }
}

pub fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_SIZE - 1)
}

pub fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

pub fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(VmConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_empty_pool_and_misplaced_stack() {
        let empty = VmConfig::default().with_frame_count(0);
        assert!(matches!(empty.validate(), Err(VmError::InvalidConfig(_))));

        let config = VmConfig::default();
        let stack_above_kernel = config.clone().with_stack(config.user_top + PAGE_SIZE, PAGE_SIZE);
        assert!(matches!(stack_above_kernel.validate(), Err(VmError::InvalidConfig(_))));
    }

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert!(is_page_aligned(0x3000));
    }
}
