//! Demand-paged virtual memory for a teaching kernel.
//!
//! Every user page is described in a per-address-space supplemental page
//! table and only gets a physical frame when it is first touched. Anonymous
//! pages are evicted to a swap device, file-backed pages to their file. The
//! [`Mmu`] owns the frame pool, the swap store and all address spaces; the
//! hardware page table, the filesystem and the disk are reached through the
//! [`PageTable`], [`File`] and [`BlockDevice`] traits.
//!
//! ```
//! use vm::{ClockReplacer, Mmu, PageType, Initializer, SoftPageTable, SwapStore, VmConfig};
//!
//! let mmu = Mmu::new(VmConfig::default(), ClockReplacer::new(), SwapStore::disabled()).unwrap();
//! let space = mmu.create_address_space(SoftPageTable::new());
//!
//! mmu.create_page(space, PageType::Anon, 0x1000_0000, true, Initializer::Zero).unwrap();
//! mmu.write(space, 0x1000_0042, 7).unwrap();
//! assert_eq!(mmu.read(space, 0x1000_0042).unwrap(), 7);
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod fault;
pub mod file;
pub mod frame;
pub mod mmap;
pub mod mmu;
pub mod page;
pub mod page_replacer;
pub mod page_table;
pub mod spt;
pub mod swap;

pub use config::{VmConfig, KILLED_EXIT_STATUS, PAGE_SIZE, SECTORS_PER_SLOT, SECTOR_SIZE};
pub use disk::{BlockDevice, RamDisk};
pub use error::{VmError, VmResult};
pub use fault::{FaultFlags, FaultVerdict, PageFault};
pub use file::{File, MemFile};
pub use frame::FrameId;
pub use mmu::{MemoryStats, Mmu, SpaceId};
pub use page::{Initializer, PageType};
pub use page_replacer::{ClockReplacer, FifoReplacer, PageReplacer};
pub use page_table::{PageTable, SoftPageTable};
pub use swap::SwapStore;
