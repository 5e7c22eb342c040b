mod host;

use std::env;
use std::error::Error;
use std::fs;

use log::info;
use vm::{
    ClockReplacer, Initializer, Mmu, PageType, SoftPageTable, SwapStore, VmConfig, PAGE_SIZE,
    SECTORS_PER_SLOT,
};

use host::{FileDisk, HostFile};

const FRAMES: usize = 4;
const SWAP_SLOTS: usize = 16;
const HEAP: usize = 0x1000_0000;
const MMAP: usize = 0x2000_0000;

fn dump(label: &str, bytes: &[u8]) {
    println!("{label:>24}: {}", hex::encode(&bytes[..bytes.len().min(16)]));
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let swap_path = args.next().unwrap_or_else(|| "./swapfile.bin".into());
    let mapped_path = args.next().unwrap_or_else(|| "./mapped.bin".into());

    if fs::metadata(&mapped_path).is_err() {
        fs::write(&mapped_path, vec![b'.'; PAGE_SIZE + PAGE_SIZE / 2])?;
    }

    let disk = FileDisk::create(&swap_path, SWAP_SLOTS * SECTORS_PER_SLOT)?;
    let config = VmConfig::default().with_frame_count(FRAMES);
    let mmu = Mmu::new(config, ClockReplacer::new(), SwapStore::new(Box::new(disk)))?;

    let parent = mmu.create_address_space(SoftPageTable::new());
    let rsp = mmu.setup_stack(parent)?;
    info!("parent stack pointer at {rsp:#x}");

    // twice as many heap pages as frames: half of them end up in swap
    let pages = 2 * FRAMES;
    for i in 0..pages {
        let va = HEAP + i * PAGE_SIZE;
        mmu.create_page(parent, PageType::Anon, va, true, Initializer::Zero)?;
        mmu.write_bytes(parent, va, &[0xCA, 0xFE, i as u8, 0xBE, 0xEF])?;
    }
    println!("after filling the heap: {:?}", mmu.stats());

    for i in 0..pages {
        let va = HEAP + i * PAGE_SIZE;
        let mut head = [0u8; 16];
        mmu.read_bytes(parent, va, &mut head)?;
        dump(&format!("heap page {i}"), &head);
    }

    let file = HostFile::open(&mapped_path)?;
    mmu.map_file(parent, MMAP, PAGE_SIZE + PAGE_SIZE / 2, true, &file, 0)?;
    mmu.write_bytes(parent, MMAP + PAGE_SIZE, b"hello from the mmu")?;

    let child = mmu.create_address_space(SoftPageTable::new());
    mmu.duplicate_address_space(child, parent)?;
    mmu.write(child, HEAP, 0x00)?;

    let mut head = [0u8; 16];
    mmu.read_bytes(parent, HEAP, &mut head)?;
    dump("parent heap page 0", &head);
    mmu.read_bytes(child, HEAP, &mut head)?;
    dump("child heap page 0", &head);

    mmu.unmap_file(parent, MMAP)?;
    mmu.destroy_address_space(child)?;
    mmu.destroy_address_space(parent)?;

    let contents = fs::read(&mapped_path)?;
    dump("mapped file, page 1", &contents[PAGE_SIZE..]);
    println!("after teardown: {:?}", mmu.stats());

    Ok(())
}
