pub mod buffer_test;
pub mod completion_test;
pub mod page_buffers_test;
pub mod queue_test;
pub mod tags_test;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use lazy_static::lazy_static;

use crate::{
    buffer::buffer_head::{BhState, BufferHead},
    config::{buffer_constants::PAGE_SIZE, PlugConfig, QueueConfig},
    error::{BlkError, BlkResult, IoStatus},
    storage::{
        disk::{
            bio::{Bio, Direction},
            device::BlockDevice,
            ramdisk::{RamDisk, RamDiskMode},
        },
        mapping::{GetBlock, Inode},
        page::{Page, PageFlags, Zone},
    },
};

lazy_static! {
    static ref SERIAL: Mutex<()> = Mutex::new(());
}

static NEXT_DISK: AtomicUsize = AtomicUsize::new(0);

// `run_queues` unplugs every queue in the process, so tests that watch plug
// state or drive I/O take turns.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Plugging that only ends through an explicit unplug or `run_queues`.
pub(crate) fn manual_unplug_config() -> QueueConfig {
    QueueConfig {
        plug: PlugConfig {
            unplug_thresh: usize::MAX,
            unplug_delay: Duration::from_secs(3600),
        },
        ..Default::default()
    }
}

pub(crate) fn ram_disk(
    sectors: u64,
    mode: RamDiskMode,
    config: QueueConfig,
) -> (Arc<RamDisk>, Arc<BlockDevice>) {
    let name = format!("ram{}", NEXT_DISK.fetch_add(1, Ordering::Relaxed));
    RamDisk::create(&name, sectors, mode, config).unwrap()
}

pub(crate) type Statuses = Arc<Mutex<Vec<IoStatus>>>;

// A bio over whole fresh pages whose completion status lands in `done`.
pub(crate) fn page_bio(
    bdev: &Arc<BlockDevice>,
    sector: u64,
    dir: Direction,
    nr_pages: usize,
    done: &Statuses,
) -> Bio {
    let mut bio = Bio::new(Arc::clone(bdev), sector, dir);
    for _ in 0..nr_pages {
        bio.add_page(Page::alloc(Zone::Normal), PAGE_SIZE, 0);
    }
    let done = Arc::clone(done);
    bio.with_end_io(move |bio| done.lock().unwrap().push(bio.status()))
}

pub(crate) fn statuses() -> Statuses {
    Arc::new(Mutex::new(Vec::new()))
}

// File block `n` lives at disk block `start + n`. Blocks listed as holes are
// unmapped until written.
pub(crate) struct LinearMap {
    bdev: Weak<BlockDevice>,
    start: u64,
    blocks: u64,
    holes: Mutex<HashSet<u64>>,
}

impl GetBlock for LinearMap {
    fn get_block(&self, iblock: u64, bh: &BufferHead, create: bool) -> BlkResult<()> {
        if iblock >= self.blocks {
            return if create { Err(BlkError::NoSpace) } else { Ok(()) };
        }

        let mut holes = self.holes.lock().unwrap();
        if holes.contains(&iblock) {
            if !create {
                return Ok(());
            }
            holes.remove(&iblock);
            bh.set(BhState::NEW);
        }
        let bdev = self.bdev.upgrade().ok_or(BlkError::NoDevice)?;
        bh.map_bh(&bdev, self.start + iblock);
        Ok(())
    }
}

// A 1 KiB-block file of `size` bytes with room for `blocks` blocks, laid out
// from disk block `start`.
pub(crate) fn linear_file(
    bdev: &Arc<BlockDevice>,
    size: u64,
    start: u64,
    blocks: u64,
    holes: &[u64],
) -> Arc<Inode> {
    static NEXT_INO: AtomicUsize = AtomicUsize::new(1);
    let map = LinearMap {
        bdev: Arc::downgrade(bdev),
        start,
        blocks,
        holes: Mutex::new(holes.iter().copied().collect()),
    };
    let ino = NEXT_INO.fetch_add(1, Ordering::Relaxed) as u64;
    Inode::new(ino, bdev, 10, size, Arc::new(map))
}

// Gives a locked page of `inode` the contents `byte` and marks it dirty.
pub(crate) fn dirty_file_page(inode: &Inode, index: u64, byte: u8) -> Arc<Page> {
    let page = inode.mapping().find_or_create_page(index);
    page.copy_from(0, &[byte; PAGE_SIZE]);
    page.set_flag(PageFlags::UPTODATE);
    page.set_page_dirty_nobuffers();
    page.unlock_page();
    page
}
