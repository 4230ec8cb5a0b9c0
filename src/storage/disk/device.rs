use std::{
    sync::{
        atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use log::{error, info};

use crate::{
    buffer::{buffer_cache::invalidate_bdev, flusher::sync_blockdev},
    config::buffer_constants::{PAGE_SIZE, SECTOR_SHIFT},
    error::{BlkError, BlkResult},
    storage::mapping::{AddressSpace, MappingHost},
};

use super::{
    bio::{Bio, BioFlags, Direction},
    queue::RequestQueue,
};

const DEFAULT_BLOCK_SIZE: u32 = 1024;

static NEXT_DEV: AtomicU32 = AtomicU32::new(1);

// Per-disk I/O accounting.
#[derive(Debug, Default)]
pub struct DiskStats {
    ios: [AtomicU64; 2],
    sectors: [AtomicU64; 2],
    merges: [AtomicU64; 2],
    ticks_ms: [AtomicU64; 2],
    in_flight: AtomicI64,
}

impl DiskStats {
    pub(crate) fn account_io(&self, dir: Direction, nr_sectors: u32, new_io: bool) {
        let rw = dir.index();
        self.sectors[rw].fetch_add(nr_sectors as u64, Ordering::Relaxed);
        if new_io {
            self.in_flight.fetch_add(1, Ordering::Relaxed);
        } else {
            self.merges[rw].fetch_add(1, Ordering::Relaxed);
        }
    }

    // Two queued requests became one.
    pub(crate) fn request_merged(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn account_completion(&self, dir: Direction, duration: Duration) {
        let rw = dir.index();
        self.ios[rw].fetch_add(1, Ordering::Relaxed);
        self.ticks_ms[rw].fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn ios(&self, dir: Direction) -> u64 {
        self.ios[dir.index()].load(Ordering::Relaxed)
    }

    pub fn sectors(&self, dir: Direction) -> u64 {
        self.sectors[dir.index()].load(Ordering::Relaxed)
    }

    pub fn merges(&self, dir: Direction) -> u64 {
        self.merges[dir.index()].load(Ordering::Relaxed)
    }

    pub fn ticks_ms(&self, dir: Direction) -> u64 {
        self.ticks_ms[dir.index()].load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

pub struct BlockDevice {
    dev: u32,
    name: String,
    queue: Arc<RequestQueue>,
    capacity: AtomicU64,
    block_size: AtomicU32,
    mapping: Arc<AddressSpace>,
    stats: Arc<DiskStats>,
}

impl std::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("dev", &self.dev)
            .field("name", &self.name)
            .field("capacity", &self.capacity_sectors())
            .finish()
    }
}

impl BlockDevice {
    pub fn new(name: &str, queue: Arc<RequestQueue>, capacity_sectors: u64) -> Arc<BlockDevice> {
        let block_size = DEFAULT_BLOCK_SIZE.max(queue.limits().hardsect_size);
        Arc::new_cyclic(|bdev| BlockDevice {
            dev: NEXT_DEV.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            queue,
            capacity: AtomicU64::new(capacity_sectors),
            block_size: AtomicU32::new(block_size),
            mapping: AddressSpace::new(
                MappingHost::BlockDevice(bdev.clone()),
                block_size.trailing_zeros(),
            ),
            stats: Arc::new(DiskStats::default()),
        })
    }

    // Binds a device to a live queue, taking a queue reference.
    pub fn attach(
        name: &str,
        queue: Arc<RequestQueue>,
        capacity_sectors: u64,
    ) -> anyhow::Result<Arc<BlockDevice>> {
        queue
            .get_queue()
            .with_context(|| format!("attaching {} to queue {}", name, queue.id()))?;
        info!("{}: {} sectors", name, capacity_sectors);
        Ok(Self::new(name, queue, capacity_sectors))
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn set_capacity(&self, sectors: u64) {
        self.capacity.store(sectors, Ordering::Release);
    }

    pub fn size_bytes(&self) -> u64 {
        self.capacity_sectors() << SECTOR_SHIFT
    }

    pub fn hardsect_size(&self) -> u32 {
        self.queue.limits().hardsect_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Acquire)
    }

    // Changing the soft block size drops every cached buffer of the old size.
    pub fn set_blocksize(&self, size: u32) -> BlkResult<()> {
        if !size.is_power_of_two() || size < 512 || size as usize > PAGE_SIZE {
            return Err(BlkError::InvalidArgument);
        }
        if size < self.hardsect_size() {
            return Err(BlkError::InvalidArgument);
        }

        if self.block_size() != size {
            sync_blockdev(self)?;
            self.block_size.store(size, Ordering::Release);
            self.mapping.set_blkbits(size.trailing_zeros());
            invalidate_bdev(self, true);
        }
        Ok(())
    }

    pub fn mapping(&self) -> &Arc<AddressSpace> {
        &self.mapping
    }

    pub fn stats(&self) -> &Arc<DiskStats> {
        &self.stats
    }
}

// Routes `bio` to its device's queue after checking it against the device size
// and the queue's limits. Failures complete the bio with an error.
pub fn generic_make_request(mut bio: Bio) {
    let nr_sectors = bio.sectors() as u64;

    let maxsector = bio.bdev().capacity_sectors();
    if maxsector > 0 && (maxsector < nr_sectors || maxsector - nr_sectors < bio.sector()) {
        info!(
            "attempt to access beyond end of device {}: sector {} + {} > {}",
            bio.bdev().name(),
            bio.sector(),
            nr_sectors,
            maxsector
        );
        bio.set_flags(BioFlags::EOF);
        bio.endio(BlkError::BeyondEnd);
        return;
    }

    loop {
        let queue = Arc::clone(bio.bdev().queue());

        let limits = queue.limits();
        if nr_sectors > limits.max_sectors as u64 {
            error!(
                "bio too big device {} ({} > {})",
                bio.bdev().name(),
                nr_sectors,
                limits.max_sectors
            );
            bio.endio(BlkError::TooBig);
            return;
        }

        if queue.is_dead() {
            bio.endio(BlkError::DeadQueue);
            return;
        }

        match queue.submit(bio) {
            Some(remapped) => bio = remapped,
            None => break,
        }
    }
}

pub fn submit_bio(dir: Direction, mut bio: Bio) {
    bio.set_dir(dir);
    generic_make_request(bio);
}
