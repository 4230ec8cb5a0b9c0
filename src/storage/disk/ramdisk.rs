use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::trace;

use crate::config::{buffer_constants::SECTOR_SIZE, QueueConfig};

use super::{
    bio::Direction,
    device::BlockDevice,
    queue::{QueueState, RequestHandler, RequestQueue},
    request::RequestId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamDiskMode {
    // Serve every request from inside the dispatch callback.
    Immediate,
    // Dequeue and park requests until `complete_held`.
    Hold,
    // Like Hold, but requests are started with tags instead of dequeued.
    Tagged,
}

// Memory-backed reference driver.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    mode: Mutex<RamDiskMode>,
    bad_sectors: Mutex<BTreeSet<u64>>,
    held: Mutex<VecDeque<RequestId>>,

    // Sectors completed per step; 0 completes a request in one go.
    completion_chunk: AtomicU32,

    dispatch_calls: AtomicUsize,
    served: AtomicUsize,
    log: Mutex<Vec<(Direction, u64, u32)>>,
}

impl RamDisk {
    pub fn new(capacity_sectors: u64, mode: RamDiskMode) -> Arc<RamDisk> {
        Arc::new(RamDisk {
            data: Mutex::new(vec![0u8; capacity_sectors as usize * SECTOR_SIZE]),
            mode: Mutex::new(mode),
            bad_sectors: Mutex::new(BTreeSet::new()),
            held: Mutex::new(VecDeque::new()),

            completion_chunk: AtomicU32::new(0),

            dispatch_calls: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    // A RAM disk with its own queue and block device.
    pub fn create(
        name: &str,
        capacity_sectors: u64,
        mode: RamDiskMode,
        config: QueueConfig,
    ) -> anyhow::Result<(Arc<RamDisk>, Arc<BlockDevice>)> {
        let disk = RamDisk::new(capacity_sectors, mode);
        let queue = RequestQueue::init(disk.clone(), config);
        if mode == RamDiskMode::Tagged {
            queue.with_state(|q| q.init_tags(config.nr_requests));
        }
        let bdev = BlockDevice::attach(name, queue, capacity_sectors)?;
        Ok((disk, bdev))
    }

    pub fn set_mode(&self, mode: RamDiskMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn fail_sector(&self, sector: u64) {
        self.bad_sectors.lock().unwrap().insert(sector);
    }

    pub fn heal_sector(&self, sector: u64) {
        self.bad_sectors.lock().unwrap().remove(&sector);
    }

    pub fn set_completion_chunk(&self, sectors: u32) {
        self.completion_chunk.store(sectors, Ordering::Relaxed);
    }

    pub fn dispatch_calls(&self) -> usize {
        self.dispatch_calls.load(Ordering::Relaxed)
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::Relaxed)
    }

    pub fn nr_held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    // (direction, first sector, sectors) of every served request.
    pub fn io_log(&self) -> Vec<(Direction, u64, u32)> {
        self.log.lock().unwrap().clone()
    }

    pub fn read_sectors(&self, sector: u64, out: &mut [u8]) {
        let start = sector as usize * SECTOR_SIZE;
        out.copy_from_slice(&self.data.lock().unwrap()[start..start + out.len()]);
    }

    pub fn write_sectors(&self, sector: u64, src: &[u8]) {
        let start = sector as usize * SECTOR_SIZE;
        self.data.lock().unwrap()[start..start + src.len()].copy_from_slice(src);
    }

    // Moves the request's data. False if it touches a failed sector.
    fn transfer(&self, q: &QueueState, id: RequestId) -> bool {
        let req = q.request(id);
        let first = req.hard_sector;
        let last = first + req.hard_nr_sectors as u64;
        if self.bad_sectors.lock().unwrap().range(first..last).next().is_some() {
            return false;
        }

        let mut data = self.data.lock().unwrap();
        for bio in req.bios() {
            let mut pos = bio.sector() as usize * SECTOR_SIZE;
            for vec in bio.segments() {
                match bio.dir() {
                    Direction::Read => vec.page.copy_from(vec.offset, &data[pos..pos + vec.len]),
                    Direction::Write => vec.page.copy_to(vec.offset, &mut data[pos..pos + vec.len]),
                }
                pos += vec.len;
            }
        }

        self.log
            .lock()
            .unwrap()
            .push((req.dir(), first, req.hard_nr_sectors));
        true
    }

    fn complete(&self, q: &mut QueueState, id: RequestId) {
        let ok = self.transfer(q, id);

        let chunk = self.completion_chunk.load(Ordering::Relaxed);
        let step = if chunk == 0 {
            q.request(id).hard_nr_sectors
        } else {
            chunk
        };
        while q.end_that_request_first(id, ok, step) {}

        if q.request(id).tag().is_some() {
            q.end_tag(id);
        }
        q.end_that_request_last(id);
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    // Serves every parked request. Returns how many were completed.
    pub fn complete_held(&self, queue: &RequestQueue) -> usize {
        queue.with_state(|q| {
            let held: Vec<RequestId> = self.held.lock().unwrap().drain(..).collect();
            for &id in &held {
                self.complete(q, id);
            }
            held.len()
        })
    }

    // Pops one parked request without serving it.
    pub fn take_held(&self) -> Option<RequestId> {
        self.held.lock().unwrap().pop_front()
    }
}

impl RequestHandler for RamDisk {
    fn request_fn(&self, q: &mut QueueState) {
        self.dispatch_calls.fetch_add(1, Ordering::Relaxed);
        let mode = *self.mode.lock().unwrap();

        while let Some(id) = q.elv_next_request() {
            trace!("ramdisk: dispatch {:?} ({:?})", id, mode);
            match mode {
                RamDiskMode::Immediate => {
                    q.dequeue_request(id);
                    self.complete(q, id);
                }
                RamDiskMode::Hold => {
                    q.dequeue_request(id);
                    self.held.lock().unwrap().push_back(id);
                }
                RamDiskMode::Tagged => {
                    if q.start_tag(id).is_none() {
                        break;
                    }
                    self.held.lock().unwrap().push_back(id);
                }
            }
        }
    }
}
