use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, RwLock, Weak,
    },
    time::Instant,
};

use bitflags::bitflags;
use crossbeam_queue::SegQueue;
use log::{debug, error, trace, warn};

use crate::{
    config::{
        buffer_constants::SECTOR_SHIFT, queue_constants::BLKDEV_MIN_RQ, BatchConfig, PlugConfig,
        QueueConfig, QueueLimits,
    },
    error::{BlkError, BlkResult},
    utils::completion::Completion,
};

use super::{
    bio::{Bio, Direction},
    bounce::blk_queue_bounce,
    congestion::{congestion_off_threshold, congestion_on_threshold, BackingDevInfo},
    elevator::{Elevator, ElevatorMerge, InsertPosition, SortElevator},
    io_context::{get_io_context, IoContext},
    request::{Request, RequestFlags, RequestId, RequestPool},
    scheduler::{plug_list_add, plug_list_remove, BlockWork, KBLOCKD},
    segments::{ScatterEntry, SegmentRules},
    tags::TagTable,
};

bitflags! {
    pub struct QueueFlags: u32 {
        const CLUSTER = 1 << 0;
        // Tagged command queueing enabled.
        const QUEUED = 1 << 1;
        const STOPPED = 1 << 2;
        const READFULL = 1 << 3;
        const WRITEFULL = 1 << 4;
        const DEAD = 1 << 5;
        const PLUGGED = 1 << 6;
    }
}

fn full_flag(dir: Direction) -> QueueFlags {
    match dir {
        Direction::Read => QueueFlags::READFULL,
        Direction::Write => QueueFlags::WRITEFULL,
    }
}

// Driver dispatch callback. Runs with the queue lock held and must not block.
pub trait RequestHandler: Send + Sync {
    fn request_fn(&self, q: &mut QueueState);
}

// Replaces the default bio-to-request path, as stacking drivers do. Returning
// a bio resubmits it to the device it now names.
pub trait MakeRequest: Send + Sync {
    fn make_request(&self, queue: &Arc<RequestQueue>, bio: Bio) -> Option<Bio>;
}

// Work produced under the queue lock and run after it is released.
pub(crate) enum QueueEvent {
    EndIo(Bio),
    Complete(Completion),
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

// Everything guarded by the queue lock.
pub struct QueueState {
    id: u64,
    queue: Weak<RequestQueue>,

    flags: QueueFlags,
    limits: QueueLimits,
    plug: PlugConfig,
    batch: BatchConfig,

    nr_requests: usize,
    nr_congestion_on: usize,
    nr_congestion_off: usize,

    pool: RequestPool,
    elevator: Box<dyn Elevator>,
    last_merge: Option<RequestId>,
    tags: Option<TagTable>,

    handler: Option<Arc<dyn RequestHandler>>,
    plug_generation: u64,

    waiters: [usize; 2],
    alloc_wait: Arc<[Condvar; 2]>,
    events: Arc<SegQueue<QueueEvent>>,
    bdi: Arc<BackingDevInfo>,
}

impl QueueState {
    fn rules(&self) -> SegmentRules {
        SegmentRules::new(self.limits, self.flags.contains(QueueFlags::CLUSTER))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn limits_mut(&mut self) -> &mut QueueLimits {
        &mut self.limits
    }

    pub fn set_clustering(&mut self, cluster: bool) {
        self.flags.set(QueueFlags::CLUSTER, cluster);
    }

    pub fn plug_config(&self) -> &PlugConfig {
        &self.plug
    }

    pub fn set_plug_config(&mut self, plug: PlugConfig) {
        self.plug = plug;
    }

    pub fn batch_config(&self) -> &BatchConfig {
        &self.batch
    }

    pub fn set_batch_config(&mut self, batch: BatchConfig) {
        self.batch = batch;
    }

    pub fn elevator(&self) -> &dyn Elevator {
        self.elevator.as_ref()
    }

    pub fn nr_requests(&self) -> usize {
        self.nr_requests
    }

    pub fn congestion_thresholds(&self) -> (usize, usize) {
        (self.nr_congestion_on, self.nr_congestion_off)
    }

    pub fn count(&self, dir: Direction) -> usize {
        self.pool.count(dir)
    }

    pub fn is_full(&self, dir: Direction) -> bool {
        self.flags.contains(full_flag(dir))
    }

    fn set_full(&mut self, dir: Direction, full: bool) {
        self.flags.set(full_flag(dir), full);
    }

    pub fn is_plugged(&self) -> bool {
        self.flags.contains(QueueFlags::PLUGGED)
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.contains(QueueFlags::STOPPED)
    }

    pub fn is_tagged(&self) -> bool {
        self.flags.contains(QueueFlags::QUEUED)
    }

    pub fn last_merge(&self) -> Option<RequestId> {
        self.last_merge
    }

    pub fn queue_empty(&self) -> bool {
        self.elevator.queue_empty()
    }

    pub fn request(&self, id: RequestId) -> &Request {
        &self.pool[id]
    }

    pub fn request_mut(&mut self, id: RequestId) -> &mut Request {
        &mut self.pool[id]
    }

    pub fn try_request(&self, id: RequestId) -> Option<&Request> {
        self.pool.get(id)
    }

    // Ids currently on the dispatch list, in dispatch order.
    pub fn queued_requests(&self) -> Vec<RequestId> {
        let mut ids = Vec::with_capacity(self.elevator.len());
        let mut next = self.elevator.next_request();
        while let Some(id) = next {
            ids.push(id);
            next = self.elevator.latter_request(id);
        }
        ids
    }

    fn run_request_fn(&mut self) {
        if let Some(handler) = self.handler.clone() {
            handler.request_fn(self);
        }
    }

    // ---- request allocation ----

    fn get_request(&mut self, dir: Direction, ioc: &IoContext) -> Option<RequestId> {
        let rw = dir.index();

        if self.pool.count[rw] + 1 >= self.nr_requests && !self.is_full(dir) {
            ioc.set_batching(&self.batch);
            self.set_full(dir, true);
        }

        if self.is_full(dir) && !ioc.is_batching(&self.batch) && !self.elevator.may_queue(dir) {
            trace!("queue {}: {:?} pool full, refusing ioc {}", self.id, dir, ioc.id());
            return None;
        }

        self.pool.count[rw] += 1;
        if self.pool.count[rw] >= self.nr_congestion_on {
            self.bdi.set_congested(dir);
        }

        let id = self.pool.alloc(dir);
        if !self.elevator.set_request(id) {
            self.pool.release(id);
            self.freed_request(dir);
            return None;
        }

        if ioc.is_batching(&self.batch) {
            ioc.consume_batch();
        }
        Some(id)
    }

    // A slot went back to the pool.
    fn freed_request(&mut self, dir: Direction) {
        let rw = dir.index();
        self.pool.count[rw] -= 1;

        if self.pool.count[rw] < self.nr_congestion_off {
            self.bdi.clear_congested(dir);
        }

        if self.pool.count[rw] + 1 <= self.nr_requests {
            if self.waiters[rw] > 0 {
                self.alloc_wait[rw].notify_one();
            } else {
                self.set_full(dir, false);
            }
        }
    }

    // Takes an extra reference, e.g. to inspect a request after it completes.
    pub fn hold_request(&mut self, id: RequestId) {
        self.pool[id].ref_count += 1;
    }

    pub fn put_request(&mut self, id: RequestId) {
        let rq = &mut self.pool[id];
        rq.ref_count -= 1;
        if rq.ref_count > 0 {
            return;
        }

        if rq.queued {
            panic!("request {:?} released while still queued", id);
        }
        if rq.tag.is_some() {
            panic!("request {:?} released while holding tag {:?}", id, rq.tag);
        }

        let dir = rq.dir();
        self.elevator.completed_request(&self.pool, id);
        self.elevator.put_request(id);

        if let Some(rq) = self.pool.release(id) {
            if !rq.bios.is_empty() {
                warn!("queue {}: request {:?} freed with {} bios", self.id, id, rq.bios.len());
                for mut bio in rq.bios {
                    let bytes = bio.size();
                    bio.advance(bytes, Some(BlkError::Io));
                    self.events.push(QueueEvent::EndIo(bio));
                }
            }
        }
        self.freed_request(dir);
    }

    pub fn set_nr_requests(&mut self, nr: usize) {
        self.nr_requests = nr.max(BLKDEV_MIN_RQ);
        self.nr_congestion_on = congestion_on_threshold(self.nr_requests);
        self.nr_congestion_off = congestion_off_threshold(self.nr_requests);

        for dir in [Direction::Read, Direction::Write] {
            let count = self.pool.count(dir);
            if count >= self.nr_congestion_on {
                self.bdi.set_congested(dir);
            } else if count < self.nr_congestion_off {
                self.bdi.clear_congested(dir);
            }

            if count >= self.nr_requests {
                self.set_full(dir, true);
            } else if count + 1 <= self.nr_requests {
                self.set_full(dir, false);
                self.alloc_wait[dir.index()].notify_all();
            }
        }
    }

    // ---- plugging ----

    pub fn plug_device(&mut self) {
        // a stopped queue is restarted explicitly, never by the plug timer
        if self.is_stopped() || self.is_plugged() {
            return;
        }

        self.flags.insert(QueueFlags::PLUGGED);
        plug_list_add(self.id, self.queue.clone());

        self.plug_generation += 1;
        KBLOCKD.schedule(BlockWork::UnplugTimer {
            queue: self.queue.clone(),
            deadline: Instant::now() + self.plug.unplug_delay,
            generation: self.plug_generation,
        });
        trace!("queue {}: plugged", self.id);
    }

    // Returns whether the queue was plugged.
    pub fn remove_plug(&mut self) -> bool {
        if !self.is_plugged() {
            return false;
        }
        self.flags.remove(QueueFlags::PLUGGED);
        plug_list_remove(self.id);
        self.plug_generation += 1;
        true
    }

    pub fn generic_unplug(&mut self) {
        if self.is_stopped() {
            return;
        }
        if !self.remove_plug() {
            return;
        }
        trace!("queue {}: unplugged", self.id);
        if self.elevator.next_request().is_some() {
            self.run_request_fn();
        }
    }

    pub(crate) fn unplug_timeout(&mut self, generation: u64) {
        if generation == self.plug_generation && self.is_plugged() {
            debug!("queue {}: unplug timer fired", self.id);
            self.generic_unplug();
        }
    }

    pub fn stop_queue(&mut self) {
        self.remove_plug();
        self.flags.insert(QueueFlags::STOPPED);
    }

    // The driver is called again from kblockd, not from this context.
    pub fn start_queue(&mut self) {
        self.flags.remove(QueueFlags::STOPPED);
        KBLOCKD.schedule(BlockWork::RunQueue(self.queue.clone()));
    }

    pub fn run_queue(&mut self) {
        if self.is_stopped() {
            return;
        }
        self.remove_plug();
        self.run_request_fn();
    }

    // ---- merging ----

    fn try_merge_bio(&mut self, mut bio: Bio) -> Result<(), Bio> {
        let rules = self.rules();

        match self.elevator.merge(&self.pool, &bio, self.last_merge) {
            ElevatorMerge::Back(id) => {
                let req = &mut self.pool[id];
                debug_assert!(req.is_mergeable());

                if !rules.back_merge_fn(req, &mut bio) {
                    self.last_merge = None;
                    return Err(bio);
                }

                let nr_sectors = bio.sectors();
                req.nr_sectors += nr_sectors;
                req.hard_nr_sectors += nr_sectors;
                req.bios.push_back(bio);
                if let Some(disk) = &req.disk {
                    disk.account_io(req.dir(), nr_sectors, false);
                }
                trace!("queue {}: back merge into {:?}", self.id, id);

                self.last_merge = Some(id);
                if !self.attempt_back_merge(id) {
                    self.elevator.merged_request(&self.pool, id);
                }
                Ok(())
            }

            ElevatorMerge::Front(id) => {
                let req = &mut self.pool[id];
                debug_assert!(req.is_mergeable());

                if !rules.front_merge_fn(req, &mut bio) {
                    self.last_merge = None;
                    return Err(bio);
                }

                let nr_sectors = bio.sectors();
                let cur_sectors = bio.cur_sectors();
                let sector = bio.sector();
                req.bios.push_front(bio);
                req.current_nr_sectors = cur_sectors;
                req.hard_cur_sectors = cur_sectors;
                req.sector = sector;
                req.hard_sector = sector;
                req.nr_sectors += nr_sectors;
                req.hard_nr_sectors += nr_sectors;
                req.reset_cbio();
                if let Some(disk) = &req.disk {
                    disk.account_io(req.dir(), nr_sectors, false);
                }
                trace!("queue {}: front merge into {:?}", self.id, id);

                self.last_merge = Some(id);
                if !self.attempt_front_merge(id) {
                    self.elevator.merged_request(&self.pool, id);
                }
                Ok(())
            }

            ElevatorMerge::NoMerge => Err(bio),
        }
    }

    // Folds `next` into `rid` if they became adjacent and still fit.
    fn attempt_merge(&mut self, rid: RequestId, nid: RequestId) -> bool {
        let rules = self.rules();
        let Some((req, next)) = self.pool.get_pair_mut(rid, nid) else {
            return false;
        };

        if !req.is_mergeable() || !next.is_mergeable() {
            return false;
        }
        if req.end_sector() != next.sector
            || req.dir() != next.dir()
            || !req.same_disk(next)
            || next.has_waiter()
            || next.flags.contains(RequestFlags::SPECIAL)
        {
            return false;
        }
        if !rules.merge_requests_fn(req, next) {
            return false;
        }

        req.bios.extend(next.bios.drain(..));
        req.nr_sectors += next.hard_nr_sectors;
        req.hard_nr_sectors += next.hard_nr_sectors;
        if next.start_time < req.start_time {
            req.start_time = next.start_time;
        }
        if let Some(disk) = &req.disk {
            disk.request_merged();
        }
        next.queued = false;

        self.elevator.merge_requests(&self.pool, rid, nid);
        if self.last_merge == Some(nid) {
            self.last_merge = Some(rid);
        }
        trace!("queue {}: coalesced {:?} into {:?}", self.id, nid, rid);

        self.put_request(nid);
        true
    }

    fn attempt_back_merge(&mut self, id: RequestId) -> bool {
        match self.elevator.latter_request(id) {
            Some(next) => self.attempt_merge(id, next),
            None => false,
        }
    }

    fn attempt_front_merge(&mut self, id: RequestId) -> bool {
        match self.elevator.former_request(id) {
            Some(prev) => self.attempt_merge(prev, id),
            None => false,
        }
    }

    pub fn attempt_remerge(&mut self, id: RequestId) -> bool {
        self.pool[id].is_mergeable() && self.attempt_back_merge(id)
    }

    fn init_request_from_bio(&mut self, id: RequestId, mut bio: Bio) {
        let rules = self.rules();
        let (nr_phys, nr_hw) = rules.bio_segments(&mut bio);
        let req = &mut self.pool[id];

        req.set_dir(bio.dir());
        req.flags.insert(RequestFlags::CMD);
        if bio.is_barrier() {
            req.flags
                .insert(RequestFlags::HARDBARRIER | RequestFlags::NOMERGE);
        }
        if bio.is_readahead() {
            req.flags.insert(RequestFlags::FAILFAST);
        }

        req.errors = 0;
        req.sector = bio.sector();
        req.hard_sector = bio.sector();
        req.nr_sectors = bio.sectors();
        req.hard_nr_sectors = bio.sectors();
        req.current_nr_sectors = bio.cur_sectors();
        req.hard_cur_sectors = bio.cur_sectors();
        req.nr_phys_segments = nr_phys;
        req.nr_hw_segments = nr_hw;
        req.disk = Some(Arc::clone(bio.bdev().stats()));
        req.waiting = None;
        req.start_time = Instant::now();

        req.bios.push_back(bio);
        req.reset_cbio();
    }

    fn add_request(&mut self, id: RequestId, pos: InsertPosition) {
        let req = &mut self.pool[id];
        req.queued = true;
        if let Some(disk) = &req.disk {
            disk.account_io(req.dir(), req.nr_sectors, true);
        }
        self.elevator.add_request(&self.pool, id, pos);
    }

    // Queues a driver-built request. `special` requests are never merged.
    pub fn insert_request(&mut self, id: RequestId, at_head: bool, special: bool, reinsert: bool) {
        if special {
            self.pool[id]
                .flags
                .insert(RequestFlags::SPECIAL | RequestFlags::SOFTBARRIER);
        }

        if reinsert {
            self.requeue_request(id);
        } else {
            if self.pool[id].tag.is_some() {
                self.end_tag(id);
            }
            let pos = if at_head {
                InsertPosition::Front
            } else {
                InsertPosition::Back
            };
            self.add_request(id, pos);
        }

        self.run_queue();
    }

    // ---- driver side ----

    // Head of the dispatch list, marked started. It stays queued until dequeued.
    pub fn elv_next_request(&mut self) -> Option<RequestId> {
        let id = self.elevator.next_request()?;
        self.pool[id].flags.insert(RequestFlags::STARTED);
        Some(id)
    }

    pub fn dequeue_request(&mut self, id: RequestId) {
        self.elevator.remove_request(id);
        self.pool[id].queued = false;
        if self.last_merge == Some(id) {
            self.last_merge = None;
        }
    }

    pub fn requeue_request(&mut self, id: RequestId) {
        if self.pool[id].queued {
            self.dequeue_request(id);
        }
        if self.pool[id].tag.is_some() {
            self.end_tag(id);
        }

        let req = &mut self.pool[id];
        req.flags.remove(RequestFlags::STARTED);
        req.queued = true;
        self.elevator.requeue_request(&self.pool, id);
    }

    pub fn map_sg(&self, id: RequestId) -> Vec<ScatterEntry> {
        self.rules().map_sg(&self.pool[id])
    }

    pub fn recount_segments(&self, bio: &Bio) -> (u16, u16) {
        self.rules().recount_segments(bio)
    }

    pub fn recalc_rq_segments(&mut self, id: RequestId) {
        let rules = self.rules();
        rules.recalc_rq_segments(&mut self.pool[id]);
    }

    // Retires `nsect` completed sectors from the hard counters and pulls the
    // driver's view forward if it lags behind.
    pub fn recalc_rq_sectors(&mut self, id: RequestId, nsect: u32) {
        let req = &mut self.pool[id];
        if !req.is_fs_request() {
            return;
        }

        req.hard_sector += nsect as u64;
        req.hard_nr_sectors = req.hard_nr_sectors.saturating_sub(nsect);

        if req.nr_sectors >= req.hard_nr_sectors && req.sector <= req.hard_sector {
            req.sector = req.hard_sector;
            req.nr_sectors = req.hard_nr_sectors;
            req.hard_cur_sectors = req.bios.front().map_or(0, |b| b.cur_sectors());
            req.current_nr_sectors = req.hard_cur_sectors;
            req.reset_cbio();
        }

        if req.nr_sectors < req.current_nr_sectors {
            error!("queue {}: request {:?} botched", self.id, id);
            req.nr_sectors = req.current_nr_sectors;
        }
    }

    // Moves the submission cursor to the next segment. False at chain end.
    pub fn rq_next_segment(&mut self, id: RequestId) -> bool {
        let req = &mut self.pool[id];

        req.cbio_seg += 1;
        loop {
            let Some(bio) = req.bios.get(req.cbio) else {
                return false;
            };
            if req.cbio_seg < bio.segments().len() {
                let seg = &bio.segments()[req.cbio_seg];
                req.current_nr_sectors = (seg.len >> SECTOR_SHIFT) as u32;
                req.nr_cbio_segments = bio.segments().len() - req.cbio_seg;
                return true;
            }
            req.cbio += 1;
            req.cbio_seg = 0;
            if let Some(next) = req.bios.get(req.cbio) {
                req.nr_cbio_sectors = next.sectors();
            }
        }
    }

    // Advances the driver view by `nr_sectors` of submitted (not completed) I/O.
    // Returns true while sectors remain to be submitted.
    pub fn process_that_request_first(&mut self, id: RequestId, nr_sectors: u32) -> bool {
        let mut nr_sectors = {
            let req = &mut self.pool[id];
            if !req.is_fs_request() || nr_sectors == 0 {
                return req.nr_sectors > 0;
            }
            if req.nr_sectors < nr_sectors {
                error!("queue {}: request {:?} botched", self.id, id);
                req.nr_sectors
            } else {
                nr_sectors
            }
        };

        while nr_sectors > 0 {
            let req = &mut self.pool[id];
            let nsect = req.current_nr_sectors.min(nr_sectors);
            req.current_nr_sectors -= nsect;
            req.nr_sectors -= nsect;
            req.sector += nsect as u64;
            req.nr_cbio_sectors = req.nr_cbio_sectors.saturating_sub(nsect);
            nr_sectors -= nsect;

            if req.current_nr_sectors == 0 && !self.rq_next_segment(id) {
                return false;
            }
        }
        self.pool[id].nr_sectors > 0
    }

    // Rewinds the driver view to the unfinished part of the request.
    pub fn rq_prep_restart(&mut self, id: RequestId) {
        let req = &mut self.pool[id];
        req.sector = req.hard_sector;
        req.nr_sectors = req.hard_nr_sectors;
        req.current_nr_sectors = req.hard_cur_sectors;
        req.reset_cbio();
    }

    // ---- completion ----

    pub fn end_that_request_first(&mut self, id: RequestId, uptodate: bool, nr_sectors: u32) -> bool {
        self.end_that_request_chunk(id, uptodate, (nr_sectors as usize) << SECTOR_SHIFT)
    }

    // Completes `nr_bytes` from the head of the request. Returns true while
    // bios remain.
    pub fn end_that_request_chunk(&mut self, id: RequestId, uptodate: bool, nr_bytes: usize) -> bool {
        let queue_id = self.id;
        let req = &mut self.pool[id];

        let error = if uptodate {
            None
        } else {
            if !req.flags.contains(RequestFlags::QUIET) {
                error!(
                    "end_request: I/O error, queue {}, sector {}",
                    queue_id, req.hard_sector
                );
            }
            req.flags.insert(RequestFlags::FAILED);
            Some(BlkError::Io)
        };

        let mut nr_bytes = nr_bytes;
        let mut total_bytes = 0usize;
        let mut bio_nbytes = 0usize;
        let mut next_idx = 0usize;

        while let Some(bio) = req.bios.front_mut() {
            let nbytes;

            if nr_bytes >= bio.size() {
                nbytes = bio.size();
                if let Some(mut done) = req.bios.pop_front() {
                    done.advance(nbytes, error);
                    self.events.push(QueueEvent::EndIo(done));
                }
                next_idx = 0;
                bio_nbytes = 0;
            } else {
                let segments = bio.segments();
                let Some(seg) = segments.get(next_idx) else {
                    error!("end_that_request_chunk: bio idx {} >= segments", next_idx);
                    break;
                };

                let seg_len = seg.len;
                if seg_len > nr_bytes {
                    // partial segment: trim it in place
                    bio.trim_segment(next_idx, nr_bytes);
                    bio_nbytes += nr_bytes;
                    total_bytes += nr_bytes;
                    break;
                }

                nbytes = seg_len;
                next_idx += 1;
                bio_nbytes += nbytes;
            }

            total_bytes += nbytes;
            nr_bytes -= nbytes;

            if nr_bytes == 0 {
                break;
            }
        }

        if req.bios.is_empty() {
            return false;
        }

        if bio_nbytes > 0 {
            if let Some(bio) = req.bios.front_mut() {
                bio.advance(bio_nbytes, error);
                bio.skip_segments(next_idx);
            }
        }

        self.recalc_rq_sectors(id, (total_bytes >> SECTOR_SHIFT) as u32);
        self.recalc_rq_segments(id);
        true
    }

    // Finishes a fully completed, dequeued request.
    pub fn end_that_request_last(&mut self, id: RequestId) {
        let req = &mut self.pool[id];
        if let Some(disk) = &req.disk {
            disk.account_completion(req.dir(), req.start_time.elapsed());
        }

        // signal only once the request is off every list
        let waiting = req.waiting.take();
        self.put_request(id);
        if let Some(done) = waiting {
            self.events.push(QueueEvent::Complete(done));
        }
    }

    // Completes the current segment; finishes the request when nothing remains.
    pub fn end_request(&mut self, id: RequestId, uptodate: bool) {
        let cur = self.pool[id].hard_cur_sectors;
        if !self.end_that_request_first(id, uptodate, cur) {
            self.dequeue_request(id);
            if self.pool[id].tag.is_some() {
                self.end_tag(id);
            }
            self.end_that_request_last(id);
        }
    }

    // ---- tagged queueing ----

    pub fn init_tags(&mut self, depth: usize) {
        self.tags = Some(TagTable::new(depth, self.nr_requests));
        self.flags.insert(QueueFlags::QUEUED);
    }

    pub fn free_tags(&mut self) {
        if let Some(tags) = &self.tags {
            if tags.busy() > 0 {
                warn!("queue {}: freeing tag table with {} busy tags", self.id, tags.busy());
            }
        }
        self.tags = None;
        self.flags.remove(QueueFlags::QUEUED);
    }

    pub fn resize_tags(&mut self, depth: usize) -> BlkResult<bool> {
        let tags = self.tags.as_mut().ok_or(BlkError::NoDevice)?;
        Ok(tags.resize(depth))
    }

    pub fn tags(&self) -> Option<&TagTable> {
        self.tags.as_ref()
    }

    pub fn find_tag(&self, tag: usize) -> Option<RequestId> {
        self.tags.as_ref()?.find(tag)
    }

    // Binds a free tag to `id` and takes it off the dispatch list. None if the
    // table is exhausted.
    pub fn start_tag(&mut self, id: RequestId) -> Option<usize> {
        if self.pool[id].flags.contains(RequestFlags::QUEUED) {
            panic!(
                "start_tag: request {:?} already tagged ({:?})",
                id, self.pool[id].tag
            );
        }
        let Some(tags) = self.tags.as_mut() else {
            error!("start_tag: queue {} has no tag table", self.id);
            return None;
        };
        let tag = tags.start(id)?;

        let req = &mut self.pool[id];
        req.flags.insert(RequestFlags::QUEUED);
        req.tag = Some(tag);
        self.dequeue_request(id);
        Some(tag)
    }

    pub fn end_tag(&mut self, id: RequestId) {
        let req = &mut self.pool[id];
        let Some(tag) = req.tag.take() else {
            panic!("end_tag: request {:?} has no tag", id);
        };
        req.flags.remove(RequestFlags::QUEUED);

        if let Some(tags) = self.tags.as_mut() {
            tags.end(tag, id);
        }
    }

    // After a device reset: every tagged request goes back on the dispatch list.
    pub fn invalidate_tags(&mut self) {
        let busy: Vec<RequestId> = match &self.tags {
            Some(tags) => tags.busy_list().to_vec(),
            None => return,
        };

        for id in busy {
            if self.pool[id].tag.is_some() {
                self.end_tag(id);
            } else {
                error!("invalidate_tags: bad tag found on list");
                self.pool[id].flags.remove(RequestFlags::QUEUED);
            }

            let req = &mut self.pool[id];
            req.flags.remove(RequestFlags::STARTED);
            req.queued = true;
            self.elevator.add_request(&self.pool, id, InsertPosition::Back);
        }
    }
}

// A device's request queue.
pub struct RequestQueue {
    id: u64,
    state: Mutex<QueueState>,
    alloc_wait: Arc<[Condvar; 2]>,
    events: Arc<SegQueue<QueueEvent>>,
    bdi: Arc<BackingDevInfo>,
    make_request_fn: RwLock<Option<Arc<dyn MakeRequest>>>,
    refcnt: AtomicUsize,
}

impl RequestQueue {
    fn build(
        handler: Option<Arc<dyn RequestHandler>>,
        config: QueueConfig,
        elevator: Box<dyn Elevator>,
    ) -> Arc<RequestQueue> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let alloc_wait = Arc::new([Condvar::new(), Condvar::new()]);
        let events = Arc::new(SegQueue::new());
        let bdi = Arc::new(BackingDevInfo::new());

        Arc::new_cyclic(|queue| {
            let mut flags = QueueFlags::empty();
            flags.set(QueueFlags::CLUSTER, config.cluster);

            let mut state = QueueState {
                id,
                queue: queue.clone(),

                flags,
                limits: config.limits,
                plug: config.plug,
                batch: config.batch,

                nr_requests: 0,
                nr_congestion_on: 0,
                nr_congestion_off: 0,

                pool: RequestPool::new(),
                elevator,
                last_merge: None,
                tags: None,

                handler,
                plug_generation: 0,

                waiters: [0, 0],
                alloc_wait: Arc::clone(&alloc_wait),
                events: Arc::clone(&events),
                bdi: Arc::clone(&bdi),
            };
            state.set_nr_requests(config.nr_requests);

            RequestQueue {
                id,
                state: Mutex::new(state),
                alloc_wait,
                events,
                bdi,
                make_request_fn: RwLock::new(None),
                refcnt: AtomicUsize::new(1),
            }
        })
    }

    // Queue fed through the default make-request path into `handler`.
    pub fn init(handler: Arc<dyn RequestHandler>, config: QueueConfig) -> Arc<RequestQueue> {
        Self::build(Some(handler), config, Box::new(SortElevator::new()))
    }

    pub fn init_with_elevator(
        handler: Arc<dyn RequestHandler>,
        config: QueueConfig,
        elevator: Box<dyn Elevator>,
    ) -> Arc<RequestQueue> {
        Self::build(Some(handler), config, elevator)
    }

    // Queue without a driver callback; pair with `set_make_request`.
    pub fn alloc(config: QueueConfig) -> Arc<RequestQueue> {
        Self::build(None, config, Box::new(SortElevator::new()))
    }

    pub fn set_make_request(&self, make_request: Arc<dyn MakeRequest>) {
        *self.make_request_fn.write().unwrap() = Some(make_request);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bdi(&self) -> &Arc<BackingDevInfo> {
        &self.bdi
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    // Runs `f` under the queue lock, then the completions it produced.
    pub fn with_state<R, F: FnOnce(&mut QueueState) -> R>(&self, f: F) -> R {
        let ret = {
            let mut state = self.lock_state();
            f(&mut state)
        };
        self.drain_events();
        ret
    }

    fn drain_events(&self) {
        while let Some(event) = self.events.pop() {
            match event {
                QueueEvent::EndIo(bio) => bio.complete(),
                QueueEvent::Complete(done) => done.complete(),
            }
        }
    }

    pub fn limits(&self) -> QueueLimits {
        self.lock_state().limits
    }

    pub fn is_dead(&self) -> bool {
        self.lock_state().flags.contains(QueueFlags::DEAD)
    }

    pub fn get_queue(&self) -> BlkResult<()> {
        let state = self.lock_state();
        if state.flags.contains(QueueFlags::DEAD) {
            return Err(BlkError::DeadQueue);
        }
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    // Drops a reference. The last one marks the queue dead and tears down
    // plugging and tags.
    pub fn cleanup_queue(&self) {
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.with_state(|state| {
            state.flags.insert(QueueFlags::DEAD);
            state.remove_plug();
            if state.tags.is_some() {
                state.free_tags();
            }
            debug!("queue {}: released", state.id);
        });
    }

    // Entry from `generic_make_request`.
    pub(crate) fn submit(self: &Arc<Self>, bio: Bio) -> Option<Bio> {
        let custom = self.make_request_fn.read().unwrap().clone();
        match custom {
            Some(f) => f.make_request(self, bio),
            None => {
                self.make_request(bio);
                None
            }
        }
    }

    // Default make-request path: merge into a queued request or allocate one.
    pub fn make_request(&self, bio: Bio) {
        let bounce_pfn = self.lock_state().limits.bounce_pfn;
        let mut bio = blk_queue_bounce(bounce_pfn, bio);

        let dir = bio.dir();
        let barrier = bio.is_barrier();
        let readahead = bio.is_readahead();
        let ioc = get_io_context();

        let mut freereq: Option<RequestId> = None;
        let mut state = self.lock_state();

        loop {
            if state.elevator.queue_empty() {
                state.plug_device();
            } else if !barrier {
                match state.try_merge_bio(bio) {
                    Ok(()) => break,
                    Err(unmerged) => bio = unmerged,
                }
            }

            if let Some(id) = freereq.take() {
                state.init_request_from_bio(id, bio);
                state.add_request(id, InsertPosition::Sort);
                break;
            }

            match state.get_request(dir, &ioc) {
                Some(id) => freereq = Some(id),
                None if readahead => {
                    drop(state);
                    self.drain_events();
                    bio.endio(BlkError::WouldBlock);
                    return;
                }
                None => {
                    let (relocked, id) = self.get_request_wait(state, dir, &ioc);
                    state = relocked;
                    freereq = Some(id);
                }
            }
        }

        if let Some(id) = freereq {
            state.put_request(id);
        }

        if state.is_plugged() {
            let nr_queued = state.pool.count[0] + state.pool.count[1];
            if nr_queued == state.plug.unplug_thresh {
                state.generic_unplug();
            }
        }

        drop(state);
        self.drain_events();
    }

    fn get_request_wait<'a>(
        &'a self,
        mut state: MutexGuard<'a, QueueState>,
        dir: Direction,
        ioc: &IoContext,
    ) -> (MutexGuard<'a, QueueState>, RequestId) {
        let rw = dir.index();
        state.generic_unplug();

        loop {
            if let Some(id) = state.get_request(dir, ioc) {
                return (state, id);
            }

            state.waiters[rw] += 1;
            if self.events.is_empty() {
                state = self.alloc_wait[rw].wait(state).unwrap();
            } else {
                // completions may be what frees a request
                drop(state);
                self.drain_events();
                state = self.lock_state();
            }
            state.waiters[rw] -= 1;

            ioc.set_batching(&state.batch);
        }
    }

    // Allocates a request for a driver-built command.
    pub fn get_request(&self, dir: Direction, may_block: bool) -> Option<RequestId> {
        let ioc = get_io_context();
        let mut state = self.lock_state();

        let id = match state.get_request(dir, &ioc) {
            Some(id) => Some(id),
            None if may_block => {
                let (relocked, id) = self.get_request_wait(state, dir, &ioc);
                state = relocked;
                Some(id)
            }
            None => None,
        };
        drop(state);
        self.drain_events();
        id
    }

    pub fn put_request(&self, id: RequestId) {
        self.with_state(|state| state.put_request(id));
    }

    pub fn insert_request(&self, id: RequestId, at_head: bool, special: bool) {
        self.with_state(|state| state.insert_request(id, at_head, special, false));
    }

    pub fn unplug(&self) {
        self.with_state(|state| state.generic_unplug());
    }

    pub fn run_queue(&self) {
        self.with_state(|state| state.run_queue());
    }

    pub(crate) fn unplug_timeout(&self, generation: u64) {
        self.with_state(|state| state.unplug_timeout(generation));
    }

    pub fn stop_queue(&self) {
        self.with_state(|state| state.stop_queue());
    }

    pub fn start_queue(&self) {
        self.with_state(|state| state.start_queue());
    }

    pub fn set_nr_requests(&self, nr: usize) {
        self.with_state(|state| state.set_nr_requests(nr));
    }

    pub fn attempt_remerge(&self, id: RequestId) -> bool {
        self.with_state(|state| state.attempt_remerge(id))
    }

    pub fn is_congested(&self, dir: Direction) -> bool {
        self.bdi.is_congested(dir)
    }
}
