use std::{collections::VecDeque, sync::Arc, time::Instant};

use bitflags::bitflags;

use crate::utils::completion::Completion;

use super::{
    bio::{Bio, Direction},
    device::DiskStats,
};

bitflags! {
    pub struct RequestFlags: u32 {
        const WRITE = 1 << 0;
        // Do not retry on failure.
        const FAILFAST = 1 << 1;
        const SOFTBARRIER = 1 << 2;
        const HARDBARRIER = 1 << 3;
        // Filesystem request built from bios.
        const CMD = 1 << 4;
        const NOMERGE = 1 << 5;
        const STARTED = 1 << 6;
        const DONTPREP = 1 << 7;
        // Holds a tag.
        const QUEUED = 1 << 8;
        const SPECIAL = 1 << 9;
        const FAILED = 1 << 10;
        const QUIET = 1 << 11;
    }
}

const NOMERGE_FLAGS: RequestFlags = RequestFlags::from_bits_truncate(
    RequestFlags::NOMERGE.bits()
        | RequestFlags::STARTED.bits()
        | RequestFlags::HARDBARRIER.bits()
        | RequestFlags::SOFTBARRIER.bits(),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) usize);

impl RequestId {
    pub fn slot(self) -> usize {
        self.0
    }
}

// A unit of work handed to the driver: one or more bios covering a contiguous
// sector range in one direction.
//
// `sector`/`nr_sectors`/`current_nr_sectors` are the driver's view and may be
// advanced by it; the `hard_*` copies are owned by the completion path.
pub struct Request {
    id: RequestId,
    pub flags: RequestFlags,
    dir: Direction,

    pub sector: u64,
    pub nr_sectors: u32,
    pub current_nr_sectors: u32,
    pub hard_sector: u64,
    pub hard_nr_sectors: u32,
    pub hard_cur_sectors: u32,

    pub(crate) bios: VecDeque<Bio>,

    // Driver submission cursor: bio index and segment within it.
    pub(crate) cbio: usize,
    pub(crate) cbio_seg: usize,
    pub(crate) nr_cbio_segments: usize,
    pub(crate) nr_cbio_sectors: u32,

    pub nr_phys_segments: u16,
    pub nr_hw_segments: u16,

    pub(crate) ref_count: u32,
    pub(crate) tag: Option<usize>,
    pub errors: u32,

    pub(crate) waiting: Option<Completion>,
    pub(crate) disk: Option<Arc<DiskStats>>,
    pub(crate) start_time: Instant,

    // Linked into the elevator's dispatch list.
    pub(crate) queued: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("bios", &self.bios.len())
            .field("tag", &self.tag)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(id: RequestId, dir: Direction) -> Self {
        Self {
            id,
            flags: RequestFlags::empty(),
            dir,

            sector: 0,
            nr_sectors: 0,
            current_nr_sectors: 0,
            hard_sector: 0,
            hard_nr_sectors: 0,
            hard_cur_sectors: 0,

            bios: VecDeque::new(),

            cbio: 0,
            cbio_seg: 0,
            nr_cbio_segments: 0,
            nr_cbio_sectors: 0,

            nr_phys_segments: 0,
            nr_hw_segments: 0,

            ref_count: 1,
            tag: None,
            errors: 0,

            waiting: None,
            disk: None,
            start_time: Instant::now(),

            queued: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub(crate) fn set_dir(&mut self, dir: Direction) {
        self.dir = dir;
        self.flags.set(RequestFlags::WRITE, dir == Direction::Write);
    }

    pub fn tag(&self) -> Option<usize> {
        self.tag
    }

    pub fn bios(&self) -> impl Iterator<Item = &Bio> {
        self.bios.iter()
    }

    pub fn bio(&self, index: usize) -> Option<&Bio> {
        self.bios.get(index)
    }

    // Bio and segment the driver should transfer next.
    pub fn cursor(&self) -> (usize, usize) {
        (self.cbio, self.cbio_seg)
    }

    pub fn nr_bios(&self) -> usize {
        self.bios.len()
    }

    pub fn end_sector(&self) -> u64 {
        self.sector + self.nr_sectors as u64
    }

    pub fn is_fs_request(&self) -> bool {
        self.flags.contains(RequestFlags::CMD)
    }

    pub fn is_barrier(&self) -> bool {
        self.flags
            .intersects(RequestFlags::HARDBARRIER | RequestFlags::SOFTBARRIER)
    }

    pub fn is_mergeable(&self) -> bool {
        !self.flags.intersects(NOMERGE_FLAGS) && self.is_fs_request()
    }

    pub fn is_started(&self) -> bool {
        self.flags.contains(RequestFlags::STARTED)
    }

    pub fn set_completion(&mut self, done: Completion) {
        self.waiting = Some(done);
    }

    pub fn has_waiter(&self) -> bool {
        self.waiting.is_some()
    }

    pub(crate) fn same_disk(&self, other: &Request) -> bool {
        match (&self.disk, &other.disk) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    // Resets the current-bio cursor to the head of the chain.
    pub(crate) fn reset_cbio(&mut self) {
        self.cbio = 0;
        self.cbio_seg = 0;
        if let Some(bio) = self.bios.front() {
            self.nr_cbio_segments = bio.segments().len();
            self.nr_cbio_sectors = bio.sectors();
        } else {
            self.nr_cbio_segments = 0;
            self.nr_cbio_sectors = 0;
        }
    }
}

// Fixed arena of request slots; a slot's id is stable for its lifetime.
pub struct RequestPool {
    slots: Vec<Option<Request>>,
    free: VecDeque<usize>,

    // Outstanding requests per direction.
    pub(crate) count: [usize; 2],
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            count: [0, 0],
        }
    }

    pub(crate) fn alloc(&mut self, dir: Direction) -> RequestId {
        let slot = match self.free.pop_front() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = RequestId(slot);
        let mut rq = Request::new(id, dir);
        rq.set_dir(dir);
        self.slots[slot] = Some(rq);
        id
    }

    pub(crate) fn release(&mut self, id: RequestId) -> Option<Request> {
        let rq = self.slots.get_mut(id.0)?.take()?;
        self.free.push_back(id.0);
        Some(rq)
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    // Two distinct live requests at once.
    pub(crate) fn get_pair_mut(&mut self, a: RequestId, b: RequestId) -> Option<(&mut Request, &mut Request)> {
        if a == b {
            return None;
        }
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (left, right) = self.slots.split_at_mut(hi);
        let lo_rq = left[lo].as_mut()?;
        let hi_rq = right[0].as_mut()?;
        if a.0 < b.0 {
            Some((lo_rq, hi_rq))
        } else {
            Some((hi_rq, lo_rq))
        }
    }

    pub fn count(&self, dir: Direction) -> usize {
        self.count[dir.index()]
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl std::ops::Index<RequestId> for RequestPool {
    type Output = Request;

    fn index(&self, id: RequestId) -> &Request {
        match self.get(id) {
            Some(rq) => rq,
            None => panic!("use of freed request {:?}", id),
        }
    }
}

impl std::ops::IndexMut<RequestId> for RequestPool {
    fn index_mut(&mut self, id: RequestId) -> &mut Request {
        match self.get_mut(id) {
            Some(rq) => rq,
            None => panic!("use of freed request {:?}", id),
        }
    }
}
