use std::{collections::VecDeque, sync::Arc};

use super::{
    bio::{Bio, Direction},
    request::{RequestFlags, RequestId, RequestPool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevatorMerge {
    Back(RequestId),
    Front(RequestId),
    NoMerge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Front,
    Back,
    Sort,
}

// Ordering policy for queued requests. The queue calls every method with its
// lock held; `pool` resolves request ids.
pub trait Elevator: Send {
    fn name(&self) -> &'static str;

    fn merge(&mut self, pool: &RequestPool, bio: &Bio, hint: Option<RequestId>) -> ElevatorMerge;

    fn merged_request(&mut self, _pool: &RequestPool, _rq: RequestId) {}

    // `next` was folded into `rq` and must leave the list.
    fn merge_requests(&mut self, pool: &RequestPool, rq: RequestId, next: RequestId);

    fn add_request(&mut self, pool: &RequestPool, rq: RequestId, pos: InsertPosition);

    fn requeue_request(&mut self, pool: &RequestPool, rq: RequestId) {
        self.add_request(pool, rq, InsertPosition::Front);
    }

    fn next_request(&self) -> Option<RequestId>;

    fn remove_request(&mut self, rq: RequestId);

    fn former_request(&self, rq: RequestId) -> Option<RequestId>;

    fn latter_request(&self, rq: RequestId) -> Option<RequestId>;

    fn queue_empty(&self) -> bool;

    fn len(&self) -> usize;

    fn completed_request(&mut self, _pool: &RequestPool, _rq: RequestId) {}

    // Lets an allocator past a full request pool.
    fn may_queue(&self, _dir: Direction) -> bool {
        false
    }

    fn set_request(&mut self, _rq: RequestId) -> bool {
        true
    }

    fn put_request(&mut self, _rq: RequestId) {}
}

// Whether `bio` may join `rq`, and at which end.
pub fn try_merge(pool: &RequestPool, rq: RequestId, bio: &Bio) -> ElevatorMerge {
    let Some(req) = pool.get(rq) else {
        return ElevatorMerge::NoMerge;
    };

    if !req.is_mergeable()
        || req.dir() != bio.dir()
        || req.has_waiter()
        || req.flags.contains(RequestFlags::SPECIAL)
    {
        return ElevatorMerge::NoMerge;
    }
    let same_disk = req
        .disk
        .as_ref()
        .map_or(false, |disk| Arc::ptr_eq(disk, bio.bdev().stats()));
    if !same_disk {
        return ElevatorMerge::NoMerge;
    }

    if req.end_sector() == bio.sector() {
        ElevatorMerge::Back(rq)
    } else if req.sector == bio.end_sector() {
        ElevatorMerge::Front(rq)
    } else {
        ElevatorMerge::NoMerge
    }
}

// Keeps requests in ascending sector order behind a boundary. Barriers and
// front insertions advance the boundary so nothing is sorted ahead of them.
#[derive(Debug, Default)]
pub struct SortElevator {
    queue: VecDeque<RequestId>,
    boundary: usize,
}

impl SortElevator {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, rq: RequestId) -> Option<usize> {
        self.queue.iter().position(|&id| id == rq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestId> {
        self.queue.iter()
    }
}

impl Elevator for SortElevator {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn merge(&mut self, pool: &RequestPool, bio: &Bio, hint: Option<RequestId>) -> ElevatorMerge {
        if let Some(hint) = hint.filter(|&h| self.position(h).is_some()) {
            let ret = try_merge(pool, hint, bio);
            if ret != ElevatorMerge::NoMerge {
                return ret;
            }
        }

        for &id in self.queue.iter().rev() {
            let Some(req) = pool.get(id) else {
                continue;
            };
            if req.is_barrier() || req.is_started() {
                break;
            }
            let ret = try_merge(pool, id, bio);
            if ret != ElevatorMerge::NoMerge {
                return ret;
            }
        }

        ElevatorMerge::NoMerge
    }

    fn merge_requests(&mut self, _pool: &RequestPool, _rq: RequestId, next: RequestId) {
        self.remove_request(next);
    }

    fn add_request(&mut self, pool: &RequestPool, rq: RequestId, pos: InsertPosition) {
        match pos {
            InsertPosition::Front => {
                self.queue.push_front(rq);
                self.boundary += 1;
            }
            InsertPosition::Back => {
                self.queue.push_back(rq);
            }
            InsertPosition::Sort => {
                let req = &pool[rq];
                if req.is_barrier() {
                    self.queue.push_back(rq);
                    self.boundary = self.queue.len();
                    return;
                }

                let mut at = self.queue.len();
                while at > self.boundary {
                    let prev = &pool[self.queue[at - 1]];
                    if prev.is_started() || prev.is_barrier() || prev.sector <= req.sector {
                        break;
                    }
                    at -= 1;
                }
                self.queue.insert(at, rq);
            }
        }
    }

    fn next_request(&self) -> Option<RequestId> {
        self.queue.front().copied()
    }

    fn remove_request(&mut self, rq: RequestId) {
        if let Some(pos) = self.position(rq) {
            self.queue.remove(pos);
            if pos < self.boundary {
                self.boundary -= 1;
            }
        }
    }

    fn former_request(&self, rq: RequestId) -> Option<RequestId> {
        let pos = self.position(rq)?;
        pos.checked_sub(1).and_then(|p| self.queue.get(p).copied())
    }

    fn latter_request(&self, rq: RequestId) -> Option<RequestId> {
        let pos = self.position(rq)?;
        self.queue.get(pos + 1).copied()
    }

    fn queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}
