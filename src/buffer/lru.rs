use std::sync::Arc;

use lazy_static::lazy_static;

use crate::{config::buffer_constants::BH_LRU_SIZE, utils::percpu::PerCpu};

use super::buffer_head::BufferHead;

// Small most-recently-used array in front of the page-cache lookup. Every
// entry holds a buffer reference of its own.
#[derive(Default)]
pub struct BhLru {
    bhs: [Option<Arc<BufferHead>>; BH_LRU_SIZE],
}

impl BhLru {
    pub fn new() -> Self {
        Self::default()
    }

    // Puts `bh` in slot 0. Returns the entry pushed off the end, whose reference
    // the caller must drop once the cache lock is released.
    pub fn install(&mut self, bh: &Arc<BufferHead>) -> Option<Arc<BufferHead>> {
        if self.bhs[0].as_ref().map_or(false, |head| Arc::ptr_eq(head, bh)) {
            return None;
        }

        let mut bhs: [Option<Arc<BufferHead>>; BH_LRU_SIZE] = Default::default();
        let mut out = 0;
        let mut evictee = None;

        bh.get();
        bhs[out] = Some(Arc::clone(bh));
        out += 1;

        for slot in self.bhs.iter_mut() {
            let Some(old) = slot.take() else {
                continue;
            };
            if Arc::ptr_eq(&old, bh) {
                // already counted above
                old.put();
            } else if out >= BH_LRU_SIZE {
                evictee = Some(old);
            } else {
                bhs[out] = Some(old);
                out += 1;
            }
        }

        self.bhs = bhs;
        evictee
    }

    // On a hit the entry moves to slot 0 and a new reference is taken.
    pub fn lookup(&mut self, dev: u32, block: u64, size: u32) -> Option<Arc<BufferHead>> {
        let pos = self.bhs.iter().position(|slot| {
            slot.as_ref().map_or(false, |bh| {
                bh.dev() == dev && bh.blocknr() == block && bh.size() == size
            })
        })?;

        self.bhs[..=pos].rotate_right(1);
        let bh = self.bhs[0].as_ref()?;
        bh.get();
        Some(Arc::clone(bh))
    }

    // Empties the array, handing back the references it held.
    pub fn invalidate(&mut self) -> Vec<Arc<BufferHead>> {
        self.bhs.iter_mut().filter_map(|slot| slot.take()).collect()
    }

    pub fn len(&self) -> usize {
        self.bhs.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, bh: &Arc<BufferHead>) -> bool {
        self.bhs
            .iter()
            .flatten()
            .any(|cached| Arc::ptr_eq(cached, bh))
    }

    pub fn position(&self, bh: &Arc<BufferHead>) -> Option<usize> {
        self.bhs
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |cached| Arc::ptr_eq(cached, bh)))
    }
}

lazy_static! {
    static ref BH_LRUS: PerCpu<BhLru> = PerCpu::new(BhLru::new);
}

pub fn bh_lru_install(bh: &Arc<BufferHead>) {
    let evictee = BH_LRUS.with_this_cpu(|lru| lru.install(bh));
    if let Some(evictee) = evictee {
        evictee.put();
    }
}

pub fn lookup_bh_lru(dev: u32, block: u64, size: u32) -> Option<Arc<BufferHead>> {
    BH_LRUS.with_this_cpu(|lru| lru.lookup(dev, block, size))
}

// Drops the references every cpu's array holds so their buffers can be freed.
pub fn invalidate_bh_lrus() {
    let mut released = Vec::new();
    BH_LRUS.for_each(|lru| released.extend(lru.invalidate()));
    for bh in released {
        bh.put();
    }
}
