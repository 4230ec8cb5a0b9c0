use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, RwLock, Weak,
};

use bitflags::bitflags;

use crate::{
    buffer::buffer_head::BufferHead,
    config::{buffer_constants::*, memory_constants::HIGHMEM_START_PFN},
    storage::disk::scheduler::run_queues,
    utils::wait::WaitQueue,
};

use super::mapping::AddressSpace;

bitflags! {
    pub struct PageFlags: u32 {
        const LOCKED = 1 << 0;
        const ERROR = 1 << 1;
        const UPTODATE = 1 << 2;
        const DIRTY = 1 << 3;
        const WRITEBACK = 1 << 4;
        // Buffers are attached.
        const PRIVATE = 1 << 5;
        const MAPPED_TO_DISK = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Normal,
    High,
}

static NEXT_LOW_PFN: AtomicU64 = AtomicU64::new(1);
static NEXT_HIGH_PFN: AtomicU64 = AtomicU64::new(HIGHMEM_START_PFN);

// A page frame. The frame number stands in for a physical address when
// segments are checked for contiguity.
pub struct Page {
    pfn: u64,
    index: u64,
    flags: AtomicU32,
    data: RwLock<Box<[u8]>>,
    mapping: RwLock<Weak<AddressSpace>>,

    // Buffer ring in ascending offset order. The first entry is the ring head.
    buffers: Mutex<Option<Vec<Arc<BufferHead>>>>,

    wait: WaitQueue,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("pfn", &self.pfn)
            .field("index", &self.index)
            .field("flags", &self.flags())
            .finish()
    }
}

impl Page {
    fn with_pfn(pfn: u64, index: u64, mapping: Weak<AddressSpace>) -> Arc<Page> {
        Arc::new(Page {
            pfn,
            index,
            flags: AtomicU32::new(0),
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            mapping: RwLock::new(mapping),
            buffers: Mutex::new(None),
            wait: WaitQueue::new(),
        })
    }

    pub fn alloc(zone: Zone) -> Arc<Page> {
        let pfn = match zone {
            Zone::Normal => NEXT_LOW_PFN.fetch_add(1, Ordering::Relaxed),
            Zone::High => NEXT_HIGH_PFN.fetch_add(1, Ordering::Relaxed),
        };
        Self::with_pfn(pfn, 0, Weak::new())
    }

    // `n` frames with consecutive frame numbers.
    pub fn alloc_contig(zone: Zone, n: usize) -> Vec<Arc<Page>> {
        let base = match zone {
            Zone::Normal => NEXT_LOW_PFN.fetch_add(n as u64, Ordering::Relaxed),
            Zone::High => NEXT_HIGH_PFN.fetch_add(n as u64, Ordering::Relaxed),
        };
        (0..n as u64)
            .map(|i| Self::with_pfn(base + i, 0, Weak::new()))
            .collect()
    }

    pub(crate) fn new_cached(mapping: Weak<AddressSpace>, index: u64) -> Arc<Page> {
        let pfn = NEXT_LOW_PFN.fetch_add(1, Ordering::Relaxed);
        Self::with_pfn(pfn, index, mapping)
    }

    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn phys_addr(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }

    pub fn is_high(&self) -> bool {
        self.pfn >= HIGHMEM_START_PFN
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn test_flag(&self, flag: PageFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&self, flag: PageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: PageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    // Returns the previous state of `flag`.
    pub fn test_and_set_flag(&self, flag: PageFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    pub fn test_and_clear_flag(&self, flag: PageFlags) -> bool {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    pub fn is_locked(&self) -> bool {
        self.test_flag(PageFlags::LOCKED)
    }

    pub fn is_uptodate(&self) -> bool {
        self.test_flag(PageFlags::UPTODATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.test_flag(PageFlags::DIRTY)
    }

    pub fn is_writeback(&self) -> bool {
        self.test_flag(PageFlags::WRITEBACK)
    }

    pub fn lock_page(&self) {
        while self.test_and_set_flag(PageFlags::LOCKED) {
            run_queues();
            self.wait.wait_until(|| !self.is_locked());
        }
    }

    pub fn try_lock_page(&self) -> bool {
        !self.test_and_set_flag(PageFlags::LOCKED)
    }

    pub fn unlock_page(&self) {
        if !self.test_and_clear_flag(PageFlags::LOCKED) {
            panic!("unlock of unlocked page {}", self.pfn);
        }
        self.wait.wake_all();
    }

    pub fn wait_on_page_locked(&self) {
        if self.is_locked() {
            run_queues();
            self.wait.wait_until(|| !self.is_locked());
        }
    }

    // Returns true if the page was already under writeback.
    pub fn set_writeback(&self) -> bool {
        self.test_and_set_flag(PageFlags::WRITEBACK)
    }

    pub fn end_page_writeback(&self) {
        if !self.test_and_clear_flag(PageFlags::WRITEBACK) {
            panic!("end of writeback on page {} not under writeback", self.pfn);
        }
        self.wait.wake_all();
    }

    pub fn wait_on_page_writeback(&self) {
        if self.is_writeback() {
            run_queues();
            self.wait.wait_until(|| !self.is_writeback());
        }
    }

    pub fn mapping(&self) -> Option<Arc<AddressSpace>> {
        self.mapping.read().unwrap().upgrade()
    }

    pub(crate) fn detach_mapping(&self) {
        *self.mapping.write().unwrap() = Weak::new();
    }

    pub fn has_buffers(&self) -> bool {
        self.test_flag(PageFlags::PRIVATE)
    }

    pub fn buffers(&self) -> Option<Vec<Arc<BufferHead>>> {
        self.buffers.lock().unwrap().clone()
    }

    pub(crate) fn attach_buffers(&self, ring: Vec<Arc<BufferHead>>) {
        *self.buffers.lock().unwrap() = Some(ring);
        self.set_flag(PageFlags::PRIVATE);
    }

    pub(crate) fn detach_buffers(&self) -> Option<Vec<Arc<BufferHead>>> {
        self.clear_flag(PageFlags::PRIVATE);
        self.buffers.lock().unwrap().take()
    }

    pub fn read_data<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R {
        f(&self.data.read().unwrap())
    }

    pub fn write_data<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> R {
        f(&mut self.data.write().unwrap())
    }

    pub fn copy_to(&self, offset: usize, out: &mut [u8]) {
        self.read_data(|data| out.copy_from_slice(&data[offset..offset + out.len()]));
    }

    pub fn copy_from(&self, offset: usize, src: &[u8]) {
        self.write_data(|data| data[offset..offset + src.len()].copy_from_slice(src));
    }

    pub fn zero_range(&self, offset: usize, len: usize) {
        self.write_data(|data| data[offset..offset + len].fill(0));
    }

    // Marks the page dirty without touching its buffers.
    pub fn set_page_dirty_nobuffers(&self) -> bool {
        if self.test_and_set_flag(PageFlags::DIRTY) {
            return false;
        }
        if let Some(mapping) = self.mapping() {
            mapping.tag_dirty(self.index);
        }
        true
    }

    // Clears the dirty bit ahead of writing the page out. Returns whether it was set.
    pub fn clear_page_dirty_for_io(&self) -> bool {
        if !self.test_and_clear_flag(PageFlags::DIRTY) {
            return false;
        }
        if let Some(mapping) = self.mapping() {
            mapping.clear_dirty_tag(self.index);
        }
        true
    }
}
