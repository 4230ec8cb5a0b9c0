use std::{
    borrow::Borrow,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use bitflags::bitflags;
use lazy_static::lazy_static;
use log::{error, warn};

use crate::{
    config::buffer_constants::DEFAULT_MAX_BUFFER_HEADS,
    storage::{
        disk::{device::BlockDevice, scheduler::run_queues},
        mapping::AddressSpace,
        page::{Page, PageFlags},
    },
    utils::wait::WaitQueue,
};

bitflags! {
    pub struct BhState: u32 {
        const UPTODATE = 1 << 0;
        const DIRTY = 1 << 1;
        const LOCK = 1 << 2;
        // Has been submitted for I/O at least once.
        const REQ = 1 << 3;
        // Has a disk mapping.
        const MAPPED = 1 << 4;
        // Freshly allocated on disk by get_block.
        const NEW = 1 << 5;
        const ASYNC_READ = 1 << 6;
        const ASYNC_WRITE = 1 << 7;
        // Block reserved but not yet allocated.
        const DELAY = 1 << 8;
        // Next block is discontiguous.
        const BOUNDARY = 1 << 9;
        const WRITE_EIO = 1 << 10;
        // Last I/O on this buffer failed.
        const IO_ERROR = 1 << 11;
    }
}

// Completion hook, called with whether the I/O succeeded.
pub type BhEndIo = fn(&Arc<BufferHead>, bool);

static NEXT_BH_ID: AtomicU64 = AtomicU64::new(1);

static NR_BUFFER_HEADS: AtomicUsize = AtomicUsize::new(0);
static MAX_BUFFER_HEADS: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_BUFFER_HEADS);

#[cfg(test)]
thread_local! {
    static FAIL_ALLOCS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

// Makes the calling thread's next `n` buffer-head allocations fail.
#[cfg(test)]
pub(crate) fn fail_next_allocs(n: usize) {
    FAIL_ALLOCS.with(|c| c.set(n));
}

pub fn set_max_buffer_heads(max: usize) {
    MAX_BUFFER_HEADS.store(max, Ordering::Release);
}

pub fn nr_buffer_heads() -> usize {
    NR_BUFFER_HEADS.load(Ordering::Acquire)
}

lazy_static! {
    // Serializes the page-level state change when sibling buffers of one page
    // complete at the same time.
    static ref PAGE_UPTODATE_LOCK: Mutex<()> = Mutex::new(());
}

// A disk block cached in part of a page.
pub struct BufferHead {
    id: u64,
    state: AtomicU32,
    blocknr: AtomicU64,
    size: u32,

    page: Weak<Page>,
    offset: usize,

    bdev: RwLock<Weak<BlockDevice>>,
    dev: AtomicU32,

    count: AtomicU32,
    end_io: Mutex<Option<BhEndIo>>,

    // Inode mapping whose private list holds this buffer.
    assoc: Mutex<Weak<AddressSpace>>,

    wait: WaitQueue,
}

impl std::fmt::Debug for BufferHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHead")
            .field("id", &self.id)
            .field("dev", &self.dev())
            .field("blocknr", &self.blocknr())
            .field("size", &self.size)
            .field("state", &self.state())
            .field("count", &self.count())
            .finish()
    }
}

impl Drop for BufferHead {
    fn drop(&mut self) {
        NR_BUFFER_HEADS.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BufferHead {
    // Takes one slot of the buffer-head budget. None when it is exhausted.
    pub(crate) fn alloc(page: &Arc<Page>, offset: usize, size: u32) -> Option<Arc<BufferHead>> {
        #[cfg(test)]
        {
            let fail = FAIL_ALLOCS.with(|c| {
                let n = c.get();
                if n > 0 {
                    c.set(n - 1);
                }
                n > 0
            });
            if fail {
                return None;
            }
        }

        let max = MAX_BUFFER_HEADS.load(Ordering::Acquire);
        NR_BUFFER_HEADS
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |nr| (nr < max).then_some(nr + 1))
            .ok()?;

        Some(Arc::new(BufferHead {
            id: NEXT_BH_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU32::new(0),
            blocknr: AtomicU64::new(u64::MAX),
            size,

            page: Arc::downgrade(page),
            offset,

            bdev: RwLock::new(Weak::new()),
            dev: AtomicU32::new(0),

            count: AtomicU32::new(0),
            end_io: Mutex::new(None),

            assoc: Mutex::new(Weak::new()),

            wait: WaitQueue::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.upgrade()
    }

    pub fn blocknr(&self) -> u64 {
        self.blocknr.load(Ordering::Acquire)
    }

    pub fn set_blocknr(&self, blocknr: u64) {
        self.blocknr.store(blocknr, Ordering::Release);
    }

    pub fn bdev(&self) -> Option<Arc<BlockDevice>> {
        self.bdev.read().unwrap().upgrade()
    }

    // Device number, 0 when unmapped.
    pub fn dev(&self) -> u32 {
        self.dev.load(Ordering::Acquire)
    }

    pub(crate) fn set_bdev(&self, bdev: Option<&Arc<BlockDevice>>) {
        let mut slot = self.bdev.write().unwrap();
        match bdev {
            Some(bdev) => {
                *slot = Arc::downgrade(bdev);
                self.dev.store(bdev.dev(), Ordering::Release);
            }
            None => {
                *slot = Weak::new();
                self.dev.store(0, Ordering::Release);
            }
        }
    }

    pub fn state(&self) -> BhState {
        BhState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn test(&self, bit: BhState) -> bool {
        self.state().contains(bit)
    }

    pub fn set(&self, bits: BhState) {
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, bits: BhState) {
        self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    pub fn test_and_set(&self, bit: BhState) -> bool {
        self.state.fetch_or(bit.bits(), Ordering::AcqRel) & bit.bits() != 0
    }

    pub fn test_and_clear(&self, bit: BhState) -> bool {
        self.state.fetch_and(!bit.bits(), Ordering::AcqRel) & bit.bits() != 0
    }

    pub fn is_uptodate(&self) -> bool {
        self.test(BhState::UPTODATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.test(BhState::DIRTY)
    }

    pub fn is_locked(&self) -> bool {
        self.test(BhState::LOCK)
    }

    pub fn is_mapped(&self) -> bool {
        self.test(BhState::MAPPED)
    }

    pub fn is_new(&self) -> bool {
        self.test(BhState::NEW)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn get(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn put(&self) {
        let dropped = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if dropped.is_err() {
            warn!("brelse: trying to free free buffer {}", self.id);
        }
    }

    // Referenced, dirty or locked.
    pub fn is_busy(&self) -> bool {
        self.count() > 0 || self.state().intersects(BhState::DIRTY | BhState::LOCK)
    }

    pub(crate) fn set_end_io(&self, end_io: Option<BhEndIo>) {
        *self.end_io.lock().unwrap() = end_io;
    }

    pub(crate) fn end_io(&self) -> Option<BhEndIo> {
        *self.end_io.lock().unwrap()
    }

    // Binds the buffer to `blocknr` on `bdev`.
    pub fn map_bh(&self, bdev: &Arc<BlockDevice>, blocknr: u64) {
        self.set_bdev(Some(bdev));
        self.set_blocknr(blocknr);
        self.set(BhState::MAPPED);
    }

    pub fn lock_buffer(&self) {
        while self.test_and_set(BhState::LOCK) {
            self.wait_on_buffer();
        }
    }

    pub fn try_lock_buffer(&self) -> bool {
        !self.test_and_set(BhState::LOCK)
    }

    pub fn unlock_buffer(&self) {
        self.clear(BhState::LOCK);
        self.wait.wake_all();
    }

    pub fn wait_on_buffer(&self) {
        if self.is_locked() {
            // the I/O we wait for may sit behind a plug
            run_queues();
            self.wait.wait_until(|| !self.is_locked());
        }
    }

    pub fn mark_buffer_dirty(&self) {
        assert!(
            self.is_uptodate(),
            "dirtying buffer {} that is not uptodate",
            self.id
        );
        if !self.is_dirty() && !self.test_and_set(BhState::DIRTY) {
            if let Some(page) = self.page() {
                page.set_page_dirty_nobuffers();
            }
        }
    }

    pub(crate) fn assoc_mapping(&self) -> Option<Arc<AddressSpace>> {
        self.assoc.lock().unwrap().upgrade()
    }

    pub(crate) fn set_assoc(&self, mapping: Option<&Arc<AddressSpace>>) {
        *self.assoc.lock().unwrap() = mapping.map_or_else(Weak::new, Arc::downgrade);
    }

    pub(crate) fn is_listed(&self) -> bool {
        self.assoc.lock().unwrap().strong_count() > 0
    }
}

// Takes the buffer off its inode's associated list. A failed write is carried
// over to the inode mapping so fsync still sees it.
pub(crate) fn remove_assoc_queue(bh: &BufferHead) {
    let Some(mapping) = bh.assoc_mapping() else {
        bh.set_assoc(None);
        return;
    };
    mapping.assoc_list().remove(&bh.id());
    if bh.test(BhState::WRITE_EIO) {
        mapping.set_error(crate::error::BlkError::Io);
    }
    bh.set_assoc(None);
}

pub(crate) fn buffer_io_error(bh: &BufferHead) {
    error!(
        "Buffer I/O error on device {}, logical block {}",
        bh.bdev().map_or_else(|| "?".to_string(), |b| b.name().to_string()),
        bh.blocknr()
    );
}

pub fn end_buffer_read_sync(bh: &Arc<BufferHead>, uptodate: bool) {
    if uptodate {
        bh.set(BhState::UPTODATE);
        bh.clear(BhState::IO_ERROR);
    } else {
        bh.clear(BhState::UPTODATE);
        bh.set(BhState::IO_ERROR);
    }
    bh.unlock_buffer();
    bh.put();
}

pub fn end_buffer_write_sync(bh: &Arc<BufferHead>, uptodate: bool) {
    if uptodate {
        bh.set(BhState::UPTODATE);
        bh.clear(BhState::IO_ERROR);
    } else {
        buffer_io_error(bh);
        error!(
            "lost page write due to I/O error on {}",
            bh.bdev().map_or_else(|| "?".to_string(), |b| b.name().to_string())
        );
        bh.set(BhState::WRITE_EIO | BhState::IO_ERROR);
        bh.clear(BhState::UPTODATE);
    }
    bh.unlock_buffer();
    bh.put();
}

// Read completion for one of several buffers sharing a page. The last one to
// finish settles the page and unlocks it.
pub fn end_buffer_async_read(bh: &Arc<BufferHead>, uptodate: bool) {
    let page = bh.page();

    if uptodate {
        bh.set(BhState::UPTODATE);
        bh.clear(BhState::IO_ERROR);
    } else {
        bh.clear(BhState::UPTODATE);
        bh.set(BhState::IO_ERROR);
        buffer_io_error(bh);
        if let Some(page) = &page {
            page.set_flag(PageFlags::ERROR);
        }
    }

    let Some(page) = page else {
        bh.clear(BhState::ASYNC_READ);
        bh.unlock_buffer();
        return;
    };

    let mut page_uptodate = true;
    {
        let _guard = PAGE_UPTODATE_LOCK.lock().unwrap();
        bh.clear(BhState::ASYNC_READ);
        bh.unlock_buffer();

        for sibling in page.buffers().unwrap_or_default() {
            if !sibling.is_uptodate() {
                page_uptodate = false;
            }
            if sibling.test(BhState::ASYNC_READ) {
                return;
            }
        }
    }

    if page_uptodate && !page.test_flag(PageFlags::ERROR) {
        page.set_flag(PageFlags::UPTODATE);
    }
    page.unlock_page();
}

pub fn end_buffer_async_write(bh: &Arc<BufferHead>, uptodate: bool) {
    let page = bh.page();

    if uptodate {
        bh.set(BhState::UPTODATE);
        bh.clear(BhState::IO_ERROR);
    } else {
        buffer_io_error(bh);
        error!(
            "lost page write due to I/O error on {}",
            bh.bdev().map_or_else(|| "?".to_string(), |b| b.name().to_string())
        );
        bh.set(BhState::WRITE_EIO | BhState::IO_ERROR);
        bh.clear(BhState::UPTODATE);
        if let Some(page) = &page {
            if let Some(mapping) = page.mapping() {
                mapping.set_error(crate::error::BlkError::Io);
            }
            page.set_flag(PageFlags::ERROR);
        }
    }

    let Some(page) = page else {
        bh.clear(BhState::ASYNC_WRITE);
        bh.unlock_buffer();
        return;
    };

    {
        let _guard = PAGE_UPTODATE_LOCK.lock().unwrap();
        bh.clear(BhState::ASYNC_WRITE);
        bh.unlock_buffer();

        for sibling in page.buffers().unwrap_or_default() {
            if sibling.test(BhState::ASYNC_WRITE) {
                return;
            }
        }
    }

    page.end_page_writeback();
}

pub(crate) fn mark_buffer_async_read(bh: &BufferHead) {
    bh.set_end_io(Some(end_buffer_async_read));
    bh.set(BhState::ASYNC_READ);
}

pub(crate) fn mark_buffer_async_write(bh: &BufferHead) {
    bh.set_end_io(Some(end_buffer_async_write));
    bh.set(BhState::ASYNC_WRITE);
}

// Counted reference to a buffer. Dropping it is `brelse`.
pub struct BhRef {
    bh: Arc<BufferHead>,
}

impl BhRef {
    pub fn new(bh: Arc<BufferHead>) -> Self {
        bh.get();
        Self { bh }
    }

    // Adopts a reference the caller already took.
    pub(crate) fn from_counted(bh: Arc<BufferHead>) -> Self {
        Self { bh }
    }

    // `bforget`: drop the reference and any pending write with it.
    pub fn forget(self) {
        self.bh.clear(BhState::DIRTY);
        if self.bh.is_listed() {
            remove_assoc_queue(&self.bh);
        }
    }
}

impl Clone for BhRef {
    fn clone(&self) -> Self {
        BhRef::new(Arc::clone(&self.bh))
    }
}

impl std::ops::Deref for BhRef {
    type Target = Arc<BufferHead>;

    fn deref(&self) -> &Arc<BufferHead> {
        &self.bh
    }
}

impl Borrow<Arc<BufferHead>> for BhRef {
    fn borrow(&self) -> &Arc<BufferHead> {
        &self.bh
    }
}

impl std::fmt::Debug for BhRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.bh.fmt(f)
    }
}

impl Drop for BhRef {
    fn drop(&mut self) {
        self.bh.put();
    }
}

pub fn brelse(bh: BhRef) {
    drop(bh);
}

pub fn bforget(bh: BhRef) {
    bh.forget();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::page::Zone;

    #[test]
    fn bhref_counts_references() {
        let page = Page::alloc(Zone::Normal);
        let bh = BufferHead::alloc(&page, 0, 1024).unwrap();

        let first = BhRef::new(bh.clone());
        let second = first.clone();
        assert_eq!(bh.count(), 2);

        drop(first);
        assert_eq!(bh.count(), 1);
        brelse(second);
        assert_eq!(bh.count(), 0);
    }

    #[test]
    fn bforget_drops_dirty_state() {
        let page = Page::alloc(Zone::Normal);
        let bh = BufferHead::alloc(&page, 0, 1024).unwrap();
        bh.set(BhState::UPTODATE);
        bh.mark_buffer_dirty();
        assert!(page.is_dirty());

        bforget(BhRef::new(bh.clone()));
        assert!(!bh.is_dirty());
        assert_eq!(bh.count(), 0);
    }

    #[test]
    #[should_panic]
    fn dirtying_stale_buffer_panics() {
        let page = Page::alloc(Zone::Normal);
        let bh = BufferHead::alloc(&page, 0, 1024).unwrap();
        bh.mark_buffer_dirty();
    }

    #[test]
    fn redirtying_locked_buffer_keeps_lock() {
        let page = Page::alloc(Zone::Normal);
        let bh = BufferHead::alloc(&page, 0, 1024).unwrap();
        bh.set(BhState::UPTODATE);
        bh.mark_buffer_dirty();
        bh.lock_buffer();

        bh.mark_buffer_dirty();
        assert!(bh.is_dirty());
        assert!(bh.is_locked());
        bh.unlock_buffer();
    }

    #[test]
    fn failed_sync_read_flags_error() {
        let page = Page::alloc(Zone::Normal);
        let bh = BufferHead::alloc(&page, 0, 1024).unwrap();
        bh.lock_buffer();
        bh.get();

        end_buffer_read_sync(&bh, false);
        assert!(!bh.is_uptodate());
        assert!(bh.test(BhState::IO_ERROR));
        assert!(!bh.is_locked());
        assert_eq!(bh.count(), 0);
    }
}
