use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use bitflags::bitflags;
use dashmap::DashMap;
use hashlink::{LinkedHashMap, LinkedHashSet};

use crate::{
    buffer::{buffer_cache::BlkdevGetBlock, buffer_head::BufferHead},
    error::{BlkError, BlkResult},
};

use super::{disk::device::BlockDevice, page::Page};

bitflags! {
    // Sticky writeback errors, reported once to the next fsync.
    pub struct MappingFlags: u32 {
        const EIO = 1 << 0;
        const ENOSPC = 1 << 1;
    }
}

bitflags! {
    pub struct InodeState: u32 {
        const DIRTY_SYNC = 1 << 0;
        const DIRTY_DATASYNC = 1 << 1;
        const DIRTY_PAGES = 1 << 2;
    }
}

// Maps logical block `iblock` of a file onto a disk block by filling in `bh`.
pub trait GetBlock: Send + Sync {
    fn get_block(&self, iblock: u64, bh: &BufferHead, create: bool) -> BlkResult<()>;
}

pub enum MappingHost {
    BlockDevice(Weak<BlockDevice>),
    Inode(Weak<Inode>),
}

// Page cache of one file or block device, plus the list of metadata buffers
// that must reach disk before an fsync of the host returns.
pub struct AddressSpace {
    host: MappingHost,
    self_ref: Weak<AddressSpace>,

    pages: DashMap<u64, Arc<Page>>,
    dirty_pages: Mutex<LinkedHashSet<u64>>,

    // Serializes attaching and detaching buffers on this mapping's pages and
    // dirtying them as a group.
    pub(crate) private_lock: Mutex<()>,

    private_list: Mutex<LinkedHashMap<u64, Arc<BufferHead>>>,
    assoc_mapping: Mutex<Weak<AddressSpace>>,

    flags: AtomicU32,
    blkbits: AtomicU32,
}

impl AddressSpace {
    pub fn new(host: MappingHost, blkbits: u32) -> Arc<AddressSpace> {
        Arc::new_cyclic(|self_ref| AddressSpace {
            host,
            self_ref: self_ref.clone(),

            pages: DashMap::new(),
            dirty_pages: Mutex::new(LinkedHashSet::new()),

            private_lock: Mutex::new(()),
            private_list: Mutex::new(LinkedHashMap::new()),
            assoc_mapping: Mutex::new(Weak::new()),

            flags: AtomicU32::new(0),
            blkbits: AtomicU32::new(blkbits),
        })
    }

    pub fn host(&self) -> &MappingHost {
        &self.host
    }

    pub fn bdev(&self) -> Option<Arc<BlockDevice>> {
        match &self.host {
            MappingHost::BlockDevice(bdev) => bdev.upgrade(),
            MappingHost::Inode(inode) => inode.upgrade().and_then(|inode| inode.bdev()),
        }
    }

    pub fn get_block(&self) -> Option<Arc<dyn GetBlock>> {
        match &self.host {
            MappingHost::BlockDevice(bdev) => {
                Some(Arc::new(BlkdevGetBlock::new(bdev.clone())) as Arc<dyn GetBlock>)
            }
            MappingHost::Inode(inode) => inode.upgrade().map(|inode| inode.get_block.clone()),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match &self.host {
            MappingHost::BlockDevice(bdev) => bdev.upgrade().map_or(0, |b| b.size_bytes()),
            MappingHost::Inode(inode) => inode.upgrade().map_or(0, |i| i.size()),
        }
    }

    pub fn blkbits(&self) -> u32 {
        self.blkbits.load(Ordering::Acquire)
    }

    pub fn set_blkbits(&self, blkbits: u32) {
        self.blkbits.store(blkbits, Ordering::Release);
    }

    pub fn find_get_page(&self, index: u64) -> Option<Arc<Page>> {
        self.pages.get(&index).map(|page| Arc::clone(&page))
    }

    // Returns the page at `index` locked, creating it if absent.
    pub fn find_or_create_page(&self, index: u64) -> Arc<Page> {
        loop {
            let page = self
                .pages
                .entry(index)
                .or_insert_with(|| Page::new_cached(self.self_ref.clone(), index))
                .clone();

            page.lock_page();

            // truncated while we slept on the lock
            let still_ours = page
                .mapping()
                .map_or(false, |m| std::ptr::eq(Arc::as_ptr(&m), self as *const _));
            if still_ours {
                return page;
            }
            page.unlock_page();
        }
    }

    pub fn remove_page(&self, page: &Page) {
        self.pages.remove(&page.index());
        self.clear_dirty_tag(page.index());
        page.detach_mapping();
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        let mut pages: Vec<Arc<Page>> = self.pages.iter().map(|p| Arc::clone(p.value())).collect();
        pages.sort_by_key(|p| p.index());
        pages
    }

    pub(crate) fn tag_dirty(&self, index: u64) {
        self.dirty_pages.lock().unwrap().insert(index);
        if let MappingHost::Inode(inode) = &self.host {
            if let Some(inode) = inode.upgrade() {
                inode.mark_inode_dirty(InodeState::DIRTY_PAGES);
            }
        }
    }

    pub(crate) fn clear_dirty_tag(&self, index: u64) {
        self.dirty_pages.lock().unwrap().remove(&index);
    }

    pub fn nr_dirty(&self) -> usize {
        self.dirty_pages.lock().unwrap().len()
    }

    // Snapshot of dirty page indices in the order they were dirtied.
    pub fn dirty_indices(&self) -> Vec<u64> {
        self.dirty_pages.lock().unwrap().iter().copied().collect()
    }

    pub fn set_error(&self, err: BlkError) {
        let flag = match err {
            BlkError::NoSpace => MappingFlags::ENOSPC,
            _ => MappingFlags::EIO,
        };
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn flags(&self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    // Reports and clears sticky errors. ENOSPC wins over EIO.
    pub fn check_errors(&self) -> BlkResult<()> {
        let old = self.flags.swap(0, Ordering::AcqRel);
        let old = MappingFlags::from_bits_truncate(old);
        if old.contains(MappingFlags::ENOSPC) {
            Err(BlkError::NoSpace)
        } else if old.contains(MappingFlags::EIO) {
            Err(BlkError::Io)
        } else {
            Ok(())
        }
    }

    pub fn assoc_mapping(&self) -> Option<Arc<AddressSpace>> {
        self.assoc_mapping.lock().unwrap().upgrade()
    }

    pub(crate) fn set_assoc_mapping(&self, mapping: &Arc<AddressSpace>) {
        *self.assoc_mapping.lock().unwrap() = Arc::downgrade(mapping);
    }

    pub fn has_assoc_buffers(&self) -> bool {
        !self.private_list.lock().unwrap().is_empty()
    }

    pub fn nr_assoc_buffers(&self) -> usize {
        self.private_list.lock().unwrap().len()
    }

    pub(crate) fn assoc_list(&self) -> std::sync::MutexGuard<'_, LinkedHashMap<u64, Arc<BufferHead>>> {
        self.private_list.lock().unwrap()
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<AddressSpace>> {
        self.self_ref.upgrade()
    }
}

pub struct Inode {
    ino: u64,
    size: AtomicU64,
    state: AtomicU32,
    bdev: Weak<BlockDevice>,
    mapping: Arc<AddressSpace>,
    get_block: Arc<dyn GetBlock>,
}

impl Inode {
    pub fn new(
        ino: u64,
        bdev: &Arc<BlockDevice>,
        blkbits: u32,
        size: u64,
        get_block: Arc<dyn GetBlock>,
    ) -> Arc<Inode> {
        Arc::new_cyclic(|inode| Inode {
            ino,
            size: AtomicU64::new(size),
            state: AtomicU32::new(0),
            bdev: Arc::downgrade(bdev),
            mapping: AddressSpace::new(MappingHost::Inode(inode.clone()), blkbits),
            get_block,
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn blkbits(&self) -> u32 {
        self.mapping.blkbits()
    }

    pub fn bdev(&self) -> Option<Arc<BlockDevice>> {
        self.bdev.upgrade()
    }

    pub fn mapping(&self) -> &Arc<AddressSpace> {
        &self.mapping
    }

    pub fn state(&self) -> InodeState {
        InodeState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn mark_inode_dirty(&self, flags: InodeState) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_inode_dirty(&self, flags: InodeState) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}
