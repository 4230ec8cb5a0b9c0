use std::sync::{Arc, Weak};

use log::{debug, error, trace};

use crate::{
    config::buffer_constants::{FREE_MORE_MEMORY_RETRIES, PAGE_SHIFT, PAGE_SIZE, SECTOR_SHIFT},
    error::{BlkError, BlkResult},
    storage::{
        disk::{
            bio::{Bio, BioFlags, Direction, RwMode},
            device::{submit_bio, BlockDevice},
        },
        mapping::{AddressSpace, GetBlock},
        page::{Page, PageFlags},
    },
};

use super::{
    buffer_head::{
        end_buffer_async_read, end_buffer_read_sync, end_buffer_write_sync, mark_buffer_async_read,
        mark_buffer_async_write, BhRef, BhState, BufferHead,
    },
    lru::{bh_lru_install, invalidate_bh_lrus, lookup_bh_lru},
    page_buffers::{
        block_invalidatepage, create_empty_buffers, free_more_memory, grow_buffers, try_to_release_page,
        valid_block_size,
    },
};

// Block device pages map one to one onto device blocks.
pub struct BlkdevGetBlock {
    bdev: Weak<BlockDevice>,
}

impl BlkdevGetBlock {
    pub fn new(bdev: Weak<BlockDevice>) -> Self {
        Self { bdev }
    }
}

impl GetBlock for BlkdevGetBlock {
    fn get_block(&self, iblock: u64, bh: &BufferHead, create: bool) -> BlkResult<()> {
        let bdev = self.bdev.upgrade().ok_or(BlkError::NoDevice)?;
        let max_block = bdev.size_bytes() >> bh.size().trailing_zeros();
        if iblock >= max_block {
            // past the end reads as a hole
            return if create { Err(BlkError::Io) } else { Ok(()) };
        }
        bh.map_bh(&bdev, iblock);
        Ok(())
    }
}

// Authoritative lookup through the block device's page cache.
pub fn find_get_block_slow(bdev: &Arc<BlockDevice>, block: u64, size: u32) -> Option<Arc<BufferHead>> {
    if !valid_block_size(bdev, size) {
        return None;
    }
    let mapping = bdev.mapping();
    let index = block >> (PAGE_SHIFT as u32 - size.trailing_zeros());
    let page = mapping.find_get_page(index)?;

    let _guard = mapping.private_lock.lock().unwrap();
    let ring = page.buffers()?;

    let mut all_mapped = true;
    for bh in &ring {
        if !bh.is_mapped() {
            all_mapped = false;
        } else if bh.blocknr() == block && bh.size() == size {
            bh.get();
            return Some(Arc::clone(bh));
        }
    }

    if all_mapped {
        error!(
            "find_get_block_slow() failed. block={}, size={}, page index={}, device {}",
            block,
            size,
            index,
            bdev.name()
        );
    }
    None
}

// Cached buffer for `block`, if one exists. Hits are installed in this cpu's
// lookup array.
pub fn find_get_block(bdev: &Arc<BlockDevice>, block: u64, size: u32) -> Option<BhRef> {
    let bh = match lookup_bh_lru(bdev.dev(), block, size) {
        Some(bh) => bh,
        None => {
            let bh = find_get_block_slow(bdev, block, size)?;
            bh_lru_install(&bh);
            bh
        }
    };
    Some(BhRef::from_counted(bh))
}

// The buffer for `block`, created if needed. Not read from disk.
pub fn getblk(bdev: &Arc<BlockDevice>, block: u64, size: u32) -> BlkResult<BhRef> {
    if !valid_block_size(bdev, size) {
        error!("getblk(): invalid block size {} on {}", size, bdev.name());
        return Err(BlkError::InvalidArgument);
    }

    let mut attempts = 0;
    loop {
        if let Some(bh) = find_get_block(bdev, block, size) {
            return Ok(bh);
        }
        if grow_buffers(bdev, block, size) {
            continue;
        }
        if attempts == FREE_MORE_MEMORY_RETRIES {
            return Err(BlkError::NoMemory);
        }
        attempts += 1;
        free_more_memory();
    }
}

fn bread_slow(bh: BhRef) -> BlkResult<BhRef> {
    bh.lock_buffer();
    if bh.is_uptodate() {
        bh.unlock_buffer();
        return Ok(bh);
    }

    bh.get();
    bh.set_end_io(Some(end_buffer_read_sync));
    submit_bh(RwMode::Read, &bh);
    bh.wait_on_buffer();
    if bh.is_uptodate() {
        Ok(bh)
    } else {
        Err(BlkError::Io)
    }
}

// The buffer for `block` with its contents read in.
pub fn bread(bdev: &Arc<BlockDevice>, block: u64, size: u32) -> BlkResult<BhRef> {
    let bh = getblk(bdev, block, size)?;
    if bh.is_uptodate() {
        return Ok(bh);
    }
    bread_slow(bh)
}

// Starts a read of `block` that gives up rather than wait for a request.
pub fn breadahead(bdev: &Arc<BlockDevice>, block: u64, size: u32) -> BlkResult<()> {
    let bh = getblk(bdev, block, size)?;
    ll_rw_block(RwMode::ReadAhead, &[&*bh]);
    Ok(())
}

// Sends one locked, mapped buffer to its device as a single-segment bio.
pub fn submit_bh(mode: RwMode, bh: &Arc<BufferHead>) {
    assert!(bh.is_locked(), "submitting unlocked buffer {}", bh.id());
    assert!(bh.is_mapped(), "submitting unmapped buffer {}", bh.id());
    let Some(end_io) = bh.end_io() else {
        panic!("submitting buffer {} without a completion", bh.id());
    };

    let dir = mode.direction();
    if dir == Direction::Write {
        bh.clear(BhState::WRITE_EIO);
    }
    bh.set(BhState::REQ);

    let (Some(bdev), Some(page)) = (bh.bdev(), bh.page()) else {
        end_io(bh, false);
        return;
    };

    let sector = bh.blocknr() * (bh.size() as u64 >> SECTOR_SHIFT);
    let mut bio = Bio::new(bdev, sector, dir);
    bio.add_page(page, bh.size() as usize, bh.offset());
    if mode == RwMode::ReadAhead {
        bio.set_flags(BioFlags::AHEAD);
    }

    let owner = Arc::clone(bh);
    bio.set_end_io(move |bio| {
        if bio.flags().contains(BioFlags::EOF) {
            trace!("buffer {} hit end of device", owner.id());
        }
        end_io(&owner, bio.status().is_ok());
    });

    trace!("submit_bh: {:?} block {} sector {}", dir, bh.blocknr(), sector);
    submit_bio(dir, bio);
}

// Starts I/O on every buffer that needs it: dirty ones for writes, stale ones
// for reads. Buffers someone else has locked are skipped.
pub fn ll_rw_block(mode: RwMode, bhs: &[&Arc<BufferHead>]) {
    for &bh in bhs {
        if !bh.try_lock_buffer() {
            continue;
        }

        bh.get();
        match mode {
            RwMode::Write => {
                if bh.test_and_clear(BhState::DIRTY) {
                    bh.set_end_io(Some(end_buffer_write_sync));
                    submit_bh(mode, bh);
                    continue;
                }
            }
            RwMode::Read | RwMode::ReadAhead => {
                if !bh.is_uptodate() {
                    bh.set_end_io(Some(end_buffer_read_sync));
                    submit_bh(mode, bh);
                    continue;
                }
            }
        }
        bh.unlock_buffer();
        bh.put();
    }
}

// Writes `bh` if dirty and waits for it.
pub fn sync_dirty_buffer(bh: &Arc<BufferHead>) -> BlkResult<()> {
    bh.lock_buffer();
    if !bh.test_and_clear(BhState::DIRTY) {
        bh.unlock_buffer();
        return Ok(());
    }

    bh.get();
    bh.set_end_io(Some(end_buffer_write_sync));
    submit_bh(RwMode::Write, bh);
    bh.wait_on_buffer();
    if bh.is_uptodate() {
        Ok(())
    } else {
        Err(BlkError::Io)
    }
}

// Reads a locked page through its buffers, mapping them with `get_block`.
// Holes are zero-filled. The page is unlocked once every read completes.
pub fn block_read_full_page(page: &Arc<Page>, get_block: &dyn GetBlock) -> BlkResult<()> {
    assert!(page.is_locked(), "reading unlocked page {}", page.pfn());
    let mapping = page.mapping();
    let blkbits = mapping.as_ref().map_or(PAGE_SHIFT as u32, |m| m.blkbits());
    let blocksize = 1u32 << blkbits;

    if !page.has_buffers() {
        create_empty_buffers(page, blocksize, BhState::empty())?;
    }
    let ring = page.buffers().unwrap_or_default();

    let mut iblock = page.index() << (PAGE_SHIFT as u32 - blkbits);
    let i_size = mapping.as_ref().map_or(0, |m| m.size_bytes());
    let lblock = (i_size + blocksize as u64 - 1) >> blkbits;

    let mut fully_mapped = true;
    let mut to_read = Vec::new();
    for bh in &ring {
        let block = iblock;
        iblock += 1;
        if bh.is_uptodate() {
            continue;
        }

        if !bh.is_mapped() {
            fully_mapped = false;
            if block < lblock && get_block.get_block(block, bh, false).is_err() {
                page.set_flag(PageFlags::ERROR);
            }
            if !bh.is_mapped() {
                page.zero_range(bh.offset(), bh.size() as usize);
                bh.set(BhState::UPTODATE);
                continue;
            }
            // get_block may have read the data in
            if bh.is_uptodate() {
                continue;
            }
        }
        to_read.push(Arc::clone(bh));
    }

    if fully_mapped {
        page.set_flag(PageFlags::MAPPED_TO_DISK);
    }

    if to_read.is_empty() {
        if !page.test_flag(PageFlags::ERROR) {
            page.set_flag(PageFlags::UPTODATE);
        }
        page.unlock_page();
        return Ok(());
    }

    for bh in &to_read {
        bh.lock_buffer();
        mark_buffer_async_read(bh);
    }
    for bh in &to_read {
        if bh.is_uptodate() {
            end_buffer_async_read(bh, true);
        } else {
            submit_bh(RwMode::Read, bh);
        }
    }
    Ok(())
}

fn write_full_page(page: &Arc<Page>, get_block: &dyn GetBlock, i_size: u64, blkbits: u32) -> BlkResult<()> {
    let blocksize = 1u32 << blkbits;
    let last_block = if i_size == 0 { 0 } else { (i_size - 1) >> blkbits };

    if !page.has_buffers() {
        create_empty_buffers(page, blocksize, BhState::DIRTY | BhState::UPTODATE)?;
    }
    let ring = page.buffers().unwrap_or_default();

    let mut result = Ok(());
    let mut block = page.index() << (PAGE_SHIFT as u32 - blkbits);
    for bh in &ring {
        if i_size == 0 || block > last_block {
            // past end of file: nothing to write
            bh.clear(BhState::DIRTY);
            bh.set(BhState::UPTODATE);
        } else if !bh.is_mapped() && bh.is_dirty() {
            if let Err(err) = get_block.get_block(block, bh, true) {
                result = Err(err);
                break;
            }
            bh.clear(BhState::NEW);
        }
        block += 1;
    }

    if let Err(err) = result {
        // keep what is mapped moving; the rest loses its dirty data
        error!("block_write_full_page: get_block failed on page {}: {}", page.index(), err);
        page.set_flag(PageFlags::ERROR);
        for bh in &ring {
            if bh.is_mapped() && bh.is_dirty() {
                bh.lock_buffer();
                mark_buffer_async_write(bh);
            } else {
                bh.clear(BhState::DIRTY);
            }
        }
    } else {
        for bh in &ring {
            if !bh.is_mapped() {
                continue;
            }
            bh.lock_buffer();
            if bh.test_and_clear(BhState::DIRTY) {
                mark_buffer_async_write(bh);
            } else {
                bh.unlock_buffer();
            }
        }
    }

    if page.set_writeback() {
        panic!("page {} already under writeback", page.index());
    }
    page.unlock_page();

    let mut nr_underway = 0;
    for bh in &ring {
        if bh.test(BhState::ASYNC_WRITE) {
            bh.clear(BhState::DIRTY);
            submit_bh(RwMode::Write, bh);
            nr_underway += 1;
        }
    }

    if nr_underway == 0 {
        if ring.iter().all(|bh| bh.is_uptodate()) {
            page.set_flag(PageFlags::UPTODATE);
        }
        page.end_page_writeback();
    }
    result
}

// Writes the dirty buffers of a locked page, mapping blocks with `get_block`.
// The page is unlocked on return and its writeback runs asynchronously.
pub fn block_write_full_page(page: &Arc<Page>, get_block: &dyn GetBlock) -> BlkResult<()> {
    assert!(page.is_locked(), "writing unlocked page {}", page.pfn());
    let mapping = page.mapping();
    let blkbits = mapping.as_ref().map_or(PAGE_SHIFT as u32, |m| m.blkbits());
    let i_size = mapping.as_ref().map_or(0, |m| m.size_bytes());

    let end_index = i_size >> PAGE_SHIFT;
    if page.index() < end_index {
        return write_full_page(page, get_block, i_size, blkbits);
    }

    let tail = (i_size & (PAGE_SIZE as u64 - 1)) as usize;
    if page.index() >= end_index + 1 || tail == 0 {
        // wholly outside the file, truncate got here first
        block_invalidatepage(page, 0);
        page.unlock_page();
        return Ok(());
    }

    page.zero_range(tail, PAGE_SIZE - tail);
    write_full_page(page, get_block, i_size, blkbits)
}

// Writes a locked dirty page through the mapping's block resolver.
pub fn writepage(mapping: &AddressSpace, page: &Arc<Page>) -> BlkResult<()> {
    let Some(get_block) = mapping.get_block() else {
        page.unlock_page();
        return Err(BlkError::NoDevice);
    };
    block_write_full_page(page, &*get_block)
}

// Reads a locked page through the mapping's block resolver.
pub fn readpage(mapping: &AddressSpace, page: &Arc<Page>) -> BlkResult<()> {
    let Some(get_block) = mapping.get_block() else {
        page.unlock_page();
        return Err(BlkError::NoDevice);
    };
    block_read_full_page(page, &*get_block)
}

// Drops every clean, unused page of the device's cache. With `destroy_dirty`
// dirty pages are discarded as well.
pub fn invalidate_bdev(bdev: &BlockDevice, destroy_dirty: bool) {
    invalidate_bh_lrus();

    let mapping = bdev.mapping();
    let mut dropped = 0;
    for page in mapping.pages() {
        if !page.try_lock_page() {
            continue;
        }
        if page.is_writeback() || (page.is_dirty() && !destroy_dirty) {
            page.unlock_page();
            continue;
        }

        let released = if destroy_dirty {
            block_invalidatepage(&page, 0)
        } else {
            try_to_release_page(&page)
        };
        if released {
            page.clear_page_dirty_for_io();
            mapping.remove_page(&page);
            dropped += 1;
        }
        page.unlock_page();
    }
    debug!("invalidate_bdev {}: dropped {} pages", bdev.name(), dropped);
}
