use std::sync::Arc;

use log::debug;

use crate::{
    config::buffer_constants::{FREE_MORE_MEMORY_RETRIES, PAGE_SHIFT, PAGE_SIZE},
    error::{BlkError, BlkResult},
    storage::{
        disk::{device::BlockDevice, scheduler::run_queues},
        page::Page,
    },
};

use super::{
    buffer_head::{remove_assoc_queue, BhState, BufferHead},
    lru::invalidate_bh_lrus,
};

// Nudges the system towards freeing buffer heads: start queued writeback,
// let others run, and drop the per-cpu lookup references.
pub fn free_more_memory() {
    run_queues();
    std::thread::yield_now();
    invalidate_bh_lrus();
}

// Builds `PAGE_SIZE / size` buffers for `page` in ascending offset order. With
// `retry` the allocation is retried a bounded number of times.
pub fn create_buffers(page: &Arc<Page>, size: u32, retry: bool) -> Option<Vec<Arc<BufferHead>>> {
    if size == 0 || size as usize > PAGE_SIZE {
        return None;
    }
    let mut attempts = 0;
    loop {
        let mut ring = Vec::with_capacity(PAGE_SIZE / size as usize);
        let mut offset = 0;
        while offset + size as usize <= PAGE_SIZE {
            match BufferHead::alloc(page, offset, size) {
                Some(bh) => ring.push(bh),
                None => break,
            }
            offset += size as usize;
        }
        if offset + size as usize > PAGE_SIZE {
            return Some(ring);
        }

        // partial ring is released here
        drop(ring);
        if !retry || attempts == FREE_MORE_MEMORY_RETRIES {
            return None;
        }
        attempts += 1;
        debug!("create_buffers: out of buffer heads, retry {}", attempts);
        free_more_memory();
    }
}

// Attaches a fresh ring to `page`, inheriting the page's dirty and uptodate
// state. Must-not-fail callers get NoMemory only after the retry loop gives up.
pub fn create_empty_buffers(page: &Arc<Page>, blocksize: u32, state: BhState) -> BlkResult<()> {
    let ring = create_buffers(page, blocksize, true).ok_or(BlkError::NoMemory)?;
    for bh in &ring {
        bh.set(state);
    }

    let mapping = page.mapping();
    let _guard = mapping.as_ref().map(|m| m.private_lock.lock().unwrap());
    if page.is_uptodate() || page.is_dirty() {
        for bh in &ring {
            if page.is_dirty() {
                bh.set(BhState::DIRTY);
            }
            if page.is_uptodate() {
                bh.set(BhState::UPTODATE);
            }
        }
    }
    page.attach_buffers(ring);
    Ok(())
}

// Stamps the unmapped buffers of a block-device page with consecutive block
// numbers starting at `block`.
fn init_page_buffers(page: &Page, bdev: &Arc<BlockDevice>, mut block: u64) {
    let uptodate = page.is_uptodate();
    for bh in page.buffers().unwrap_or_default() {
        if !bh.is_mapped() {
            bh.set_end_io(None);
            bh.map_bh(bdev, block);
            if uptodate {
                bh.set(BhState::UPTODATE);
            }
        }
        block += 1;
    }
}

// Finds or creates the block-device page holding `index` and gives it buffers
// of `size`. The page is returned locked.
pub(crate) fn grow_dev_page(bdev: &Arc<BlockDevice>, block: u64, index: u64, size: u32) -> Option<Arc<Page>> {
    let mapping = bdev.mapping();
    let page = mapping.find_or_create_page(index);

    if let Some(ring) = page.buffers() {
        if ring.first().map(|bh| bh.size()) == Some(size) {
            init_page_buffers(&page, bdev, block);
            return Some(page);
        }
        if !try_to_free_buffers(&page) {
            page.unlock_page();
            return None;
        }
    }

    let Some(ring) = create_buffers(&page, size, false) else {
        page.unlock_page();
        return None;
    };

    {
        let _guard = mapping.private_lock.lock().unwrap();
        page.attach_buffers(ring);
        init_page_buffers(&page, bdev, block);
    }
    Some(page)
}

pub(crate) fn valid_block_size(bdev: &BlockDevice, size: u32) -> bool {
    size.is_power_of_two()
        && size >= 512
        && size as usize <= PAGE_SIZE
        && size % bdev.hardsect_size() == 0
}

// Makes sure the page covering `block` exists with buffers of `size`.
pub fn grow_buffers(bdev: &Arc<BlockDevice>, block: u64, size: u32) -> bool {
    if !valid_block_size(bdev, size) {
        debug!("grow_buffers: invalid block size {} on {}", size, bdev.name());
        return false;
    }
    let sizebits = PAGE_SHIFT as u32 - size.trailing_zeros();
    let index = block >> sizebits;
    let first = index << sizebits;

    match grow_dev_page(bdev, first, index, size) {
        Some(page) => {
            page.unlock_page();
            true
        }
        None => false,
    }
}

pub(crate) fn discard_buffer(bh: &BufferHead) {
    bh.lock_buffer();
    bh.clear(BhState::DIRTY);
    bh.set_bdev(None);
    bh.clear(BhState::MAPPED | BhState::REQ | BhState::NEW | BhState::DELAY);
    bh.unlock_buffer();
}

// Detaches the ring if no buffer is busy. A latched write error is carried to
// the page's mapping first.
fn drop_buffers(page: &Page) -> Option<Vec<Arc<BufferHead>>> {
    let ring = page.buffers()?;

    for bh in &ring {
        if bh.test(BhState::WRITE_EIO) {
            if let Some(mapping) = page.mapping() {
                mapping.set_error(BlkError::Io);
            }
        }
    }
    if ring.iter().any(|bh| bh.is_busy()) {
        return None;
    }

    for bh in &ring {
        if bh.is_listed() {
            remove_assoc_queue(bh);
        }
    }
    page.detach_buffers()
}

// Frees the buffers of a locked page. Refuses without blocking if the page is
// under writeback or any buffer is busy.
pub fn try_to_free_buffers(page: &Page) -> bool {
    assert!(page.is_locked(), "freeing buffers of unlocked page {}", page.pfn());
    if page.is_writeback() {
        return false;
    }

    let freed = match page.mapping() {
        None => drop_buffers(page),
        Some(mapping) => {
            let _guard = mapping.private_lock.lock().unwrap();
            let freed = drop_buffers(page);
            if freed.is_some() {
                page.clear_page_dirty_for_io();
            }
            freed
        }
    };

    // ring is dropped outside the lock
    freed.is_some()
}

pub fn try_to_release_page(page: &Page) -> bool {
    assert!(page.is_locked(), "releasing unlocked page {}", page.pfn());
    if page.is_writeback() {
        return false;
    }
    if !page.has_buffers() {
        return true;
    }
    try_to_free_buffers(page)
}

// Discards every buffer at or past byte `offset`. With offset 0 the buffers are
// released too, and the return value says whether that worked.
pub fn block_invalidatepage(page: &Page, offset: usize) -> bool {
    assert!(page.is_locked(), "invalidating unlocked page {}", page.pfn());
    let Some(ring) = page.buffers() else {
        return true;
    };

    let mut curr_off = 0;
    for bh in &ring {
        if offset <= curr_off {
            discard_buffer(bh);
        }
        curr_off += bh.size() as usize;
    }

    if offset == 0 {
        return try_to_release_page(page);
    }
    true
}
