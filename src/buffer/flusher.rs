use std::sync::Arc;

use anyhow::Context;
use log::{debug, trace};

use crate::{
    error::{BlkError, BlkResult},
    storage::{
        disk::{bio::RwMode, device::BlockDevice},
        mapping::{AddressSpace, Inode, InodeState},
        page::{Page, PageFlags},
    },
};

use super::{
    buffer_cache::{find_get_block, ll_rw_block, writepage},
    buffer_head::{remove_assoc_queue, BhState, BufferHead},
};

// Dirties a metadata buffer and ties it to `inode`, so an fsync of the inode
// writes it out.
pub fn mark_buffer_dirty_inode(bh: &Arc<BufferHead>, inode: &Inode) {
    let mapping = inode.mapping();
    bh.mark_buffer_dirty();

    if let Some(buffer_mapping) = bh.page().and_then(|page| page.mapping()) {
        match mapping.assoc_mapping() {
            None => mapping.set_assoc_mapping(&buffer_mapping),
            Some(existing) => assert!(
                Arc::ptr_eq(&existing, &buffer_mapping),
                "inode {} has buffers from two devices",
                inode.ino()
            ),
        }
    }

    // moving between inodes
    if let Some(current) = bh.assoc_mapping() {
        if Arc::ptr_eq(&current, mapping) {
            return;
        }
        remove_assoc_queue(bh);
    }

    let mut list = mapping.assoc_list();
    if !bh.is_listed() {
        list.insert(bh.id(), Arc::clone(bh));
        bh.set_assoc(Some(mapping));
    }
}

// Writes out and waits on every buffer associated with `mapping`.
//
// Buffers are first taken off the list, writing the dirty ones. Then each is
// waited on. A buffer re-dirtied meanwhile goes back on the list and is only
// waited on, not rewritten, by the final pass.
pub fn fsync_buffers_list(mapping: &AddressSpace) -> BlkResult<()> {
    let mut in_flight = Vec::new();

    loop {
        let next = mapping.assoc_list().pop_front();
        let Some((_, bh)) = next else {
            break;
        };
        bh.set_assoc(None);

        if bh.is_dirty() || bh.is_locked() {
            if bh.is_dirty() {
                bh.get();
                ll_rw_block(RwMode::Write, &[&bh]);
                bh.put();
            }
            in_flight.push(bh);
        }
    }
    trace!("fsync_buffers_list: {} buffers in flight", in_flight.len());

    let mut err = Ok(());
    for bh in in_flight {
        bh.get();
        bh.wait_on_buffer();
        if !bh.is_uptodate() && err.is_ok() {
            err = Err(BlkError::Io);
        }
        bh.put();
    }

    let err2 = osync_buffers_list(mapping);
    err.and(err2)
}

// Waits for associated buffers that are already under I/O. Nothing new is
// started.
pub fn osync_buffers_list(mapping: &AddressSpace) -> BlkResult<()> {
    let mut err = Ok(());
    loop {
        let locked = mapping
            .assoc_list()
            .values()
            .rev()
            .find(|bh| bh.is_locked())
            .cloned();
        let Some(bh) = locked else {
            break;
        };

        bh.get();
        bh.wait_on_buffer();
        if !bh.is_uptodate() && err.is_ok() {
            err = Err(BlkError::Io);
        }
        bh.put();
    }
    err
}

pub fn sync_mapping_buffers(mapping: &AddressSpace) -> BlkResult<()> {
    if mapping.assoc_mapping().is_none() || !mapping.has_assoc_buffers() {
        return Ok(());
    }
    fsync_buffers_list(mapping)
}

// Forgets the inode's associated buffers without writing them.
pub fn invalidate_inode_buffers(inode: &Inode) {
    let mapping = inode.mapping();
    if !mapping.has_assoc_buffers() {
        return;
    }

    let mut list = mapping.assoc_list();
    while let Some((_, bh)) = list.pop_front() {
        if bh.test(BhState::WRITE_EIO) {
            mapping.set_error(BlkError::Io);
        }
        bh.set_assoc(None);
    }
}

// Detaches clean associated buffers. False if a dirty one was left behind.
pub fn remove_inode_buffers(inode: &Inode) -> bool {
    let mapping = inode.mapping();
    if !mapping.has_assoc_buffers() {
        return true;
    }

    let mut list = mapping.assoc_list();
    while let Some((_, bh)) = list.front() {
        if bh.is_dirty() {
            return false;
        }
        let bh = Arc::clone(bh);
        list.pop_front();
        if bh.test(BhState::WRITE_EIO) {
            mapping.set_error(BlkError::Io);
        }
        bh.set_assoc(None);
    }
    true
}

// Starts writing the block after a boundary block so it can go out with the
// I/O that just ended there.
pub fn write_boundary_block(bdev: &Arc<BlockDevice>, bblock: u64, blocksize: u32) {
    if let Some(bh) = find_get_block(bdev, bblock + 1, blocksize) {
        if bh.is_dirty() {
            ll_rw_block(RwMode::Write, &[&*bh]);
        }
    }
}

// Dirties a page along with all of its buffers.
pub fn set_page_dirty_buffers(page: &Page) -> bool {
    let mapping = page.mapping();
    {
        let _guard = mapping.as_ref().map(|m| m.private_lock.lock().unwrap());
        for bh in page.buffers().unwrap_or_default() {
            bh.set(BhState::DIRTY);
        }
    }
    page.set_page_dirty_nobuffers()
}

// Starts writeback of every dirty page in `mapping`. Returns the first error.
pub fn filemap_fdatawrite(mapping: &AddressSpace) -> BlkResult<()> {
    let mut result = Ok(());
    let mut written = 0;

    for index in mapping.dirty_indices() {
        let Some(page) = mapping.find_get_page(index) else {
            mapping.clear_dirty_tag(index);
            continue;
        };

        page.lock_page();
        let still_ours = page
            .mapping()
            .map_or(false, |m| std::ptr::eq(Arc::as_ptr(&m), mapping as *const _));
        if !still_ours {
            page.unlock_page();
            continue;
        }

        page.wait_on_page_writeback();
        if !page.clear_page_dirty_for_io() {
            page.unlock_page();
            continue;
        }

        if let Err(err) = writepage(mapping, &page) {
            if result.is_ok() {
                result = Err(err);
            }
        }
        written += 1;
    }

    debug!("filemap_fdatawrite: {} pages", written);
    result
}

// Waits for writeback on every page and reports errors latched since the last
// call.
pub fn filemap_fdatawait(mapping: &AddressSpace) -> BlkResult<()> {
    let mut result = Ok(());
    for page in mapping.pages() {
        page.wait_on_page_writeback();
        if page.test_and_clear_flag(PageFlags::ERROR) {
            result = Err(BlkError::Io);
        }
    }

    match mapping.check_errors() {
        Err(err) => Err(err),
        Ok(()) => result,
    }
}

// Writes every dirty page of the device's cache and waits for it.
pub fn sync_blockdev(bdev: &BlockDevice) -> BlkResult<()> {
    let mapping = bdev.mapping();
    let ret = filemap_fdatawrite(mapping);
    let err = filemap_fdatawait(mapping);
    ret.and(err)
}

// Makes an inode durable: data pages, associated metadata buffers, and the
// inode itself through `write_inode`. With `datasync` a timestamp-only dirty
// inode is not written.
pub fn sync_file<F>(inode: &Inode, datasync: bool, write_inode: F) -> anyhow::Result<()>
where
    F: FnOnce(&Inode) -> BlkResult<()>,
{
    let mapping = inode.mapping();

    let write = filemap_fdatawrite(mapping);
    let meta = sync_mapping_buffers(mapping);

    let wanted = if datasync {
        InodeState::DIRTY_DATASYNC
    } else {
        InodeState::DIRTY_SYNC | InodeState::DIRTY_DATASYNC
    };
    let inode_write = if inode.state().intersects(wanted) {
        let ret = write_inode(inode);
        if ret.is_ok() {
            inode.clear_inode_dirty(InodeState::DIRTY_SYNC | InodeState::DIRTY_DATASYNC);
        }
        ret
    } else {
        Ok(())
    };

    let wait = filemap_fdatawait(mapping);
    if mapping.nr_dirty() == 0 {
        inode.clear_inode_dirty(InodeState::DIRTY_PAGES);
    }

    write.with_context(|| format!("writing data pages of inode {}", inode.ino()))?;
    meta.with_context(|| format!("syncing metadata buffers of inode {}", inode.ino()))?;
    inode_write.with_context(|| format!("writing inode {}", inode.ino()))?;
    wait.with_context(|| format!("waiting on writeback of inode {}", inode.ino()))?;
    Ok(())
}
