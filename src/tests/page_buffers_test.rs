#[cfg(test)]
pub mod test {
    use crate::{
        buffer::{
            buffer_cache::{find_get_block, getblk, invalidate_bdev, readpage, writepage},
            buffer_head::BhState,
            flusher::{filemap_fdatawait, filemap_fdatawrite, set_page_dirty_buffers},
        },
        config::{buffer_constants::PAGE_SIZE, QueueConfig},
        error::BlkError,
        storage::{disk::ramdisk::RamDiskMode, page::PageFlags},
        tests::{dirty_file_page, linear_file, ram_disk, serial},
    };

    #[test]
    fn read_full_page_zero_fills_holes() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        disk.write_sectors(200, &[0xa0; 1024]);
        disk.write_sectors(202, &[0xa1; 1024]);
        disk.write_sectors(204, &[0xa2; 1024]);
        disk.write_sectors(206, &[0xa3; 1024]);
        let inode = linear_file(&bdev, 8192, 100, 16, &[1]);

        let page = inode.mapping().find_or_create_page(0);
        page.copy_from(0, &[0xff; PAGE_SIZE]);
        readpage(inode.mapping(), &page).unwrap();
        page.wait_on_page_locked();

        assert!(page.is_uptodate());
        assert!(!page.test_flag(PageFlags::MAPPED_TO_DISK));
        let mut data = vec![0u8; PAGE_SIZE];
        page.copy_to(0, &mut data);
        assert_eq!(&data[..1024], &[0xa0u8; 1024][..]);
        assert_eq!(&data[1024..2048], &[0u8; 1024][..]);
        assert_eq!(&data[2048..3072], &[0xa2u8; 1024][..]);
        assert_eq!(&data[3072..], &[0xa3u8; 1024][..]);

        let ring = page.buffers().unwrap();
        assert!(!ring[1].is_mapped());
        assert!(ring.iter().all(|bh| bh.is_uptodate()));
    }

    #[test]
    fn page_beyond_eof_reads_as_zeros() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        let inode = linear_file(&bdev, 4096, 100, 16, &[]);

        let page = inode.mapping().find_or_create_page(1);
        page.copy_from(0, &[0xff; PAGE_SIZE]);
        readpage(inode.mapping(), &page).unwrap();

        // nothing to read, so the page is done on return
        assert!(!page.is_locked());
        assert!(page.is_uptodate());
        assert_eq!(disk.served(), 0);
        page.read_data(|data| assert!(data.iter().all(|&b| b == 0)));
    }

    #[test]
    fn writeback_maps_holes_and_trims_tail() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        disk.write_sectors(210, &[0x77; 1024]);
        let inode = linear_file(&bdev, 4096 + 1000, 100, 16, &[4]);

        dirty_file_page(&inode, 0, 0xc0);
        let tail = dirty_file_page(&inode, 1, 0xc1);
        assert_eq!(inode.mapping().nr_dirty(), 2);

        filemap_fdatawrite(inode.mapping()).unwrap();
        filemap_fdatawait(inode.mapping()).unwrap();
        assert_eq!(inode.mapping().nr_dirty(), 0);

        let mut out = vec![0u8; PAGE_SIZE];
        disk.read_sectors(200, &mut out);
        assert_eq!(out, vec![0xc0; PAGE_SIZE]);

        let mut out = vec![0u8; 1024];
        disk.read_sectors(208, &mut out);
        assert_eq!(&out[..1000], &[0xc1u8; 1000][..]);
        assert!(out[1000..].iter().all(|&b| b == 0));

        // blocks wholly past the end are never written
        disk.read_sectors(210, &mut out);
        assert_eq!(out, vec![0x77; 1024]);

        let ring = tail.buffers().unwrap();
        assert!(ring[0].is_mapped());
        assert_eq!(ring[0].blocknr(), 104);
        assert!(!ring[0].is_new());
        assert!(ring.iter().all(|bh| !bh.is_dirty()));
    }

    #[test]
    fn page_past_eof_is_dropped_not_written() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        let inode = linear_file(&bdev, 4096, 100, 16, &[]);

        let page = inode.mapping().find_or_create_page(2);
        page.copy_from(0, &[0xee; PAGE_SIZE]);
        writepage(inode.mapping(), &page).unwrap();

        assert!(!page.is_locked());
        assert!(!page.is_writeback());
        assert!(!page.has_buffers());
        assert_eq!(disk.served(), 0);
    }

    #[test]
    fn failed_allocation_still_writes_mapped_blocks() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        let inode = linear_file(&bdev, 4096, 100, 2, &[]);

        let page = inode.mapping().find_or_create_page(0);
        page.copy_from(0, &[0x5e; PAGE_SIZE]);
        assert_eq!(writepage(inode.mapping(), &page), Err(BlkError::NoSpace));
        page.wait_on_page_writeback();

        assert!(page.test_flag(PageFlags::ERROR));
        let ring = page.buffers().unwrap();
        assert!(ring.iter().all(|bh| !bh.is_dirty()));
        assert!(!ring[2].is_mapped() && !ring[3].is_mapped());

        let mut out = vec![0u8; 2048];
        disk.read_sectors(200, &mut out);
        assert_eq!(out, vec![0x5e; 2048]);
        disk.read_sectors(204, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn dirtying_page_dirties_every_buffer() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        let bh = getblk(&bdev, 0, 1024).unwrap();
        let page = bh.page().unwrap();
        assert!(set_page_dirty_buffers(&page));
        assert!(!set_page_dirty_buffers(&page));

        assert!(page.buffers().unwrap().iter().all(|bh| bh.is_dirty()));
        assert_eq!(bdev.mapping().dirty_indices(), vec![0]);
    }

    #[test]
    fn invalidate_bdev_spares_dirty_pages() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        {
            let clean = getblk(&bdev, 0, 1024).unwrap();
            clean.set(BhState::UPTODATE);
            let dirty = getblk(&bdev, 4, 1024).unwrap();
            dirty.set(BhState::UPTODATE);
            dirty.mark_buffer_dirty();
        }
        assert_eq!(bdev.mapping().nr_pages(), 2);

        invalidate_bdev(&bdev, false);
        assert_eq!(bdev.mapping().nr_pages(), 1);
        assert!(find_get_block(&bdev, 0, 1024).is_none());
        assert!(find_get_block(&bdev, 4, 1024).unwrap().is_dirty());

        invalidate_bdev(&bdev, true);
        assert_eq!(bdev.mapping().nr_pages(), 0);
        assert_eq!(bdev.mapping().nr_dirty(), 0);
    }

    #[test]
    fn busy_buffer_pins_its_page() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        let held = getblk(&bdev, 0, 1024).unwrap();
        invalidate_bdev(&bdev, true);
        assert_eq!(bdev.mapping().nr_pages(), 1);
        // its buffers were discarded all the same
        assert!(!held.is_mapped());

        drop(held);
        invalidate_bdev(&bdev, true);
        assert_eq!(bdev.mapping().nr_pages(), 0);
    }
}
