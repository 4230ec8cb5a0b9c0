#[cfg(test)]
pub mod test {
    use std::sync::Arc;

    use crate::{
        buffer::{
            buffer_cache::{
                bread, breadahead, find_get_block, find_get_block_slow, getblk, ll_rw_block, sync_dirty_buffer,
            },
            buffer_head::{BhState, BufferHead},
        },
        config::QueueConfig,
        error::BlkError,
        storage::disk::{bio::RwMode, ramdisk::RamDiskMode},
        tests::{ram_disk, serial},
    };

    fn buffer_data(bh: &BufferHead) -> Vec<u8> {
        let mut out = vec![0u8; bh.size() as usize];
        bh.page().unwrap().copy_to(bh.offset(), &mut out);
        out
    }

    fn fill(bh: &BufferHead, byte: u8) {
        let data = vec![byte; bh.size() as usize];
        bh.page().unwrap().copy_from(bh.offset(), &data);
        bh.set(BhState::UPTODATE);
        bh.mark_buffer_dirty();
    }

    #[test]
    fn bread_returns_disk_contents() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        disk.write_sectors(4, &[7u8; 1024]);

        let bh = bread(&bdev, 2, 1024).unwrap();
        assert!(bh.is_uptodate());
        assert!(!bh.is_locked());
        assert_eq!(bh.blocknr(), 2);
        assert_eq!(bh.offset(), 2048);
        assert_eq!(buffer_data(&bh), vec![7u8; 1024]);

        // the second lookup is served from the cache
        let served = disk.served();
        let again = bread(&bdev, 2, 1024).unwrap();
        assert!(Arc::ptr_eq(&*bh, &*again));
        assert_eq!(disk.served(), served);
    }

    #[test]
    fn neighbouring_blocks_share_a_page() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        let first = getblk(&bdev, 8, 1024).unwrap();
        let second = getblk(&bdev, 11, 1024).unwrap();
        assert!(Arc::ptr_eq(&first.page().unwrap(), &second.page().unwrap()));
        assert_eq!(bdev.mapping().nr_pages(), 1);
        assert!(first.is_mapped() && !first.is_uptodate());

        let ring = first.page().unwrap().buffers().unwrap();
        let blocks: Vec<u64> = ring.iter().map(|bh| bh.blocknr()).collect();
        assert_eq!(blocks, vec![8, 9, 10, 11]);
    }

    #[test]
    fn failed_read_reports_error() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        disk.fail_sector(10);

        assert_eq!(bread(&bdev, 5, 1024).unwrap_err(), BlkError::Io);
        let bh = find_get_block(&bdev, 5, 1024).unwrap();
        assert!(!bh.is_uptodate());
        assert!(bh.test(BhState::IO_ERROR));
        drop(bh);

        disk.heal_sector(10);
        let bh = bread(&bdev, 5, 1024).unwrap();
        assert!(!bh.test(BhState::IO_ERROR));
    }

    #[test]
    fn sync_dirty_buffer_reaches_disk() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        let bh = getblk(&bdev, 9, 1024).unwrap();
        fill(&bh, 0x3c);
        assert!(bh.is_dirty());
        assert!(bh.page().unwrap().is_dirty());
        assert_eq!(bdev.mapping().nr_dirty(), 1);

        sync_dirty_buffer(&bh).unwrap();
        assert!(!bh.is_dirty());
        let mut out = vec![0u8; 1024];
        disk.read_sectors(18, &mut out);
        assert_eq!(out, vec![0x3c; 1024]);

        // clean buffers are left alone
        let served = disk.served();
        sync_dirty_buffer(&bh).unwrap();
        assert_eq!(disk.served(), served);
    }

    #[test]
    fn ll_rw_block_writes_only_dirty_buffers() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        let a = getblk(&bdev, 40, 1024).unwrap();
        let b = getblk(&bdev, 41, 1024).unwrap();
        let c = getblk(&bdev, 60, 1024).unwrap();
        fill(&a, 1);
        fill(&b, 2);
        c.set(BhState::UPTODATE);

        ll_rw_block(RwMode::Write, &[&*a, &*b, &*c]);
        for bh in [&a, &b, &c] {
            bh.wait_on_buffer();
            assert!(!bh.is_dirty());
        }

        let written: u32 = disk.io_log().iter().map(|&(_, _, nr)| nr).sum();
        assert_eq!(written, 4);
        let mut out = vec![0u8; 2048];
        disk.read_sectors(80, &mut out);
        assert_eq!(&out[..1024], &[1u8; 1024][..]);
        assert_eq!(&out[1024..], &[2u8; 1024][..]);
    }

    #[test]
    fn readahead_fills_buffer_in_background() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        disk.write_sectors(40, &[0x99; 1024]);

        breadahead(&bdev, 20, 1024).unwrap();
        let bh = find_get_block(&bdev, 20, 1024).unwrap();
        bh.wait_on_buffer();
        assert!(bh.is_uptodate());
        assert_eq!(buffer_data(&bh), vec![0x99; 1024]);
    }

    #[test]
    fn invalid_block_size_is_rejected() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        for size in [0, 256, 1000, 8192] {
            assert_eq!(getblk(&bdev, 0, size).unwrap_err(), BlkError::InvalidArgument);
        }
        assert_eq!(bdev.set_blocksize(3000), Err(BlkError::InvalidArgument));
        assert_eq!(bdev.set_blocksize(256), Err(BlkError::InvalidArgument));
        assert_eq!(bdev.block_size(), 1024);
    }

    #[test]
    fn changing_block_size_flushes_and_drops_cache() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());

        {
            let low = getblk(&bdev, 2, 1024).unwrap();
            let high = getblk(&bdev, 3, 1024).unwrap();
            fill(&low, 0x11);
            fill(&high, 0x22);
        }
        assert_eq!(bdev.mapping().nr_dirty(), 1);

        bdev.set_blocksize(2048).unwrap();
        assert_eq!(bdev.block_size(), 2048);
        assert_eq!(bdev.mapping().nr_pages(), 0);
        assert_eq!(bdev.mapping().nr_dirty(), 0);

        let bh = bread(&bdev, 1, 2048).unwrap();
        let data = buffer_data(&bh);
        assert_eq!(&data[..1024], &[0x11u8; 1024][..]);
        assert_eq!(&data[1024..], &[0x22u8; 1024][..]);
    }

    #[test]
    fn lookup_with_unusable_size_misses() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, QueueConfig::default());
        let cached = getblk(&bdev, 0, 1024).unwrap();

        for size in [0, 1000, 8192] {
            assert!(find_get_block(&bdev, 0, size).is_none());
            assert!(find_get_block_slow(&bdev, 0, size).is_none());
        }
        assert!(Arc::ptr_eq(&*find_get_block(&bdev, 0, 1024).unwrap(), &*cached));
    }
}
