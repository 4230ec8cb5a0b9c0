#[cfg(test)]
pub mod test {
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    };

    use crate::{
        config::{buffer_constants::PAGE_SIZE, PlugConfig, QueueConfig},
        error::BlkError,
        storage::{
            disk::{
                bio::{Bio, BioFlags, Direction},
                device::{generic_make_request, submit_bio},
                ramdisk::RamDiskMode,
                scheduler::{nr_plugged, run_queues, KBLOCKD},
            },
            page::{Page, Zone},
        },
        tests::{manual_unplug_config, page_bio, ram_disk, serial, statuses},
    };

    #[test]
    fn plugged_queue_defers_dispatch_until_unplug() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();

        for sector in [0, 100, 200] {
            submit_bio(Direction::Write, page_bio(&bdev, sector, Direction::Write, 1, &done));
        }

        assert!(bdev.queue().with_state(|q| q.is_plugged()));
        assert_eq!(disk.dispatch_calls(), 0);
        assert!(done.lock().unwrap().is_empty());

        bdev.queue().unplug();

        assert_eq!(*done.lock().unwrap(), vec![Ok(()); 3]);
        assert_eq!(disk.served(), 3);
        assert!(!bdev.queue().with_state(|q| q.is_plugged()));
    }

    #[test]
    fn sorted_dispatch_order() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();

        for sector in [300, 16, 200, 64] {
            submit_bio(Direction::Read, page_bio(&bdev, sector, Direction::Read, 1, &done));
        }
        bdev.queue().unplug();

        let sectors: Vec<u64> = disk.io_log().iter().map(|&(_, sector, _)| sector).collect();
        assert_eq!(sectors, vec![16, 64, 200, 300]);
    }

    #[test]
    fn unplug_threshold_forces_dispatch() {
        let _serial = serial();
        let config = QueueConfig {
            plug: PlugConfig {
                unplug_thresh: 4,
                unplug_delay: Duration::from_secs(3600),
            },
            ..Default::default()
        };
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, config);
        let done = statuses();

        for sector in [0, 64, 128] {
            submit_bio(Direction::Write, page_bio(&bdev, sector, Direction::Write, 1, &done));
        }
        assert_eq!(disk.served(), 0);

        submit_bio(Direction::Write, page_bio(&bdev, 192, Direction::Write, 1, &done));
        assert_eq!(disk.served(), 4);
        assert_eq!(disk.dispatch_calls(), 1);
        assert_eq!(done.lock().unwrap().len(), 4);
    }

    #[test]
    fn plug_timer_unplugs_idle_queue() {
        let _serial = serial();
        let config = QueueConfig {
            plug: PlugConfig {
                unplug_thresh: usize::MAX,
                unplug_delay: Duration::from_millis(5),
            },
            ..Default::default()
        };
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, config);
        let done = statuses();

        submit_bio(Direction::Read, page_bio(&bdev, 8, Direction::Read, 1, &done));

        let deadline = Instant::now() + Duration::from_secs(5);
        while done.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(*done.lock().unwrap(), vec![Ok(())]);
        assert_eq!(disk.served(), 1);
    }

    #[test]
    fn run_queues_unplugs_every_queue() {
        let _serial = serial();
        let (disk_a, bdev_a) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let (disk_b, bdev_b) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();

        submit_bio(Direction::Write, page_bio(&bdev_a, 0, Direction::Write, 1, &done));
        submit_bio(Direction::Write, page_bio(&bdev_b, 0, Direction::Write, 1, &done));
        assert!(nr_plugged() >= 2);

        run_queues();

        assert_eq!(disk_a.served(), 1);
        assert_eq!(disk_b.served(), 1);
        assert_eq!(done.lock().unwrap().len(), 2);
    }

    #[test]
    fn stopped_queue_waits_for_restart() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();
        let queue = bdev.queue();

        queue.stop_queue();
        submit_bio(Direction::Write, page_bio(&bdev, 0, Direction::Write, 1, &done));

        assert!(!queue.with_state(|q| q.is_plugged()));
        queue.unplug();
        run_queues();
        assert_eq!(disk.dispatch_calls(), 0);

        queue.start_queue();
        KBLOCKD.flush();

        assert_eq!(disk.served(), 1);
        assert_eq!(*done.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn bio_beyond_end_of_device_fails() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(64, RamDiskMode::Immediate, manual_unplug_config());
        let flags = Arc::new(Mutex::new(None));

        let seen = Arc::clone(&flags);
        let bio = page_bio(&bdev, 60, Direction::Read, 1, &statuses())
            .with_end_io(move |bio| *seen.lock().unwrap() = Some((bio.status(), bio.flags())));
        generic_make_request(bio);

        let (status, bio_flags) = flags.lock().unwrap().take().unwrap();
        assert_eq!(status, Err(BlkError::BeyondEnd));
        assert!(bio_flags.contains(BioFlags::EOF));
        assert!(!bio_flags.contains(BioFlags::UPTODATE));
        assert_eq!(disk.dispatch_calls(), 0);
    }

    #[test]
    fn oversized_bio_is_rejected() {
        let _serial = serial();
        let mut config = manual_unplug_config();
        config.limits.set_max_sectors(8);
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, config);
        let done = statuses();

        submit_bio(Direction::Write, page_bio(&bdev, 0, Direction::Write, 2, &done));
        assert_eq!(*done.lock().unwrap(), vec![Err(BlkError::TooBig)]);
    }

    #[test]
    fn dead_queue_rejects_io() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let queue = bdev.queue();

        // creator's reference, then the device's
        queue.cleanup_queue();
        assert!(!queue.is_dead());
        queue.cleanup_queue();
        assert!(queue.is_dead());
        assert_eq!(queue.get_queue(), Err(BlkError::DeadQueue));

        let done = statuses();
        submit_bio(Direction::Read, page_bio(&bdev, 0, Direction::Read, 1, &done));
        assert_eq!(*done.lock().unwrap(), vec![Err(BlkError::DeadQueue)]);
    }

    #[test]
    fn partial_completion_keeps_bio_open() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Hold, manual_unplug_config());
        let done = statuses();
        let queue = bdev.queue();

        submit_bio(Direction::Write, page_bio(&bdev, 32, Direction::Write, 2, &done));
        queue.unplug();
        let id = disk.take_held().unwrap();

        let more = queue.with_state(|q| q.end_that_request_first(id, true, 8));
        assert!(more);
        assert!(done.lock().unwrap().is_empty());
        queue.with_state(|q| {
            let req = q.request(id);
            assert_eq!(req.hard_sector, 40);
            assert_eq!(req.hard_nr_sectors, 8);
            assert_eq!(req.nr_sectors, 8);
            assert_eq!(req.current_nr_sectors, 8);
        });

        let more = queue.with_state(|q| q.end_that_request_first(id, true, 8));
        assert!(!more);
        queue.with_state(|q| q.end_that_request_last(id));

        assert_eq!(*done.lock().unwrap(), vec![Ok(())]);
        assert_eq!(queue.with_state(|q| q.count(Direction::Write)), 0);
        assert_eq!(bdev.stats().ios(Direction::Write), 1);
    }

    #[test]
    fn end_request_walks_segments() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Hold, manual_unplug_config());
        let done = statuses();
        let queue = bdev.queue();

        submit_bio(Direction::Read, page_bio(&bdev, 0, Direction::Read, 3, &done));
        queue.unplug();
        let id = disk.take_held().unwrap();

        queue.with_state(|q| {
            q.end_request(id, true);
            q.end_request(id, true);
            assert_eq!(q.request(id).hard_nr_sectors, 8);
        });
        assert!(done.lock().unwrap().is_empty());

        queue.with_state(|q| q.end_request(id, true));
        assert_eq!(*done.lock().unwrap(), vec![Ok(())]);
        assert!(queue.with_state(|q| q.try_request(id).is_none()));
    }

    #[test]
    fn failed_transfer_fails_bio() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();
        disk.fail_sector(12);

        submit_bio(Direction::Read, page_bio(&bdev, 8, Direction::Read, 1, &done));
        bdev.queue().unplug();

        assert_eq!(*done.lock().unwrap(), vec![Err(BlkError::Io)]);
    }

    #[test]
    fn chunked_completion_finishes_request() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();
        disk.set_completion_chunk(2);

        submit_bio(Direction::Write, page_bio(&bdev, 0, Direction::Write, 2, &done));
        bdev.queue().unplug();

        assert_eq!(*done.lock().unwrap(), vec![Ok(())]);
        assert_eq!(disk.io_log(), vec![(Direction::Write, 0, 16)]);
    }

    #[test]
    fn readahead_gives_up_on_full_pool() {
        let _serial = serial();
        let mut config = manual_unplug_config();
        config.nr_requests = 4;
        config.batch.batch_requests = 1;
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Hold, config);
        let queue = bdev.queue();

        let mut held = Vec::new();
        while let Some(id) = queue.get_request(Direction::Read, false) {
            held.push(id);
        }
        assert_eq!(held.len(), 4);

        let done = statuses();
        let mut bio = page_bio(&bdev, 0, Direction::Read, 1, &done);
        bio.set_flags(BioFlags::AHEAD);
        submit_bio(Direction::Read, bio);
        assert_eq!(*done.lock().unwrap(), vec![Err(BlkError::WouldBlock)]);

        for id in held {
            queue.put_request(id);
        }
        assert_eq!(queue.with_state(|q| q.count(Direction::Read)), 0);
        assert!(!queue.with_state(|q| q.is_full(Direction::Read)));
    }

    #[test]
    fn high_pages_are_bounced() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Immediate, manual_unplug_config());
        let done = statuses();

        let high = Page::alloc(Zone::High);
        high.copy_from(0, &[0xab; PAGE_SIZE]);
        let mut bio = Bio::new(Arc::clone(&bdev), 0, Direction::Write);
        bio.add_page(Arc::clone(&high), PAGE_SIZE, 0);
        let seen = Arc::clone(&done);
        submit_bio(
            Direction::Write,
            bio.with_end_io(move |bio| seen.lock().unwrap().push(bio.status())),
        );

        disk.write_sectors(16, &[0x5a; PAGE_SIZE]);
        let target = Page::alloc(Zone::High);
        let mut bio = Bio::new(Arc::clone(&bdev), 16, Direction::Read);
        bio.add_page(Arc::clone(&target), PAGE_SIZE, 0);
        let seen = Arc::clone(&done);
        submit_bio(
            Direction::Read,
            bio.with_end_io(move |bio| seen.lock().unwrap().push(bio.status())),
        );

        bdev.queue().unplug();
        assert_eq!(*done.lock().unwrap(), vec![Ok(()); 2]);

        let mut on_disk = vec![0u8; PAGE_SIZE];
        disk.read_sectors(0, &mut on_disk);
        assert!(on_disk.iter().all(|&b| b == 0xab));

        let mut read_back = vec![0u8; PAGE_SIZE];
        target.copy_to(0, &mut read_back);
        assert!(read_back.iter().all(|&b| b == 0x5a));
    }
}
