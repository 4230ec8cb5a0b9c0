#[cfg(test)]
pub mod test {
    use std::collections::HashSet;

    use crate::{
        config::QueueConfig,
        error::BlkError,
        storage::disk::{
            bio::Direction, device::submit_bio, ramdisk::RamDiskMode, request::RequestFlags,
        },
        tests::{manual_unplug_config, page_bio, ram_disk, serial, statuses},
    };

    fn tagged_config(nr_requests: usize) -> QueueConfig {
        QueueConfig {
            nr_requests,
            ..manual_unplug_config()
        }
    }

    #[test]
    fn each_started_request_gets_a_distinct_tag() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Tagged, tagged_config(8));
        let queue = bdev.queue();
        let done = statuses();

        for sector in [0, 100, 200] {
            submit_bio(Direction::Write, page_bio(&bdev, sector, Direction::Write, 1, &done));
        }
        queue.unplug();
        assert_eq!(disk.nr_held(), 3);

        queue.with_state(|q| {
            assert!(q.is_tagged());
            assert!(q.queued_requests().is_empty());

            let tags = q.tags().unwrap();
            assert_eq!(tags.busy(), 3);
            let bound: HashSet<usize> = tags
                .busy_list()
                .iter()
                .map(|&id| q.request(id).tag().unwrap())
                .collect();
            assert_eq!(bound, HashSet::from([0, 1, 2]));

            for tag in 0..3 {
                let id = q.find_tag(tag).unwrap();
                assert!(q.request(id).flags.contains(RequestFlags::QUEUED));
            }
            assert!(q.find_tag(3).is_none());
        });

        assert_eq!(disk.complete_held(queue), 3);
        assert_eq!(*done.lock().unwrap(), vec![Ok(()); 3]);
        queue.with_state(|q| {
            let tags = q.tags().unwrap();
            assert_eq!(tags.busy(), 0);
            assert_eq!(tags.bitmap()[0], u64::MAX << 8);
        });
    }

    #[test]
    fn exhausted_tags_leave_requests_queued() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Tagged, tagged_config(8));
        let queue = bdev.queue();
        let done = statuses();
        queue.with_state(|q| {
            q.free_tags();
            q.init_tags(2);
        });

        for sector in [0, 100, 200] {
            submit_bio(Direction::Read, page_bio(&bdev, sector, Direction::Read, 1, &done));
        }
        queue.unplug();
        assert_eq!(disk.nr_held(), 2);
        assert_eq!(queue.with_state(|q| q.queued_requests().len()), 1);

        assert_eq!(disk.complete_held(queue), 2);
        queue.run_queue();
        assert_eq!(disk.complete_held(queue), 1);
        assert_eq!(done.lock().unwrap().len(), 3);
    }

    #[test]
    fn invalidated_tags_requeue_in_order() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Tagged, tagged_config(8));
        let queue = bdev.queue();
        let done = statuses();

        for sector in [0, 100, 200] {
            submit_bio(Direction::Write, page_bio(&bdev, sector, Direction::Write, 1, &done));
        }
        queue.unplug();
        // the driver forgets what it had in flight
        while disk.take_held().is_some() {}

        queue.with_state(|q| {
            q.invalidate_tags();
            assert_eq!(q.tags().unwrap().busy(), 0);

            let ids = q.queued_requests();
            let sectors: Vec<u64> = ids.iter().map(|&id| q.request(id).sector).collect();
            assert_eq!(sectors, vec![0, 100, 200]);
            for id in ids {
                let req = q.request(id);
                assert!(req.tag().is_none());
                assert!(!req.is_started());
                assert!(!req.flags.contains(RequestFlags::QUEUED));
            }
        });
        assert!(done.lock().unwrap().is_empty());

        queue.run_queue();
        assert_eq!(disk.complete_held(queue), 3);
        assert_eq!(*done.lock().unwrap(), vec![Ok(()); 3]);
    }

    #[test]
    fn resize_grows_tag_table() {
        let _serial = serial();
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Tagged, tagged_config(8));
        let queue = bdev.queue();

        queue.with_state(|q| {
            assert_eq!(q.tags().unwrap().depth(), 8);
            assert_eq!(q.resize_tags(12), Ok(true));
            assert_eq!(q.tags().unwrap().depth(), 12);
            assert_eq!(q.resize_tags(4), Ok(false));

            q.free_tags();
            assert!(!q.is_tagged());
            assert_eq!(q.resize_tags(16), Err(BlkError::NoDevice));
        });
    }

    #[test]
    #[should_panic(expected = "already tagged")]
    fn double_tagging_panics() {
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Tagged, tagged_config(8));
        let queue = bdev.queue();
        let id = queue.get_request(Direction::Read, false).unwrap();

        queue.with_state(|q| {
            q.start_tag(id);
            q.start_tag(id);
        });
    }

    #[test]
    #[should_panic(expected = "has no tag")]
    fn ending_untagged_request_panics() {
        let (_disk, bdev) = ram_disk(2048, RamDiskMode::Tagged, tagged_config(8));
        let queue = bdev.queue();
        let id = queue.get_request(Direction::Read, false).unwrap();

        queue.with_state(|q| q.end_tag(id));
    }
}
