#[cfg(test)]
pub mod test {
    use std::{sync::Arc, thread, time::Duration};

    use crate::{
        storage::disk::{bio::Direction, ramdisk::RamDiskMode},
        tests::{manual_unplug_config, ram_disk, serial},
        utils::completion::Completion,
    };

    #[tokio::main]
    #[test]
    async fn waiter_is_signalled_after_request_is_freed() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Hold, manual_unplug_config());
        let queue = Arc::clone(bdev.queue());

        let done = Completion::new();
        let id = queue.get_request(Direction::Write, false).unwrap();
        queue.with_state(|q| q.request_mut(id).set_completion(done.clone()));
        queue.insert_request(id, false, true);
        assert_eq!(disk.nr_held(), 1);
        assert!(!done.is_done());

        let driver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            disk.complete_held(&queue)
        });

        done.clone().await;
        assert!(done.is_done());
        assert_eq!(driver.join().unwrap(), 1);
        assert_eq!(bdev.queue().with_state(|q| q.count(Direction::Write)), 0);
    }

    #[test]
    fn waiter_blocks_until_completion() {
        let done = Completion::new();
        let signal = done.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.complete();
        });
        done.wait();
        assert!(done.is_done());
        handle.join().unwrap();
    }

    #[test]
    fn special_request_acts_as_barrier() {
        let _serial = serial();
        let (disk, bdev) = ram_disk(2048, RamDiskMode::Hold, manual_unplug_config());
        let queue = bdev.queue();

        let id = queue.get_request(Direction::Read, false).unwrap();
        queue.insert_request(id, true, true);

        queue.with_state(|q| {
            let req = q.request(id);
            assert!(req.is_barrier());
            assert!(!req.is_mergeable());
        });
        assert_eq!(disk.complete_held(queue), 1);
    }
}
