use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use bitflags::bitflags;
use lazy_static::lazy_static;
use log::trace;

use crate::utils::wait::WaitQueue;

use super::{bio::Direction, scheduler::run_queues};

bitflags! {
    pub struct BdiState: u32 {
        const READ_CONGESTED = 1 << 0;
        const WRITE_CONGESTED = 1 << 1;
    }
}

fn congested_bit(dir: Direction) -> BdiState {
    match dir {
        Direction::Read => BdiState::READ_CONGESTED,
        Direction::Write => BdiState::WRITE_CONGESTED,
    }
}

lazy_static! {
    // Sleepers in `congestion_wait`, woken when any queue leaves congestion.
    static ref CONGESTION_WQH: [WaitQueue; 2] = [WaitQueue::new(), WaitQueue::new()];
}

// Outstanding count at which a direction becomes congested.
pub fn congestion_on_threshold(nr_requests: usize) -> usize {
    (nr_requests - nr_requests / 8 + 1).min(nr_requests)
}

// Outstanding count below which congestion clears. Always under the on threshold.
pub fn congestion_off_threshold(nr_requests: usize) -> usize {
    (nr_requests - nr_requests / 8).saturating_sub(1).max(1)
}

// Congestion state of one queue as seen by writeback.
#[derive(Debug, Default)]
pub struct BackingDevInfo {
    state: AtomicU32,
    congested_events: [AtomicU64; 2],
}

impl BackingDevInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_congested(&self, dir: Direction) -> bool {
        self.state.load(Ordering::Acquire) & congested_bit(dir).bits() != 0
    }

    pub fn read_congested(&self) -> bool {
        self.is_congested(Direction::Read)
    }

    pub fn write_congested(&self) -> bool {
        self.is_congested(Direction::Write)
    }

    // Times the direction went from uncongested to congested.
    pub fn congestion_events(&self, dir: Direction) -> u64 {
        self.congested_events[dir.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn set_congested(&self, dir: Direction) {
        let bit = congested_bit(dir).bits();
        if self.state.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            self.congested_events[dir.index()].fetch_add(1, Ordering::Relaxed);
            trace!("{:?} congested", dir);
        }
    }

    pub(crate) fn clear_congested(&self, dir: Direction) {
        let bit = congested_bit(dir).bits();
        if self.state.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
            trace!("{:?} uncongested", dir);
        }
        let wqh = &CONGESTION_WQH[dir.index()];
        if wqh.has_waiters() {
            wqh.wake_all();
        }
    }
}

// Waits for some queue to leave congestion in `dir`, or for `timeout`.
// Returns true if woken before the timeout.
pub fn congestion_wait(dir: Direction, timeout: Duration) -> bool {
    run_queues();
    CONGESTION_WQH[dir.index()].wait_timeout(timeout)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thresholds_for_default_pool() {
        assert_eq!(congestion_on_threshold(128), 113);
        assert_eq!(congestion_off_threshold(128), 111);
    }

    #[test]
    fn thresholds_for_tiny_pools() {
        assert_eq!(congestion_on_threshold(4), 4);
        assert_eq!(congestion_off_threshold(4), 3);
        assert_eq!(congestion_on_threshold(1), 1);
        assert_eq!(congestion_off_threshold(1), 1);
    }

    #[test]
    fn congested_bit_counts_transitions() {
        let bdi = BackingDevInfo::new();
        bdi.set_congested(Direction::Write);
        bdi.set_congested(Direction::Write);
        assert!(bdi.write_congested());
        assert!(!bdi.read_congested());
        assert_eq!(bdi.congestion_events(Direction::Write), 1);

        bdi.clear_congested(Direction::Write);
        assert!(!bdi.write_congested());
    }
}
