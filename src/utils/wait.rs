use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};

// Sleepers re-check their condition under `seq`, and wakers bump `seq` under the
// same lock, so a wakeup between check and sleep is never lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    seq: Mutex<u64>,
    cond: Condvar,
    waiters: AtomicUsize,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) {
        let mut seq = self.seq.lock().unwrap();
        if cond() {
            return;
        }
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while !cond() {
            seq = self.cond.wait(seq).unwrap();
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    // Returns false if `timeout` elapsed with the condition still false.
    pub fn wait_until_timeout<F: FnMut() -> bool>(&self, timeout: Duration, mut cond: F) -> bool {
        let deadline = Instant::now() + timeout;
        let mut seq = self.seq.lock().unwrap();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut met = cond();
        while !met {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            seq = self.cond.wait_timeout(seq, deadline - now).unwrap().0;
            met = cond();
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        met
    }

    // Sleeps until the next wakeup or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let seq = self.seq.lock().unwrap();
        let start = *seq;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let (seq, result) = self
            .cond
            .wait_timeout_while(seq, timeout, |seq| *seq == start)
            .unwrap();
        drop(seq);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        !result.timed_out()
    }

    pub fn wake_one(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq = seq.wrapping_add(1);
        self.cond.notify_one();
    }

    pub fn wake_all(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod test {
    use std::sync::{atomic::AtomicBool, Arc};

    use super::*;

    #[test]
    fn wake_all_releases_condition_waiter() {
        let wq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let wq = Arc::clone(&wq);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || wq.wait_until(|| flag.load(Ordering::SeqCst)))
        };

        flag.store(true, Ordering::SeqCst);
        wq.wake_all();
        waiter.join().unwrap();
        assert!(!wq.has_waiters());
    }

    #[test]
    fn timed_wait_expires() {
        let wq = WaitQueue::new();
        assert!(!wq.wait_until_timeout(Duration::from_millis(5), || false));
        assert!(!wq.wait_timeout(Duration::from_millis(5)));
    }
}
