use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use crate::config::BatchConfig;

static NEXT_IOC_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<IoContext>>> = const { RefCell::new(None) };
}

#[derive(Debug)]
struct IoContextInner {
    nr_batch_requests: u32,
    last_waited: Option<Instant>,
}

impl IoContextInner {
    fn is_batching(&self, cfg: &BatchConfig) -> bool {
        self.nr_batch_requests == cfg.batch_requests
            || (self.nr_batch_requests > 0
                && self
                    .last_waited
                    .map_or(false, |t| t.elapsed() < cfg.batch_time))
    }
}

// Per-submitter state. A submitter that waited for a free request gets a short
// batching window in which it may allocate past a full pool.
#[derive(Debug)]
pub struct IoContext {
    id: u64,
    inner: Mutex<IoContextInner>,
}

impl IoContext {
    fn new() -> Self {
        Self {
            id: NEXT_IOC_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(IoContextInner {
                nr_batch_requests: 0,
                last_waited: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn nr_batch_requests(&self) -> u32 {
        self.inner.lock().unwrap().nr_batch_requests
    }

    // A full allowance, or a partial one still inside the time window.
    pub fn is_batching(&self, cfg: &BatchConfig) -> bool {
        self.inner.lock().unwrap().is_batching(cfg)
    }

    // Renews the window unless one is already running.
    pub fn set_batching(&self, cfg: &BatchConfig) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_batching(cfg) {
            return;
        }
        inner.nr_batch_requests = cfg.batch_requests;
        inner.last_waited = Some(Instant::now());
    }

    pub(crate) fn consume_batch(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.nr_batch_requests = inner.nr_batch_requests.saturating_sub(1);
    }
}

pub fn get_io_context() -> Arc<IoContext> {
    CURRENT.with(|cur| {
        let mut cur = cur.borrow_mut();
        Arc::clone(cur.get_or_insert_with(|| Arc::new(IoContext::new())))
    })
}

pub fn current_io_context() -> Option<Arc<IoContext>> {
    CURRENT.with(|cur| cur.borrow().clone())
}

pub fn exit_io_context() {
    CURRENT.with(|cur| cur.borrow_mut().take());
}

// Makes the calling thread share `ioc`, as a child sharing its parent's context.
pub fn copy_io_context(ioc: &Arc<IoContext>) {
    CURRENT.with(|cur| *cur.borrow_mut() = Some(Arc::clone(ioc)));
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn batching_window_expires() {
        let cfg = BatchConfig {
            batch_requests: 4,
            batch_time: Duration::from_millis(10),
        };
        let ioc = IoContext::new();
        assert!(!ioc.is_batching(&cfg));

        ioc.set_batching(&cfg);
        assert!(ioc.is_batching(&cfg));

        ioc.consume_batch();
        assert!(ioc.is_batching(&cfg));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!ioc.is_batching(&cfg));
    }

    #[test]
    fn running_window_is_not_renewed() {
        let cfg = BatchConfig {
            batch_requests: 4,
            batch_time: Duration::from_secs(10),
        };
        let ioc = Arc::new(IoContext::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ioc = Arc::clone(&ioc);
                std::thread::spawn(move || {
                    ioc.set_batching(&cfg);
                    ioc.consume_batch();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(ioc.nr_batch_requests(), 0);

        ioc.set_batching(&cfg);
        ioc.consume_batch();
        ioc.set_batching(&cfg);
        assert_eq!(ioc.nr_batch_requests(), 3);
    }

    #[test]
    fn context_is_per_thread_until_shared() {
        let mine = get_io_context();
        assert!(Arc::ptr_eq(&mine, &get_io_context()));

        let other = std::thread::spawn(|| get_io_context().id()).join().unwrap();
        assert_ne!(other, mine.id());

        let shared = Arc::clone(&mine);
        let id = std::thread::spawn(move || {
            copy_io_context(&shared);
            get_io_context().id()
        })
        .join()
        .unwrap();
        assert_eq!(id, mine.id());

        exit_io_context();
        assert!(current_io_context().is_none());
    }
}
