use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, Weak,
    },
    time::Instant,
};

use lazy_static::lazy_static;
use log::{debug, error};

use super::queue::RequestQueue;

// Deferred queue work run on the kblockd thread.
pub enum BlockWork {
    // Unplug the queue if it is still plugged.
    Unplug(Weak<RequestQueue>),

    // Remove any plug and call the driver unconditionally.
    RunQueue(Weak<RequestQueue>),

    // Plug timer. Stale if the queue's plug generation moved on.
    UnplugTimer {
        queue: Weak<RequestQueue>,
        deadline: Instant,
        generation: u64,
    },

    Flush(Sender<()>),
}

struct Timer {
    deadline: Instant,
    seq: u64,
    queue: Weak<RequestQueue>,
    generation: u64,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

pub struct Kblockd {
    tx: Mutex<Sender<BlockWork>>,
}

lazy_static! {
    pub static ref KBLOCKD: Kblockd = Kblockd::new();

    // Queues currently plugged, in plug order.
    static ref PLUG_LIST: Mutex<Vec<(u64, Weak<RequestQueue>)>> = Mutex::new(Vec::new());
}

impl Kblockd {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("kblockd".into())
            .spawn(move || Self::worker_loop(rx));
        if let Err(err) = spawned {
            error!("kblockd: failed to start worker: {}", err);
        }

        Self { tx: Mutex::new(tx) }
    }

    fn worker_loop(rx: Receiver<BlockWork>) {
        let mut timers: BinaryHeap<Reverse<Timer>> = BinaryHeap::new();
        let mut seq = 0u64;

        loop {
            let next = match timers.peek() {
                Some(Reverse(timer)) => {
                    let now = Instant::now();
                    if timer.deadline <= now {
                        if let Some(Reverse(timer)) = timers.pop() {
                            if let Some(queue) = timer.queue.upgrade() {
                                queue.unplug_timeout(timer.generation);
                            }
                        }
                        continue;
                    }
                    rx.recv_timeout(timer.deadline - now)
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match next {
                Ok(BlockWork::Unplug(queue)) => {
                    if let Some(queue) = queue.upgrade() {
                        queue.unplug();
                    }
                }
                Ok(BlockWork::RunQueue(queue)) => {
                    if let Some(queue) = queue.upgrade() {
                        queue.run_queue();
                    }
                }
                Ok(BlockWork::UnplugTimer {
                    queue,
                    deadline,
                    generation,
                }) => {
                    seq += 1;
                    timers.push(Reverse(Timer {
                        deadline,
                        seq,
                        queue,
                        generation,
                    }));
                }
                Ok(BlockWork::Flush(done)) => {
                    let _ = done.send(());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("kblockd: channel closed, exiting");
                    break;
                }
            }
        }
    }

    pub fn schedule(&self, work: BlockWork) {
        if self.tx.lock().unwrap().send(work).is_err() {
            error!("kblockd: worker gone, dropping work");
        }
    }

    // Waits until all work queued before the call has run. Pending timers are
    // not waited for.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        self.schedule(BlockWork::Flush(tx));
        let _ = rx.recv();
    }
}

pub(crate) fn plug_list_add(id: u64, queue: Weak<RequestQueue>) {
    PLUG_LIST.lock().unwrap().push((id, queue));
}

pub(crate) fn plug_list_remove(id: u64) {
    PLUG_LIST.lock().unwrap().retain(|(qid, _)| *qid != id);
}

pub fn nr_plugged() -> usize {
    PLUG_LIST.lock().unwrap().len()
}

// Unplugs every plugged queue.
pub fn run_queues() {
    let plugged: Vec<Arc<RequestQueue>> = {
        let mut list = PLUG_LIST.lock().unwrap();
        std::mem::take(&mut *list)
            .into_iter()
            .filter_map(|(_, q)| q.upgrade())
            .collect()
    };

    for queue in plugged {
        queue.unplug();
    }
}
