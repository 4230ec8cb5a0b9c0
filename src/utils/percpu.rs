use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use lazy_static::lazy_static;

lazy_static! {
    static ref NR_CPUS: usize = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
}

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CPU_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

pub fn nr_cpus() -> usize {
    *NR_CPUS
}

// Threads are bound to a cpu slot round-robin on first use.
pub fn this_cpu() -> usize {
    CPU_ID.with(|id| match id.get() {
        Some(cpu) => cpu,
        None => {
            let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % nr_cpus();
            id.set(Some(cpu));
            cpu
        }
    })
}

pub fn set_this_cpu(cpu: usize) {
    CPU_ID.with(|id| id.set(Some(cpu % nr_cpus())));
}

pub struct PerCpu<T> {
    slots: Box<[Mutex<T>]>,
}

impl<T> PerCpu<T> {
    pub fn new<F: Fn() -> T>(init: F) -> Self {
        Self {
            slots: (0..nr_cpus()).map(|_| Mutex::new(init())).collect(),
        }
    }

    pub fn with_this_cpu<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R {
        let mut slot = self.slots[this_cpu()].lock().unwrap();
        f(&mut slot)
    }

    pub fn for_each<F: FnMut(&mut T)>(&self, mut f: F) {
        for slot in self.slots.iter() {
            f(&mut slot.lock().unwrap());
        }
    }
}
