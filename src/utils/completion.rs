use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
};

use super::wait::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionState {
    Pending = 0,
    Done = 1,
}

impl CompletionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CompletionState::Done,
            _ => CompletionState::Pending,
        }
    }
}

struct CompletionInner {
    flag: AtomicU8,
    waker: Mutex<Option<Waker>>,
    wait: WaitQueue,
}

// One-shot signal a submitter waits on until its request finishes. Can be waited
// on from a thread with `wait` or awaited as a future.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("done", &self.is_done()).finish()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                flag: AtomicU8::new(CompletionState::Pending as u8),
                waker: Mutex::new(None),
                wait: WaitQueue::new(),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        CompletionState::from_u8(self.inner.flag.load(Ordering::Acquire)) == CompletionState::Done
    }

    pub fn complete(&self) {
        self.inner
            .flag
            .store(CompletionState::Done as u8, Ordering::Release);

        if let Some(waker) = self.inner.waker.lock().unwrap().take() {
            waker.wake();
        }
        self.inner.wait.wake_all();
    }

    pub fn wait(&self) {
        self.inner.wait.wait_until(|| self.is_done());
    }
}

impl Future for Completion {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_done() {
            return Poll::Ready(());
        }

        {
            let mut waker_guard = self.inner.waker.lock().unwrap();
            *waker_guard = Some(cx.waker().clone());
        }

        // complete() may have run between the check and storing the waker
        if self.is_done() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
