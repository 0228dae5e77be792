use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bounded inter-stage queue with drop-oldest overflow. Stale analyses are
/// worse than gaps, so a full queue evicts its oldest entry to make room
/// for the incoming one.
pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    cond: Condvar,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            cond: Condvar::new(),
        }
    }

    /// Push an item, evicting the oldest pending item on overflow.
    /// Returns true if an item was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut queue = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut dropped = false;
        while queue.len() >= self.capacity {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(item);
        drop(queue);

        self.cond.notify_one();
        dropped
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut queue = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Blocking pop with a timeout so consumer loops stay responsive to
    /// shutdown.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(item) = queue.pop_front() {
            return Some(item);
        }

        let (mut queue, _) = match self.cond.wait_timeout(queue, timeout) {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame-ready signal from capture to the supervisor: a monotonically
/// increasing frame counter over a watch channel. The supervisor awaits
/// changes; capture never blocks on it.
pub struct FrameReady {
    tx: tokio::sync::watch::Sender<u64>,
}

impl FrameReady {
    pub fn new() -> (Self, FrameReadyListener) {
        let (tx, rx) = tokio::sync::watch::channel(0);
        (Self { tx }, FrameReadyListener { rx })
    }

    pub fn signal(&self) {
        self.tx.send_modify(|count| *count += 1);
    }
}

pub struct FrameReadyListener {
    rx: tokio::sync::watch::Receiver<u64>,
}

impl FrameReadyListener {
    /// Wait until capture has produced at least one frame.
    pub async fn wait_first_frame(&mut self) {
        while *self.rx.borrow_and_update() == 0 {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the next frame signal, bounded by `timeout` so the caller
    /// can observe shutdown. Returns false on timeout or a closed channel.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => false,
        }
    }
}
