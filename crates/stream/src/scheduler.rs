//! Deadline scheduling.
//!
//! Provides:
//! - `AlarmQueue` - synchronous min-heap of keyed deadlines
//! - `AlarmScheduler` - async wrapper that delivers due keys on a channel
//!
//! Rescheduling a key pushes a new heap entry; stale entries are discarded by
//! checking against `pending`, so every operation stays `O(log n)`.

use std::{cmp::Reverse, collections::BinaryHeap, collections::HashMap, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc},
    time::{Instant, sleep_until},
};
use tracing::debug;

/// Keyed deadlines ordered by fire time.
pub struct AlarmQueue<K> {
    /// Current deadline per key.
    pending: HashMap<K, Instant>,
    /// Heap of (fire_at, key); may hold stale entries.
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Clone + Eq + Hash + Ord> Default for AlarmQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Ord> AlarmQueue<K> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Set (or move) the deadline for `key`.
    pub fn schedule_at(&mut self, key: K, fire_at: Instant) {
        if self.pending.get(&key).copied() == Some(fire_at) {
            return;
        }
        self.pending.insert(key.clone(), fire_at);
        self.heap.push(Reverse((fire_at, key)));
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn deadline_for(&self, key: &K) -> Option<Instant> {
        self.pending.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove and return every key whose deadline is at or before `now`.
    pub fn drain_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        loop {
            self.pop_stale();
            let Some(Reverse((fire_at, _))) = self.heap.peek() else {
                break;
            };
            if *fire_at > now {
                break;
            }
            if let Some(Reverse((fire_at, key))) = self.heap.pop()
                && self.pending.get(&key).copied() == Some(fire_at)
            {
                self.pending.remove(&key);
                due.push(key);
            }
        }
        due
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((fire_at, key))) = self.heap.peek() {
            if self.pending.get(key).copied() == Some(*fire_at) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Shared alarm queue driven by a background task.
///
/// Due keys are sent on the receiver returned by [`AlarmScheduler::start`].
/// The driver stops once every scheduler clone and the receiver are dropped.
#[derive(Clone)]
pub struct AlarmScheduler<K> {
    queue: Arc<Mutex<AlarmQueue<K>>>,
    wake: Arc<Notify>,
}

impl<K> AlarmScheduler<K>
where
    K: Clone + Eq + Hash + Ord + Send + 'static,
{
    pub fn start() -> (Self, mpsc::UnboundedReceiver<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            queue: Arc::new(Mutex::new(AlarmQueue::new())),
            wake: Arc::new(Notify::new()),
        };
        tokio::spawn(drive(
            Arc::downgrade(&scheduler.queue),
            scheduler.wake.clone(),
            tx,
        ));
        (scheduler, rx)
    }

    pub fn schedule_at(&self, key: K, fire_at: Instant) {
        let earlier = {
            let mut queue = self.queue.lock();
            let previous = queue.next_deadline();
            queue.schedule_at(key, fire_at);
            previous.is_none_or(|p| fire_at < p)
        };
        if earlier {
            self.wake.notify_one();
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        self.queue.lock().cancel(key)
    }

    pub fn deadline_for(&self, key: &K) -> Option<Instant> {
        self.queue.lock().deadline_for(key)
    }
}

async fn drive<K>(
    queue: std::sync::Weak<Mutex<AlarmQueue<K>>>,
    wake: Arc<Notify>,
    tx: mpsc::UnboundedSender<K>,
) where
    K: Clone + Eq + Hash + Ord + Send + 'static,
{
    loop {
        let next = {
            let Some(queue) = queue.upgrade() else { break };
            let mut queue = queue.lock();
            for key in queue.drain_due(Instant::now()) {
                if tx.send(key).is_err() {
                    debug!("Alarm receiver dropped; stopping scheduler");
                    return;
                }
            }
            queue.next_deadline()
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = wake.notified() => {}
                    _ = tx.closed() => break,
                }
            }
            None => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tx.closed() => break,
                }
            }
        }
    }
}
