//! Bounded multi-producer multi-consumer queue that never blocks producers.
//!
//! When the ring is full a push discards the oldest item. Consumers block on
//! a condition variable until an item arrives or the queue is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    fn take_head(&mut self) -> Option<T> {
        if self.head == self.tail {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        item
    }
}

#[derive(Debug)]
pub struct EventQueue<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    /// Queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        // one slot stays empty so that head == tail means "empty"
        let slots = std::iter::repeat_with(|| None).take(capacity + 1).collect();
        Self {
            capacity,
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append `item`. If the queue was full, the oldest item is evicted and
    /// returned. Items pushed after [`close`](Self::close) are discarded.
    pub fn push(&self, item: T) -> Option<T> {
        let mut ring = self.lock();
        if ring.closed {
            return None;
        }

        let slots = ring.slots.len();
        let next = (ring.tail + 1) % slots;
        let evicted = if next == ring.head {
            let evicted = ring.take_head();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped = total, "event queue full, discarding oldest event");
            evicted
        } else {
            None
        };

        let tail = ring.tail;
        ring.slots[tail] = Some(item);
        ring.tail = next;
        drop(ring);

        self.not_empty.notify_one();
        evicted
    }

    /// Block until an item is available. Returns `None` once the queue is
    /// closed, even if items remain.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.lock();
        loop {
            if ring.closed {
                return None;
            }
            if let Some(item) = ring.take_head() {
                return Some(item);
            }
            ring = match self.not_empty.wait(ring) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut ring = self.lock();
        if ring.closed {
            return None;
        }
        ring.take_head()
    }

    /// Wake every blocked consumer and make further pops return `None`.
    /// Returns how many queued items were discarded.
    pub fn close(&self) -> usize {
        let mut ring = self.lock();
        ring.closed = true;
        let mut discarded = 0;
        while ring.take_head().is_some() {
            discarded += 1;
        }
        drop(ring);
        self.not_empty.notify_all();
        if discarded > 0 {
            debug!(discarded, "event queue closed with pending events");
        }
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items evicted by overflowing pushes so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
