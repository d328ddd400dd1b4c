use crate::invariants::{debug_assert_bounded_count, debug_assert_slot_filled, debug_assert_slot_free};
use crate::QueueMetrics;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error types for queue construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A queue must be able to hold at least one item.
    #[error("queue capacity must be positive")]
    ZeroCapacity,
}

/// Bounded multi-producer FIFO queue.
///
/// `push` never blocks: when all slots are occupied the item is returned to
/// the caller. `pop` parks the calling thread on a condition variable until an
/// item arrives or the optional timeout elapses.
///
/// All state lives behind a single mutex. Waking is done with
/// `notify_one` on every successful push, so each pushed item wakes at most one
/// parked consumer.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: usize,
}

struct State<T> {
    /// Fixed ring of slots; `None` marks a free slot
    slots: Box<[Option<T>]>,
    /// Read cursor
    head: usize,
    /// Occupied count (tracked explicitly so "full" and "empty" never alias)
    len: usize,
    metrics: QueueMetrics,
}

impl<T> State<T> {
    fn take_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        let idx = self.head;
        let item = self.slots[idx].take();
        debug_assert_slot_filled!(item, idx);

        self.head = (idx + 1) % self.slots.len();
        self.len -= 1;
        self.metrics.popped += 1;
        item
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }

        let slots: Box<[Option<T>]> = (0..capacity).map(|_| None).collect();

        Ok(Self {
            state: Mutex::new(State {
                slots,
                head: 0,
                len: 0,
                metrics: QueueMetrics::new(),
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Returns the queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues `item` without blocking.
    ///
    /// Returns `Err(item)` if the queue is full; the item is not stored and the
    /// drop is counted in [`QueueMetrics::dropped`].
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();

            if state.len == self.capacity {
                state.metrics.dropped += 1;
                return Err(item);
            }

            let idx = (state.head + state.len) % self.capacity;
            debug_assert_slot_free!(state.slots[idx], idx);
            state.slots[idx] = Some(item);
            state.len += 1;
            state.metrics.pushed += 1;

            debug_assert_bounded_count!(state.len, self.capacity);
        }

        self.available.notify_one();
        Ok(())
    }

    /// Like [`push`](Self::push), discarding a rejected item.
    pub fn try_push(&self, item: T) -> bool {
        self.push(item).is_ok()
    }

    /// Dequeues the oldest item, waiting for one if the queue is empty.
    ///
    /// - `None` waits indefinitely.
    /// - `Some(Duration::ZERO)` never waits.
    /// - `Some(t)` waits at most `t`, then rechecks once more.
    ///
    /// Returns `None` only when the wait ended with the queue still empty.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let mut state = self.lock();

        // A timeout too large to represent as a deadline behaves like no timeout
        match timeout.and_then(|t| Instant::now().checked_add(t)) {
            None if timeout.is_none() || state.len == 0 => {
                while state.len == 0 {
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            None => {}
            Some(deadline) => {
                while state.len == 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }

        state.take_front()
    }

    /// Dequeues the oldest item if one is present. Never waits.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().take_front()
    }

    /// Discards every queued item, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let mut cleared = 0;

        while state.len > 0 {
            let idx = state.head;
            state.slots[idx] = None;
            state.head = (idx + 1) % self.capacity;
            state.len -= 1;
            cleared += 1;
        }

        state.head = 0;
        state.metrics.cleared += cleared as u64;
        cleared
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().len == 0
    }

    /// Returns `true` if the next `push` would be rejected.
    pub fn is_full(&self) -> bool {
        self.lock().len == self.capacity
    }

    /// Returns a snapshot of the queue counters.
    pub fn metrics(&self) -> QueueMetrics {
        self.lock().metrics
    }

    // The protected state is updated field by field without calling out to
    // user code, so a poisoned lock still guards a consistent ring.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.len)
            .field("metrics", &state.metrics)
            .finish()
    }
}
