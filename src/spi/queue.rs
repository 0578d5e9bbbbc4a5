//! Bounded per-device transaction queues

use core::task::Waker;

use embassy_sync::waitqueue::WakerRegistration;
use heapless::Deque;

use super::config::MAX_QUEUE_DEPTH;

/// FIFO of at most `depth` entries, shared between tasks and the interrupt handler.
///
/// The queue itself is not synchronized, it lives inside the bus state mutex. Pushing
/// wakes the task waiting to pop and vice versa.
pub(crate) struct TransQueue<T> {
    items: Deque<T, MAX_QUEUE_DEPTH>,
    depth: usize,
    push_waker: WakerRegistration,
    pop_waker: WakerRegistration,
}

impl<T> TransQueue<T> {
    pub(crate) fn new(depth: usize) -> Self {
        debug_assert!(depth > 0 && depth <= MAX_QUEUE_DEPTH);
        Self {
            items: Deque::new(),
            depth,
            push_waker: WakerRegistration::new(),
            pop_waker: WakerRegistration::new(),
        }
    }

    pub(crate) fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item)?;
        self.pop_waker.wake();
        Ok(())
    }

    pub(crate) fn try_pop(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.push_waker.wake();
        Some(item)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.depth
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Wake `waker` once there is room.
    pub(crate) fn register_push(&mut self, waker: &Waker) {
        self.push_waker.register(waker);
    }

    /// Wake `waker` once there is an entry.
    pub(crate) fn register_pop(&mut self, waker: &Waker) {
        self.pop_waker.register(waker);
    }
}
