//! Looper message queue
//!
//! FIFO of `(destination, message)` entries guarded by a mutex and a pair of
//! condition variables (messages available / space available). Loopers merged
//! by proxying share their root's queue, which is why every entry records the
//! looper it was posted to. Closing the queue wakes every waiter.

use codec::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::looper::LooperShared;

pub(crate) struct QueuedMessage {
    pub(crate) destination: Weak<LooperShared>,
    pub(crate) message: Message,
}

impl QueuedMessage {
    pub(crate) fn new(destination: &Arc<LooperShared>, message: Message) -> Self {
        Self {
            destination: Arc::downgrade(destination),
            message,
        }
    }

    pub(crate) fn is_for(&self, looper: &Arc<LooperShared>) -> bool {
        std::ptr::eq(self.destination.as_ptr(), Arc::as_ptr(looper))
    }
}

/// Outcome of a non-blocking push
pub(crate) enum PushError {
    Full(QueuedMessage),
    Closed(QueuedMessage),
}

/// Outcome of waiting for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Ready,
    Idle,
    Closed,
}

struct QueueState {
    entries: VecDeque<QueuedMessage>,
    closed: bool,
}

pub(crate) struct MessageQueue {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    available: Condvar,
    space: Condvar,
}

impl MessageQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                closed: false,
            }),
            capacity,
            available: Condvar::new(),
            space: Condvar::new(),
        }
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub(crate) fn try_push(&self, entry: QueuedMessage) -> Result<(), PushError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(entry));
        }
        if let Some(capacity) = self.capacity {
            if state.entries.len() >= capacity {
                return Err(PushError::Full(entry));
            }
        }
        state.entries.push_back(entry);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Push ignoring the capacity bound; used for control messages
    pub(crate) fn force_push(&self, entry: QueuedMessage) -> Result<(), QueuedMessage> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(entry);
        }
        state.entries.push_back(entry);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until there is room or `deadline` passes; true if room appeared
    pub(crate) fn wait_for_space(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        loop {
            let full = self.capacity.is_some_and(|capacity| state.entries.len() >= capacity);
            if !full || state.closed {
                return true;
            }
            match deadline {
                None => self.space.wait(&mut state),
                Some(deadline) => {
                    if self.space.wait_until(&mut state, deadline).timed_out() {
                        return false;
                    }
                }
            }
        }
    }

    /// Block until a message is queued, the queue closes, or `idle` elapses
    pub(crate) fn wait_for_message(&self, idle: Duration) -> WaitOutcome {
        let deadline = Instant::now() + idle;
        let mut state = self.state.lock();
        loop {
            if !state.entries.is_empty() {
                return WaitOutcome::Ready;
            }
            if state.closed {
                return WaitOutcome::Closed;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return if state.entries.is_empty() {
                    WaitOutcome::Idle
                } else {
                    WaitOutcome::Ready
                };
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<QueuedMessage> {
        let entry = self.state.lock().entries.pop_front();
        if entry.is_some() {
            self.space.notify_one();
        }
        entry
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Number of queued entries addressed to `looper`
    pub(crate) fn count_for(&self, looper: &Arc<LooperShared>) -> usize {
        self.state.lock().entries.iter().filter(|e| e.is_for(looper)).count()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Move every entry into `root` (keeping order) and close this queue
    ///
    /// Both queue mutexes are held across the move so that a poster bounced
    /// off the closed queue cannot overtake the moved entries.
    pub(crate) fn drain_into(&self, root: &MessageQueue) {
        let mut state = self.state.lock();
        let mut root_state = root.state.lock();
        root_state.entries.extend(state.entries.drain(..));
        state.closed = true;
        let moved = !root_state.entries.is_empty();
        drop(root_state);
        drop(state);
        if moved {
            root.available.notify_one();
        }
        self.available.notify_all();
        self.space.notify_all();
    }

    /// Move the entries addressed to `looper` into `into`, keeping order
    pub(crate) fn extract_for(&self, looper: &Arc<LooperShared>, into: &MessageQueue) {
        let mut state = self.state.lock();
        let mut into_state = into.state.lock();
        let mut kept = VecDeque::with_capacity(state.entries.len());
        for entry in state.entries.drain(..) {
            if entry.is_for(looper) {
                into_state.entries.push_back(entry);
            } else {
                kept.push_back(entry);
            }
        }
        state.entries = kept;
        drop(into_state);
        drop(state);
        self.space.notify_all();
    }

    /// Close and hand back whatever was still queued
    pub(crate) fn close(&self) -> Vec<QueuedMessage> {
        let mut state = self.state.lock();
        state.closed = true;
        let remaining = state.entries.drain(..).collect();
        drop(state);
        self.available.notify_all();
        self.space.notify_all();
        remaining
    }
}
