//! Recursive looper lock
//!
//! A mutex that the owning thread may re-acquire; it is released once the
//! owner has balanced every acquisition. Loopers merged by proxying share one
//! instance, so the per-looper acquisition counts live in a thread-local table
//! next to it (see [`held`]).

use codec::{MessagingError, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::looper::LooperId;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RecursiveLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl RecursiveLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire once; `None` waits forever
    pub(crate) fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    return Ok(());
                }
                Some(_) => match deadline {
                    None => self.released.wait(&mut state),
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            return Err(lock_timeout(timeout));
                        }
                        if self.released.wait_until(&mut state, deadline).timed_out() && state.owner.is_some() {
                            return Err(lock_timeout(timeout));
                        }
                    }
                },
            }
        }
    }

    /// Release once; returns false if the calling thread is not the owner
    pub(crate) fn release(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) || state.count == 0 {
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        true
    }

    /// Acquisitions the calling thread currently holds
    pub(crate) fn held_by_current(&self) -> usize {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.count
        } else {
            0
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

fn lock_timeout(timeout: Option<Duration>) -> MessagingError {
    match timeout {
        Some(t) if t.is_zero() => MessagingError::WouldBlock("looper lock is held by another thread".into()),
        Some(t) => MessagingError::timed_out(t, "looper lock"),
        None => MessagingError::Error("looper lock wait ended without acquiring".into()),
    }
}

/// Per-thread count of unmatched `lock()` calls, keyed by looper
pub(crate) mod held {
    use super::*;

    thread_local! {
        static HELD: RefCell<HashMap<LooperId, usize>> = RefCell::new(HashMap::new());
    }

    pub(crate) fn count(id: LooperId) -> usize {
        HELD.with(|held| held.borrow().get(&id).copied().unwrap_or(0))
    }

    pub(crate) fn increment(id: LooperId) {
        add(id, 1);
    }

    pub(crate) fn add(id: LooperId, n: usize) {
        HELD.with(|held| *held.borrow_mut().entry(id).or_insert(0) += n);
    }

    /// Decrement; false if nothing was held
    pub(crate) fn decrement(id: LooperId) -> bool {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            match held.get_mut(&id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        held.remove(&id);
                    }
                    true
                }
                _ => false,
            }
        })
    }

    /// Forget every acquisition of `id`, returning how many there were
    pub(crate) fn take(id: LooperId) -> usize {
        HELD.with(|held| held.borrow_mut().remove(&id).unwrap_or(0))
    }
}
