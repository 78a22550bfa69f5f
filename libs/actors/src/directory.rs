//! Process-wide looper directory
//!
//! Tracks every live looper and which dispatch thread runs it. The directory
//! mutex doubles as the coarse "handler operator" lock: attaching or detaching
//! handlers and rewiring proxies happen while it is held.
//!
//! # Lock Ordering
//!
//! 1. looper locks (recursive, any number)
//! 2. the directory mutex
//! 3. per-looper routing mutexes
//! 4. queue mutexes
//!
//! A looper lock is never acquired while the directory mutex is held.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crate::looper::{Looper, LooperId, LooperShared};

pub(crate) struct Directory {
    loopers: Vec<(LooperId, Weak<LooperShared>)>,
    threads: HashMap<ThreadId, LooperId>,
}

static DIRECTORY: Lazy<Mutex<Directory>> = Lazy::new(|| {
    Mutex::new(Directory {
        loopers: Vec::new(),
        threads: HashMap::new(),
    })
});

/// Take the coarse lock
pub(crate) fn coarse() -> MutexGuard<'static, Directory> {
    DIRECTORY.lock()
}

impl Directory {
    pub(crate) fn register(&mut self, looper: &Arc<LooperShared>) {
        // Loopers dropped without quitting leave dead entries behind
        self.loopers.retain(|(_, entry)| entry.strong_count() > 0);
        self.loopers.push((looper.id(), Arc::downgrade(looper)));
    }

    pub(crate) fn unregister(&mut self, id: LooperId) {
        self.loopers.retain(|(entry, _)| *entry != id);
        self.threads.retain(|_, entry| *entry != id);
    }

    pub(crate) fn bind_thread(&mut self, thread: ThreadId, id: LooperId) {
        self.threads.insert(thread, id);
    }

    pub(crate) fn unbind_thread(&mut self, thread: ThreadId) {
        self.threads.remove(&thread);
    }

    fn find(&self, id: LooperId) -> Option<Arc<LooperShared>> {
        self.loopers
            .iter()
            .find(|(entry, _)| *entry == id)
            .and_then(|(_, looper)| looper.upgrade())
    }
}

/// Looper whose dispatch thread is the calling thread
pub fn looper_for_thread() -> Option<Looper> {
    looper_for(thread::current().id())
}

/// Looper dispatched by `thread`
pub fn looper_for(thread: ThreadId) -> Option<Looper> {
    let directory = coarse();
    let id = *directory.threads.get(&thread)?;
    directory.find(id).map(Looper::from_shared)
}

/// Number of live loopers in the process
pub fn looper_count() -> usize {
    coarse()
        .loopers
        .iter()
        .filter(|(_, looper)| looper.strong_count() > 0)
        .count()
}

/// Every live looper, in creation order
pub fn loopers() -> Vec<Looper> {
    coarse()
        .loopers
        .iter()
        .filter_map(|(_, looper)| looper.upgrade())
        .map(Looper::from_shared)
        .collect()
}
