//! # Looper - thread-bound dispatcher
//!
//! A looper owns a message queue, a recursive lock and an ordered chain of
//! handlers whose first member is the looper's own handler. Once `run()`
//! spawns its dispatch thread, every message posted to the looper is
//! delivered on that thread, one at a time, with the lock held.
//!
//! ## Proxying
//!
//! `proxy_by(Some(&a))` merges a looper into `a`: its pending messages move
//! to the end of `a`'s queue, and from then on it shares `a`'s lock and
//! queue, so its handlers run on `a`'s thread. Chains of proxies are
//! flattened (every client points straight at the root that owns the
//! thread). `proxy_by(None)` splits the looper off again with a fresh lock and
//! queue, taking its pending messages along, and wakes its own thread.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──run()──► Running ──quit()/QUIT──► Quitting ──► Destroyed
//!    └──────────────quit() without a thread─────────────────────┘
//! ```

use codec::constants::QUIT;
use codec::{Message, MessagingError, Result, Target};
use looper_config::{LooperSettings, RuntimeConfig};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory;
use crate::dispatch;
use crate::filter::{FilterId, FilterList, MessageFilter};
use crate::handler::{ChainSplice, DefaultHandler, Handler, HandlerRef};
use crate::lock::{held, RecursiveLock};
use crate::messenger::Messenger;
use crate::queue::{MessageQueue, PushError, QueuedMessage};

/// Unique looper identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LooperId(Uuid);

impl LooperId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LooperId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LooperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "looper-{}", self.0.simple())
    }
}

/// Looper lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperState {
    Created,
    Running,
    Quitting,
    Destroyed,
}

/// Which lock and queue a looper currently uses
pub(crate) struct Routing {
    pub(crate) proxy: Option<Arc<LooperShared>>,
    pub(crate) clients: Vec<Weak<LooperShared>>,
    pub(crate) lock: Arc<RecursiveLock>,
    pub(crate) queue: Arc<MessageQueue>,
}

pub(crate) struct LooperShared {
    id: LooperId,
    name: String,
    pub(crate) settings: LooperSettings,
    application: bool,
    pub(crate) root: HandlerRef,
    pub(crate) handlers: Mutex<Vec<HandlerRef>>,
    preferred: Mutex<Option<HandlerRef>>,
    pub(crate) common_filters: Mutex<FilterList>,
    pub(crate) routing: Mutex<Routing>,
    /// Signalled when a proxied looper is split off again
    pub(crate) resumed: Condvar,
    state: Mutex<LooperState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) thread_id: Mutex<Option<ThreadId>>,
    started: AtomicBool,
}

impl LooperShared {
    pub(crate) fn id(&self) -> LooperId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> LooperState {
        *self.state.lock()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state() == LooperState::Destroyed
    }

    fn has_thread(&self) -> bool {
        self.thread_id.lock().is_some()
    }
}

/// Configures and creates a [`Looper`]
pub struct LooperBuilder {
    name: String,
    behavior: Box<dyn Handler>,
    settings: Option<LooperSettings>,
    application: bool,
}

impl LooperBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Box::new(DefaultHandler),
            settings: None,
            application: false,
        }
    }

    /// Behavior of the looper's own handler
    pub fn behavior(mut self, behavior: impl Handler) -> Self {
        self.behavior = Box::new(behavior);
        self
    }

    /// Override the process-wide [`LooperSettings`]
    pub fn settings(mut self, settings: LooperSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Mark this as the application looper, which can never be proxied
    pub fn application(mut self, application: bool) -> Self {
        self.application = application;
        self
    }

    pub fn build(self) -> Looper {
        let settings = self
            .settings
            .unwrap_or_else(|| RuntimeConfig::global().looper.clone());
        let name = self.name;
        let behavior = self.behavior;
        let queue = Arc::new(MessageQueue::new(settings.queue_capacity));

        let shared = Arc::new_cyclic(|weak: &Weak<LooperShared>| {
            let root = HandlerRef::from_boxed(name.clone(), behavior);
            root.set_looper(weak.clone());
            LooperShared {
                id: LooperId::new(),
                name,
                settings,
                application: self.application,
                root: root.clone(),
                handlers: Mutex::new(vec![root]),
                preferred: Mutex::new(None),
                common_filters: Mutex::new(FilterList::default()),
                routing: Mutex::new(Routing {
                    proxy: None,
                    clients: Vec::new(),
                    lock: Arc::new(RecursiveLock::new()),
                    queue,
                }),
                resumed: Condvar::new(),
                state: Mutex::new(LooperState::Created),
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
                started: AtomicBool::new(false),
            }
        });

        directory::coarse().register(&shared);
        info!(looper = %shared.id, name = %shared.name, capacity = ?shared.settings.queue_capacity, "Looper created");
        Looper { shared }
    }
}

/// Handle to a looper
#[derive(Clone)]
pub struct Looper {
    shared: Arc<LooperShared>,
}

/// Releases one acquisition of a looper lock on drop
#[must_use = "the looper is unlocked as soon as the guard is dropped"]
pub struct LooperGuard<'a> {
    looper: &'a Looper,
}

impl Drop for LooperGuard<'_> {
    fn drop(&mut self) {
        self.looper.unlock();
    }
}

impl Looper {
    pub fn new(name: impl Into<String>) -> Self {
        LooperBuilder::new(name).build()
    }

    pub fn with_handler(name: impl Into<String>, behavior: impl Handler) -> Self {
        LooperBuilder::new(name).behavior(behavior).build()
    }

    pub fn builder(name: impl Into<String>) -> LooperBuilder {
        LooperBuilder::new(name)
    }

    pub(crate) fn from_shared(shared: Arc<LooperShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<LooperShared> {
        &self.shared
    }

    pub fn id(&self) -> LooperId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LooperState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LooperState::Running
    }

    pub fn is_application(&self) -> bool {
        self.shared.application
    }

    /// Dispatch thread, once `run()` has been called
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.shared.thread_id.lock()
    }

    /// The looper's own handler, first in its chain
    pub fn root_handler(&self) -> HandlerRef {
        self.shared.root.clone()
    }

    /// Messenger targeting this looper's preferred handler
    pub fn messenger(&self) -> Messenger {
        Messenger::for_looper(self)
    }

    // ----- locking --------------------------------------------------------

    pub fn lock(&self) -> Result<LooperGuard<'_>> {
        self.acquire(None)?;
        Ok(LooperGuard { looper: self })
    }

    /// Lock, giving up after `timeout` (`WouldBlock` for a zero timeout)
    pub fn lock_with_timeout(&self, timeout: Duration) -> Result<LooperGuard<'_>> {
        self.acquire(Some(timeout))?;
        Ok(LooperGuard { looper: self })
    }

    fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.shared.is_destroyed() {
                return Err(MessagingError::bad_handler(format!("looper '{}' has quit", self.name())));
            }
            let lock = Arc::clone(&self.shared.routing.lock().lock);
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            lock.acquire(remaining).map_err(|e| match (e, timeout) {
                (MessagingError::WouldBlock(_), Some(t)) if !t.is_zero() => MessagingError::timed_out(t, "looper lock"),
                (e, _) => e,
            })?;
            // A proxy change may have swapped the lock while we waited
            if Arc::ptr_eq(&lock, &self.shared.routing.lock().lock) {
                held::increment(self.id());
                return Ok(());
            }
            lock.release();
        }
    }

    /// Release one acquisition made through this looper
    pub fn unlock(&self) {
        if !held::decrement(self.id()) {
            warn!(looper = %self.id(), name = %self.name(), "unlock() without a matching lock()");
            return;
        }
        let lock = Arc::clone(&self.shared.routing.lock().lock);
        if !lock.release() {
            warn!(looper = %self.id(), name = %self.name(), "Looper lock was not held by this thread");
        }
    }

    /// Unmatched `lock()` calls the calling thread made on this looper
    pub fn count_locks(&self) -> usize {
        held::count(self.id())
    }

    /// True when the calling thread holds this looper's (possibly shared) lock
    pub fn is_locked(&self) -> bool {
        self.shared.routing.lock().lock.held_by_current() > 0
    }

    // ----- posting --------------------------------------------------------

    /// Post `message` to the looper's own handler
    pub fn post_message(&self, mut message: Message) -> Result<()> {
        message.set_target(Target::None);
        enqueue(&self.shared, message, RuntimeConfig::global().messenger.delivery_timeout())
    }

    pub fn post_what(&self, what: u32) -> Result<()> {
        self.post_message(Message::new(what))
    }

    /// Post `message` to `handler`, which must belong to this looper
    pub fn post_message_to(&self, mut message: Message, handler: &HandlerRef) -> Result<()> {
        self.check_member(handler)?;
        message.set_target(Target::Handler(handler.token()));
        enqueue(&self.shared, message, RuntimeConfig::global().messenger.delivery_timeout())
    }

    /// Post `message` to `handler`; replies go to `reply_to`
    pub fn post_message_with_reply(&self, mut message: Message, handler: &HandlerRef, reply_to: &HandlerRef) -> Result<()> {
        self.check_member(handler)?;
        message.set_target(Target::Handler(handler.token()));
        message.set_reply_target(Some(reply_to.token()));
        enqueue(&self.shared, message, RuntimeConfig::global().messenger.delivery_timeout())
    }

    /// Messages queued for this looper and not yet dispatched
    pub fn queue_len(&self) -> usize {
        let queue = Arc::clone(&self.shared.routing.lock().queue);
        queue.count_for(&self.shared)
    }

    fn check_member(&self, handler: &HandlerRef) -> Result<()> {
        if handler.belongs_to(&self.shared) {
            Ok(())
        } else {
            Err(MessagingError::bad_handler(format!(
                "{} does not belong to looper '{}'",
                handler,
                self.name()
            )))
        }
    }

    // ----- handler chain --------------------------------------------------

    /// Append `handler` to the chain
    pub fn add_handler(&self, handler: &HandlerRef) -> Result<()> {
        let _guard = self.lock()?;
        let _directory = directory::coarse();
        if handler.is_attached() {
            return Err(MessagingError::bad_value(format!("{} already belongs to a looper", handler)));
        }
        handler.set_looper(Arc::downgrade(&self.shared));
        self.shared.handlers.lock().push(handler.clone());
        debug!(looper = %self.id(), handler = %handler, "Handler added");
        Ok(())
    }

    /// Detach `handler`; the looper's own handler cannot be removed
    pub fn remove_handler(&self, handler: &HandlerRef) -> bool {
        if handler.ptr_eq(&self.shared.root) {
            warn!(looper = %self.id(), "Refusing to remove the looper's own handler");
            return false;
        }
        let Ok(_guard) = self.lock() else {
            return false;
        };
        let _directory = directory::coarse();
        if !handler.belongs_to(&self.shared) {
            return false;
        }
        {
            let mut chain = self.shared.handlers.lock();
            if let Some(index) = chain.iter().position(|h| h.ptr_eq(handler)) {
                chain.remove(index);
            }
        }
        handler.set_looper(Weak::new());
        let mut preferred = self.shared.preferred.lock();
        if preferred.as_ref().is_some_and(|p| p.ptr_eq(handler)) {
            *preferred = None;
        }
        debug!(looper = %self.id(), handler = %handler, "Handler removed");
        true
    }

    /// Handlers in the chain, including the looper's own
    pub fn count_handlers(&self) -> usize {
        self.shared.handlers.lock().len()
    }

    pub fn handler_at(&self, index: usize) -> Option<HandlerRef> {
        self.shared.handlers.lock().get(index).cloned()
    }

    pub fn index_of(&self, handler: &HandlerRef) -> Option<usize> {
        self.shared.handlers.lock().iter().position(|h| h.ptr_eq(handler))
    }

    pub fn handlers(&self) -> Vec<HandlerRef> {
        self.shared.handlers.lock().clone()
    }

    /// Handler receiving messages posted without an explicit target
    pub fn set_preferred_handler(&self, handler: Option<&HandlerRef>) -> Result<()> {
        if let Some(handler) = handler {
            self.check_member(handler)?;
        }
        *self.shared.preferred.lock() = handler.cloned();
        Ok(())
    }

    pub fn preferred_handler(&self) -> Option<HandlerRef> {
        self.shared.preferred.lock().clone()
    }

    pub(crate) fn next_after(&self, handler: &HandlerRef) -> Option<HandlerRef> {
        let chain = self.shared.handlers.lock();
        let index = chain.iter().position(|h| h.ptr_eq(handler))?;
        chain.get((index + 1) % chain.len()).cloned()
    }

    /// Move `handler` so that `next` directly follows it
    pub(crate) fn splice_before(&self, handler: &HandlerRef, next: &HandlerRef) -> Option<ChainSplice> {
        if handler.ptr_eq(next) || !next.belongs_to(&self.shared) {
            return None;
        }
        let _guard = self.lock().ok()?;
        let mut chain = self.shared.handlers.lock();
        let from = chain.iter().position(|h| h.ptr_eq(handler))?;
        chain.iter().position(|h| h.ptr_eq(next))?;

        let old_next = chain[(from + 1) % chain.len()].clone();
        let moved = chain.remove(from);
        match chain.iter().position(|h| h.ptr_eq(next)) {
            Some(0) | None => chain.push(moved),
            Some(to) => chain.insert(to, moved),
        }
        // The chain is circular; keep the looper's own handler first
        if let Some(root) = chain.iter().position(|h| h.ptr_eq(&self.shared.root)) {
            chain.rotate_left(root);
        }
        Some(ChainSplice {
            old_next,
            new_next: next.clone(),
        })
    }

    // ----- common filters -------------------------------------------------

    /// Attach a filter that runs before any handler-specific filter
    pub fn add_common_filter(&self, filter: MessageFilter) -> FilterId {
        self.shared.common_filters.lock().push(filter)
    }

    pub fn remove_common_filter(&self, id: FilterId) -> Option<MessageFilter> {
        self.shared.common_filters.lock().remove(id)
    }

    pub fn count_common_filters(&self) -> usize {
        self.shared.common_filters.lock().len()
    }

    // ----- proxying -------------------------------------------------------

    pub fn is_proxied(&self) -> bool {
        self.shared.routing.lock().proxy.is_some()
    }

    /// Looper whose thread currently runs this one
    pub fn proxy(&self) -> Option<Looper> {
        self.shared.routing.lock().proxy.clone().map(Looper::from_shared)
    }

    /// Loopers currently merged into this one
    pub fn count_clients(&self) -> usize {
        self.shared
            .routing
            .lock()
            .clients
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Merge this looper into `proxy`, or split it off again with `None`
    ///
    /// # Panics
    ///
    /// If the calling thread does not hold this looper's lock.
    pub fn proxy_by(&self, proxy: Option<&Looper>) -> Result<()> {
        if !self.is_locked() {
            panic!("Looper::proxy_by() on '{}' requires the caller to hold its lock", self.name());
        }
        if self.shared.application {
            return Err(MessagingError::bad_value("the application looper cannot be proxied"));
        }
        if self.shared.is_destroyed() {
            return Err(MessagingError::bad_handler(format!("looper '{}' has quit", self.name())));
        }

        if split_from_proxy(&self.shared) {
            info!(looper = %self.id(), name = %self.name(), "Looper split from its proxy");
        }
        let Some(proxy) = proxy else {
            return Ok(());
        };

        loop {
            let root = proxy.effective_root();
            if Arc::ptr_eq(&root, &self.shared) {
                return Err(MessagingError::bad_value(format!(
                    "proxying '{}' by '{}' would create a cycle",
                    self.name(),
                    proxy.name()
                )));
            }
            let root = Looper::from_shared(root);
            // Blocks until the root's dispatch thread is between messages
            let _root_guard = root.lock()?;
            if root.is_proxied() {
                continue;
            }
            merge_into(&self.shared, &root.shared);
            info!(looper = %self.id(), name = %self.name(), proxy = %root.id(), "Looper merged into proxy");
            return Ok(());
        }
    }

    fn effective_root(&self) -> Arc<LooperShared> {
        self.shared
            .routing
            .lock()
            .proxy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.shared))
    }

    // ----- lifecycle ------------------------------------------------------

    /// Spawn the dispatch thread
    ///
    /// # Panics
    ///
    /// If called more than once on the same looper.
    pub fn run(&self) -> Result<ThreadId> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            panic!("Looper::run() called twice on '{}'", self.name());
        }
        if self.is_proxied() {
            self.shared.started.store(false, Ordering::SeqCst);
            return Err(MessagingError::bad_value(format!(
                "looper '{}' is proxied; its proxy's thread runs it",
                self.name()
            )));
        }
        if self.shared.is_destroyed() {
            return Err(MessagingError::bad_handler(format!("looper '{}' has quit", self.name())));
        }

        let looper = self.clone();
        let handle = thread::Builder::new()
            .name(self.shared.settings.thread_name(self.name()))
            .spawn(move || dispatch::run_loop(looper))
            .map_err(|e| MessagingError::Error(format!("failed to spawn dispatch thread: {}", e)))?;

        let thread_id = handle.thread().id();
        *self.shared.thread_id.lock() = Some(thread_id);
        *self.shared.thread.lock() = Some(handle);
        {
            let mut state = self.shared.state.lock();
            if *state == LooperState::Created {
                *state = LooperState::Running;
            }
        }
        info!(looper = %self.id(), name = %self.name(), "Looper running");
        Ok(thread_id)
    }

    /// Stop the looper and wait for its dispatch thread to exit
    ///
    /// Merged clients are split off first and keep running on their own.
    ///
    /// # Panics
    ///
    /// If called from the looper's own dispatch thread; post
    /// [`QUIT`](codec::constants::QUIT) instead.
    pub fn quit(self) {
        if self.thread_id() == Some(thread::current().id()) {
            panic!(
                "Looper::quit() called on the dispatch thread of '{}'; post QUIT to it instead",
                self.name()
            );
        }
        if self.shared.is_destroyed() {
            debug!(looper = %self.id(), "quit() on a looper that already quit");
            return;
        }
        let Ok(guard) = self.lock() else {
            return;
        };

        if split_from_proxy(&self.shared) {
            info!(looper = %self.id(), name = %self.name(), "Looper split from its proxy before quitting");
        }
        release_clients(&self.shared);
        *self.shared.state.lock() = LooperState::Quitting;

        let handle = self.shared.thread.lock().take();
        let Some(handle) = handle else {
            teardown(&self.shared);
            drop(guard);
            return;
        };

        let queue = Arc::clone(&self.shared.routing.lock().queue);
        if queue.force_push(QueuedMessage::new(&self.shared, Message::new(QUIT))).is_err() {
            debug!(looper = %self.id(), "Queue already closed; dispatch thread is exiting");
        }
        drop(guard);

        // The dispatch thread needs the lock to see QUIT
        let outstanding = held::take(self.id());
        if outstanding > 0 {
            let lock = Arc::clone(&self.shared.routing.lock().lock);
            for _ in 0..outstanding {
                lock.release();
            }
        }

        if handle.join().is_err() {
            warn!(looper = %self.id(), name = %self.name(), "Dispatch thread panicked");
        }
        if !self.shared.is_destroyed() {
            if let Ok(_guard) = self.lock() {
                teardown(&self.shared);
            }
        }
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl PartialEq for Looper {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Looper {}

/// Queue `message` for `destination`, waiting up to `timeout` for space
///
/// The destination's routing mutex is held while pushing, so a concurrent
/// proxy change cannot reorder messages from one thread.
pub(crate) fn enqueue(destination: &Arc<LooperShared>, message: Message, timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut entry = QueuedMessage::new(destination, message);
    loop {
        let queue = {
            let routing = destination.routing.lock();
            let pushed = routing.queue.try_push(entry);
            match pushed {
                Ok(()) => return Ok(()),
                Err(PushError::Closed(rejected)) => {
                    drop(rejected);
                    return Err(MessagingError::bad_handler(format!(
                        "looper '{}' has quit",
                        destination.name()
                    )));
                }
                Err(PushError::Full(rejected)) => {
                    entry = rejected;
                    Arc::clone(&routing.queue)
                }
            }
        };

        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(MessagingError::WouldBlock(format!(
                "queue of looper '{}' is full ({:?} messages)",
                destination.name(),
                queue.capacity()
            )));
        }
        if !queue.wait_for_space(deadline) {
            return Err(MessagingError::timed_out(
                timeout.unwrap_or_default(),
                format!("space in the queue of looper '{}'", destination.name()),
            ));
        }
    }
}

/// True when the calling thread is the one dispatching `looper`'s messages
pub(crate) fn dispatched_by_current_thread(looper: &Arc<LooperShared>) -> bool {
    let root = looper
        .routing
        .lock()
        .proxy
        .clone()
        .unwrap_or_else(|| Arc::clone(looper));
    let dispatcher = *root.thread_id.lock();
    dispatcher == Some(thread::current().id())
}

/// Hand `n` acquisitions made by this thread from one lock to another
///
/// `to` is either private to this thread or already held by it, so acquiring
/// it never blocks.
fn transfer_locks(from: &RecursiveLock, to: &RecursiveLock, n: usize) {
    for _ in 0..n {
        if let Err(e) = to.acquire(None) {
            warn!(error = %e, "Lock transfer failed");
        }
    }
    for _ in 0..n {
        from.release();
    }
}

/// Merge `client` (and anything already merged into it) into `root`
///
/// The caller holds both loopers' locks.
fn merge_into(client: &Arc<LooperShared>, root: &Arc<LooperShared>) {
    let (old_lock, new_lock) = {
        let _directory = directory::coarse();
        let mut mine = client.routing.lock();
        let mut theirs = root.routing.lock();
        let new_lock = Arc::clone(&theirs.lock);
        let new_queue = Arc::clone(&theirs.queue);

        mine.queue.drain_into(&new_queue);
        let old_lock = std::mem::replace(&mut mine.lock, Arc::clone(&new_lock));
        mine.queue = Arc::clone(&new_queue);
        mine.proxy = Some(Arc::clone(root));
        theirs.clients.push(Arc::downgrade(client));

        for nested in mine.clients.drain(..).filter_map(|c| c.upgrade()) {
            let mut routing = nested.routing.lock();
            routing.lock = Arc::clone(&new_lock);
            routing.queue = Arc::clone(&new_queue);
            routing.proxy = Some(Arc::clone(root));
            theirs.clients.push(Arc::downgrade(&nested));
        }
        (old_lock, new_lock)
    };

    let held = old_lock.held_by_current();
    transfer_locks(&old_lock, &new_lock, held);
}

/// Give a proxied looper its own lock and queue back; false if not proxied
///
/// The calling thread holds the shared lock. Its acquisitions made through
/// `client` move to the new lock; messages queued for `client` move to the new
/// queue in order.
pub(crate) fn split_from_proxy(client: &Arc<LooperShared>) -> bool {
    if client.routing.lock().proxy.is_none() {
        return false;
    }
    let held = held::count(client.id());
    let new_lock = Arc::new(RecursiveLock::new());
    for _ in 0..held {
        if let Err(e) = new_lock.acquire(None) {
            warn!(error = %e, "Acquiring a fresh looper lock failed");
        }
    }

    let old_lock = {
        let _directory = directory::coarse();
        let mut mine = client.routing.lock();
        let Some(root) = mine.proxy.take() else {
            return false;
        };
        let new_queue = Arc::new(MessageQueue::new(client.settings.queue_capacity));
        {
            let mut theirs = root.routing.lock();
            theirs
                .clients
                .retain(|c| c.strong_count() > 0 && !std::ptr::eq(c.as_ptr(), Arc::as_ptr(client)));
            theirs.queue.extract_for(client, &new_queue);
        }
        mine.queue = new_queue;
        std::mem::replace(&mut mine.lock, new_lock)
    };

    for _ in 0..held {
        old_lock.release();
    }
    client.resumed.notify_all();
    true
}

/// Split every client off `root`
pub(crate) fn release_clients(root: &Arc<LooperShared>) {
    let clients: Vec<Arc<LooperShared>> = root
        .routing
        .lock()
        .clients
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for client in clients {
        if split_from_proxy(&client) {
            info!(looper = %client.id, proxy = %root.id, "Client looper released");
        }
    }
}

/// Stop a client looper that received QUIT while merged
pub(crate) fn quit_client(client: &Looper, quit: Message) {
    split_from_proxy(&client.shared);
    if client.shared.has_thread() {
        let queue = Arc::clone(&client.shared.routing.lock().queue);
        if queue.force_push(QueuedMessage::new(&client.shared, quit)).is_err() {
            debug!(looper = %client.id(), "Client queue already closed");
        }
    } else if let Ok(_guard) = client.lock() {
        teardown(&client.shared);
    }
}

/// Final stage of quitting; the caller holds the looper's lock
pub(crate) fn teardown(shared: &Arc<LooperShared>) {
    release_clients(shared);
    split_from_proxy(shared);
    *shared.state.lock() = LooperState::Destroyed;

    let undelivered = {
        let queue = Arc::clone(&shared.routing.lock().queue);
        queue.close()
    };
    shared.resumed.notify_all();

    let leaked = {
        let mut directory = directory::coarse();
        directory.unregister(shared.id);
        let mut chain = shared.handlers.lock();
        let leaked: Vec<HandlerRef> = chain.drain(..).filter(|h| !h.ptr_eq(&shared.root)).collect();
        chain.push(shared.root.clone());
        for handler in &leaked {
            handler.set_looper(Weak::new());
        }
        *shared.preferred.lock() = None;
        leaked
    };

    for handler in &leaked {
        warn!(looper = %shared.id, handler = %handler, "Handler still attached at teardown; detaching it");
    }
    if !undelivered.is_empty() {
        debug!(looper = %shared.id, count = undelivered.len(), "Discarding undelivered messages");
    }
    drop(undelivered);
    drop(leaked);
    info!(looper = %shared.id, name = %shared.name, "Looper destroyed");
}
