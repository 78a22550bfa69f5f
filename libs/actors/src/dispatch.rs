//! Dispatch loop
//!
//! Runs on the thread spawned by [`Looper::run`]. Each iteration waits for a
//! message, takes the looper lock, pops one entry and routes it:
//!
//! ```text
//! pop ─► QUIT? ─► resolve target ─► common filters ─► handler filters ─► message_received
//! ```
//!
//! While the looper is merged into a proxy its thread parks; the proxy's
//! thread delivers its messages instead.

use codec::constants::{fields, QUIT, QUIT_REQUESTED, REPLY};
use codec::{format_what, Message, Target};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::directory;
use crate::filter::FilterResult;
use crate::handler::HandlerRef;
use crate::looper::{quit_client, teardown, Looper, LooperShared};
use crate::queue::{MessageQueue, QueuedMessage, WaitOutcome};
use crate::reply::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Exit,
}

/// Records the calling thread as the looper's dispatch thread until dropped
struct ThreadBinding {
    thread: ThreadId,
}

impl ThreadBinding {
    fn bind(looper: &Looper) -> Self {
        let thread = thread::current().id();
        *looper.shared().thread_id.lock() = Some(thread);
        directory::coarse().bind_thread(thread, looper.id());
        Self { thread }
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        directory::coarse().unbind_thread(self.thread);
    }
}

pub(crate) fn run_loop(looper: Looper) {
    let _binding = ThreadBinding::bind(&looper);
    let idle = looper.shared().settings.idle_wait();
    debug!(looper = %looper.id(), name = %looper.name(), "Dispatch loop started");

    loop {
        let Some(queue) = wait_until_standalone(looper.shared(), idle) else {
            break;
        };
        match queue.wait_for_message(idle) {
            WaitOutcome::Ready => {}
            WaitOutcome::Idle => continue,
            // Closed by a merge (we park next round) or by teardown
            WaitOutcome::Closed => {
                if looper.shared().is_destroyed() {
                    break;
                }
                continue;
            }
        }

        let guard = match looper.lock() {
            Ok(guard) => guard,
            Err(e) => {
                debug!(looper = %looper.id(), error = %e, "Dispatch loop lost its looper");
                break;
            }
        };
        let step = dispatch_next(&looper);
        drop(guard);
        if step == Step::Exit {
            break;
        }
    }

    info!(looper = %looper.id(), name = %looper.name(), "Dispatch loop exited");
}

/// Park while merged into a proxy; the queue to serve once standalone
fn wait_until_standalone(shared: &Arc<LooperShared>, idle: Duration) -> Option<Arc<MessageQueue>> {
    let mut routing = shared.routing.lock();
    loop {
        if shared.is_destroyed() {
            return None;
        }
        if routing.proxy.is_none() {
            return Some(Arc::clone(&routing.queue));
        }
        shared.resumed.wait_for(&mut routing, idle);
    }
}

/// Deliver one queued message; the caller holds the looper lock
fn dispatch_next(looper: &Looper) -> Step {
    let shared = looper.shared();
    let queue = {
        let routing = shared.routing.lock();
        // Merged since the wait returned; the proxy owns the queue now
        if routing.proxy.is_some() {
            return Step::Continue;
        }
        Arc::clone(&routing.queue)
    };
    let Some(QueuedMessage { destination, message }) = queue.pop() else {
        return Step::Continue;
    };
    let Some(destination) = destination.upgrade() else {
        trace!(what = %format_what(message.what()), "Dropping message for a looper that no longer exists");
        return Step::Continue;
    };
    let destination = Looper::from_shared(destination);
    let is_self = destination == *looper;

    if message.what() == QUIT {
        if is_self {
            teardown(shared);
            return Step::Exit;
        }
        quit_client(&destination, message);
        return Step::Continue;
    }

    // Merged clients share our lock, so this is a re-entrant acquisition
    let _client_guard = if is_self {
        None
    } else {
        match destination.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                debug!(looper = %destination.id(), error = %e, "Dropping message for a quitting client");
                return Step::Continue;
            }
        }
    };

    if !deliver(&destination, message) {
        return Step::Continue;
    }
    if is_self {
        teardown(shared);
        return Step::Exit;
    }
    quit_client(&destination, Message::new(QUIT));
    Step::Continue
}

/// Route `message` to its handler; true when an accepted `QUIT_REQUESTED` asks the looper to quit
fn deliver(looper: &Looper, mut message: Message) -> bool {
    let Some(mut target) = resolve_target(looper, &message) else {
        debug!(
            looper = %looper.id(),
            what = %format_what(message.what()),
            target = ?message.target(),
            "Dropping message for a handler that left the looper"
        );
        return false;
    };
    if !filter_message(looper, &mut message, &mut target) {
        return false;
    }

    if message.what() == QUIT_REQUESTED && target.ptr_eq(&looper.root_handler()) {
        let accepted = target.invoke_quit_requested();
        debug!(looper = %looper.id(), accepted, "Quit requested");
        if message.expects_reply() {
            let mut reply = Message::new(REPLY);
            if let Err(e) = reply.add(fields::RESULT, accepted) {
                warn!(error = %e, "Failed to build quit reply");
            }
            if let Err(e) = message.send_reply(reply) {
                debug!(error = %e, "Could not answer quit request");
            }
        }
        return accepted;
    }

    trace!(looper = %looper.id(), handler = %target, what = %format_what(message.what()), "Dispatching");
    target.invoke(&mut message, looper);
    false
}

fn resolve_target(looper: &Looper, message: &Message) -> Option<HandlerRef> {
    match message.target() {
        Target::None => Some(looper.root_handler()),
        Target::Preferred => Some(looper.preferred_handler().unwrap_or_else(|| looper.root_handler())),
        Target::Handler(token) => HandlerRef::resolve(token).filter(|handler| handler.belongs_to(looper.shared())),
    }
}

/// Run common filters, then the target's filters until the target settles
///
/// Filters may redirect the message to another handler of the same looper;
/// that handler's filters run next. Returns false if the message is dropped.
fn filter_message(looper: &Looper, message: &mut Message, target: &mut HandlerRef) -> bool {
    let shared = looper.shared();

    let mut common = std::mem::take(&mut *shared.common_filters.lock());
    let result = common.run(message, target);
    shared.common_filters.lock().restore(common);
    if result == FilterResult::Skip {
        return false;
    }

    // Each handler can be visited once before the redirects count as a loop
    for _ in 0..=looper.count_handlers() {
        if !target.belongs_to(shared) {
            debug!(looper = %looper.id(), handler = %target, "Filter redirected outside the looper; dropping");
            return false;
        }
        let current = target.clone();
        let mut filters = std::mem::take(&mut *current.node().filters.lock());
        let result = filters.run(message, target);
        current.node().filters.lock().restore(filters);

        if result == FilterResult::Skip {
            return false;
        }
        if target.ptr_eq(&current) {
            return true;
        }
    }

    warn!(looper = %looper.id(), what = %format_what(message.what()), "Filters keep redirecting; dropping message");
    false
}
