//! Handlers
//!
//! A handler is an addressable unit of message-receiving logic. Its identity
//! ([`HandlerRef`]) is shared; its behavior (a [`Handler`] implementation) is
//! only ever run on the dispatch thread of the looper it belongs to.
//!
//! Every handler is registered in the process-wide token table when it is
//! created and revoked when the last [`HandlerRef`] goes away, so messengers
//! and queued messages address it by token rather than by reference.

use codec::constants::{self, fields, MESSAGE_NOT_UNDERSTOOD, START_WATCHING, STOP_WATCHING};
use codec::{format_what, Message, Token};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::filter::{FilterId, FilterList, MessageFilter};
use crate::looper::{Looper, LooperShared};
use crate::messenger::Messenger;
use crate::observer::ObserverList;
use crate::registry::HANDLER_TOKENS;
use crate::reply::Reply;

/// Message-receiving behavior
pub trait Handler: Send + 'static {
    /// Called on the dispatch thread for every message routed to this handler
    fn message_received(&mut self, message: &mut Message, ctx: &mut Dispatch<'_>) {
        default_message_received(message, ctx);
    }

    /// Asked when the looper receives `QUIT_REQUESTED`; `true` lets it quit
    fn quit_requested(&mut self) -> bool {
        true
    }
}

/// Behavior that relies entirely on [`default_message_received`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}

/// Adapts a closure into a [`Handler`]
pub struct FnHandler<F>(pub F);

impl<F> Handler for FnHandler<F>
where
    F: FnMut(&mut Message, &mut Dispatch<'_>) + Send + 'static,
{
    fn message_received(&mut self, message: &mut Message, ctx: &mut Dispatch<'_>) {
        (self.0)(message, ctx)
    }
}

/// Fallback processing for messages a handler does not understand
///
/// Private (`'_xxx'`) codes are dropped, remote watch requests are served,
/// anything else moves on to the next handler. At the looper's own handler
/// the chain ends: an awaited message is answered with
/// `MESSAGE_NOT_UNDERSTOOD`.
pub fn default_message_received(message: &mut Message, ctx: &mut Dispatch<'_>) {
    match message.what() {
        START_WATCHING | STOP_WATCHING => {
            serve_watch_request(message, ctx.handler());
            return;
        }
        what if constants::is_private_what(what) => {
            trace!(what = %format_what(what), "Dropping private message");
            return;
        }
        _ => {}
    }

    if !ctx.is_looper_handler() {
        ctx.pass_to_next(message);
        return;
    }

    if message.expects_reply() && !message.was_replied() {
        if let Err(e) = message.send_reply(Message::new(MESSAGE_NOT_UNDERSTOOD)) {
            debug!(error = %e, "Could not answer unhandled message");
        }
    }
}

fn serve_watch_request(message: &Message, handler: &HandlerRef) {
    let observer = match message.find::<Messenger>(fields::OBSERVE_OBSERVER, 0) {
        Ok(observer) => observer,
        Err(e) => {
            debug!(error = %e, "Watch request without an observer");
            return;
        }
    };
    let what = match message.find::<i32>(fields::OBSERVE_CHANGE_WHAT, 0) {
        Ok(what) => what as u32,
        Err(e) => {
            debug!(error = %e, "Watch request without a what code");
            return;
        }
    };

    let result = if message.what() == START_WATCHING {
        handler.start_watching(observer, what)
    } else {
        handler.stop_watching(&observer, what)
    };
    if let Err(e) = result {
        debug!(error = %e, handler = %handler, "Watch request rejected");
    }
}

pub(crate) struct HandlerNode {
    token: Token,
    name: Mutex<String>,
    looper: Mutex<Weak<LooperShared>>,
    pub(crate) filters: Mutex<FilterList>,
    pub(crate) observers: Mutex<Option<ObserverList>>,
    behavior: Mutex<Box<dyn Handler>>,
}

impl Drop for HandlerNode {
    fn drop(&mut self) {
        HANDLER_TOKENS.revoke(self.token);
        let filters = self.filters.get_mut();
        if !filters.is_empty() {
            debug!(token = %self.token, count = filters.len(), "Deleting filters of dropped handler");
        }
    }
}

/// Shared handle to a handler
#[derive(Clone)]
pub struct HandlerRef(Arc<HandlerNode>);

impl HandlerRef {
    pub fn new(name: impl Into<String>, behavior: impl Handler) -> Self {
        Self::from_boxed(name.into(), Box::new(behavior))
    }

    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut Message, &mut Dispatch<'_>) + Send + 'static,
    {
        Self::new(name, FnHandler(f))
    }

    pub(crate) fn from_boxed(name: String, behavior: Box<dyn Handler>) -> Self {
        let node = Arc::new_cyclic(|weak| HandlerNode {
            token: HANDLER_TOKENS.register(weak.clone()),
            name: Mutex::new(name),
            looper: Mutex::new(Weak::new()),
            filters: Mutex::new(FilterList::default()),
            observers: Mutex::new(None),
            behavior: Mutex::new(behavior),
        });
        Self(node)
    }

    /// Live handler for `token`
    pub fn resolve(token: Token) -> Option<HandlerRef> {
        HANDLER_TOKENS.resolve(token).map(HandlerRef)
    }

    pub fn token(&self) -> Token {
        self.0.token
    }

    pub fn name(&self) -> String {
        self.0.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.lock() = name.into();
    }

    /// Looper this handler is attached to
    pub fn looper(&self) -> Option<Looper> {
        self.looper_shared().map(Looper::from_shared)
    }

    pub fn is_attached(&self) -> bool {
        self.0.looper.lock().strong_count() > 0
    }

    pub fn ptr_eq(&self, other: &HandlerRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Handler that follows this one in its looper's chain
    pub fn next_handler(&self) -> Option<HandlerRef> {
        self.looper()?.next_after(self)
    }

    /// Reorder the chain so that `next` directly follows this handler
    ///
    /// Returns the neighbors before and after the change, or `None` when the
    /// two handlers do not share a looper.
    pub fn set_next_handler(&self, next: &HandlerRef) -> Option<ChainSplice> {
        self.looper()?.splice_before(self, next)
    }

    // ----- filters --------------------------------------------------------

    /// Attach `filter`; it runs before this handler's `message_received`
    pub fn add_filter(&self, filter: MessageFilter) -> FilterId {
        self.0.filters.lock().push(filter)
    }

    /// Detach a filter, handing it back to the caller
    pub fn remove_filter(&self, id: FilterId) -> Option<MessageFilter> {
        self.0.filters.lock().remove(id)
    }

    pub fn count_filters(&self) -> usize {
        self.0.filters.lock().len()
    }

    // ----- crate internals ------------------------------------------------

    pub(crate) fn looper_shared(&self) -> Option<Arc<LooperShared>> {
        self.0.looper.lock().upgrade()
    }

    pub(crate) fn belongs_to(&self, looper: &Arc<LooperShared>) -> bool {
        std::ptr::eq(self.0.looper.lock().as_ptr(), Arc::as_ptr(looper))
    }

    pub(crate) fn set_looper(&self, looper: Weak<LooperShared>) {
        *self.0.looper.lock() = looper;
    }

    pub(crate) fn node(&self) -> &HandlerNode {
        &self.0
    }

    /// Run `message_received` on this handler
    ///
    /// A handler that is already running further up the stack (a cycle of
    /// `pass_to_next` calls) is skipped.
    pub(crate) fn invoke(&self, message: &mut Message, looper: &Looper) -> bool {
        let Some(mut behavior) = self.0.behavior.try_lock() else {
            warn!(handler = %self, what = %format_what(message.what()), "Skipping re-entrant dispatch");
            return false;
        };
        let mut ctx = Dispatch {
            looper,
            handler: self,
        };
        behavior.message_received(message, &mut ctx);
        true
    }

    pub(crate) fn invoke_quit_requested(&self) -> bool {
        match self.0.behavior.try_lock() {
            Some(mut behavior) => behavior.quit_requested(),
            None => {
                warn!(handler = %self, "quit_requested while handler is busy; refusing");
                false
            }
        }
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for HandlerRef {}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef")
            .field("name", &*self.0.name.lock())
            .field("token", &self.0.token)
            .finish()
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0.name.lock(), self.0.token)
    }
}

/// Neighbors of a handler before and after [`HandlerRef::set_next_handler`]
#[derive(Debug, Clone)]
pub struct ChainSplice {
    pub old_next: HandlerRef,
    pub new_next: HandlerRef,
}

/// Context handed to [`Handler::message_received`]
pub struct Dispatch<'a> {
    looper: &'a Looper,
    handler: &'a HandlerRef,
}

impl<'a> Dispatch<'a> {
    /// Looper the handler belongs to (not the proxy whose thread runs it)
    pub fn looper(&self) -> &Looper {
        self.looper
    }

    pub fn handler(&self) -> &HandlerRef {
        self.handler
    }

    /// True when the receiving handler is the looper's own handler
    pub fn is_looper_handler(&self) -> bool {
        self.looper.root_handler().ptr_eq(self.handler)
    }

    /// Hand `message` to the next handler in the chain
    pub fn pass_to_next(&mut self, message: &mut Message) -> bool {
        match self.handler.next_handler() {
            Some(next) if !next.ptr_eq(self.handler) => next.invoke(message, self.looper),
            _ => false,
        }
    }

    /// Take ownership of the message beyond this callback
    ///
    /// The dispatch loop is left with an empty placeholder; a waiting sender
    /// stays blocked until the detached message is answered or dropped.
    pub fn detach(&mut self, message: &mut Message) -> Message {
        let what = message.what();
        std::mem::replace(message, Message::new(what))
    }

    /// Answer `message`, naming this handler as the target of further replies
    pub fn reply(&self, message: &mut Message, mut reply: Message) -> codec::Result<()> {
        reply.set_reply_target(Some(self.handler.token()));
        message.send_reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::ReplyPort;
    use std::time::Duration;

    #[test]
    fn test_token_revoked_on_drop() {
        let handler = HandlerRef::new("short-lived", DefaultHandler);
        let token = handler.token();
        assert!(HandlerRef::resolve(token).is_some_and(|h| h.ptr_eq(&handler)));

        drop(handler);
        assert!(HandlerRef::resolve(token).is_none());
    }

    #[test]
    fn test_unattached_handler() {
        let handler = HandlerRef::from_fn("loose", |_msg, _ctx| {});
        assert!(!handler.is_attached());
        assert!(handler.looper().is_none());
        assert!(handler.next_handler().is_none());
        assert!(handler.set_next_handler(&HandlerRef::new("other", DefaultHandler)).is_none());
    }

    #[test]
    fn test_rename() {
        let handler = HandlerRef::new("before", DefaultHandler);
        handler.set_name("after");
        assert_eq!(handler.name(), "after");
        assert!(handler.to_string().starts_with("after("));
    }

    #[test]
    fn test_looper_handler_answers_not_understood() {
        let looper = Looper::new("default-reply");
        let port = ReplyPort::open();
        let mut message = Message::new(0x5151);
        message.attach_reply_port(port.id());

        let root = looper.root_handler();
        assert!(root.invoke(&mut message, &looper));
        drop(message);

        let reply = port.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(reply.what(), MESSAGE_NOT_UNDERSTOOD);
        looper.quit();
    }
}
