//! Message Filters
//!
//! A filter is a predicate (delivery kind, source, `what`) plus up to two
//! callbacks: a plain hook closure and an overridable [`Filter`] object.
//! When the predicate matches, the hook runs first and then the filter
//! object; either may redirect the message to another handler or veto it.
//! Filters are owned by exactly one handler or looper at a time, which the
//! by-value `add_filter`/`remove_filter` API enforces.

use codec::Message;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::handler::HandlerRef;

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// How the message reached this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageDelivery {
    #[default]
    Any,
    /// Posted directly as a live message
    Local,
    /// Reconstructed from a flattened blob
    Remote,
}

/// Which process built the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageSource {
    #[default]
    Any,
    Local,
    Remote,
}

/// Verdict of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Skip,
    Dispatch,
}

/// Overridable filter behavior
pub trait Filter: Send + 'static {
    fn filter(&mut self, message: &mut Message, target: &mut HandlerRef) -> FilterResult;
}

type FilterHook = Box<dyn FnMut(&mut Message, &mut HandlerRef) -> FilterResult + Send>;

/// Handle to an attached filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

pub struct MessageFilter {
    delivery: MessageDelivery,
    source: MessageSource,
    what: Option<u32>,
    hook: Option<FilterHook>,
    filter: Option<Box<dyn Filter>>,
    attached: bool,
}

impl MessageFilter {
    /// Filter matching every command
    pub fn new(delivery: MessageDelivery, source: MessageSource) -> Self {
        Self {
            delivery,
            source,
            what: None,
            hook: None,
            filter: None,
            attached: false,
        }
    }

    /// Filter matching one command from any source
    pub fn for_what(what: u32) -> Self {
        Self::new(MessageDelivery::Any, MessageSource::Any).with_what(what)
    }

    pub fn with_what(mut self, what: u32) -> Self {
        self.what = Some(what);
        self
    }

    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut Message, &mut HandlerRef) -> FilterResult + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn with_filter(mut self, filter: impl Filter) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn delivery(&self) -> MessageDelivery {
        self.delivery
    }

    pub fn source(&self) -> MessageSource {
        self.source
    }

    /// Command this filter is restricted to, `None` for any
    pub fn command(&self) -> Option<u32> {
        self.what
    }

    pub fn filters_any_command(&self) -> bool {
        self.what.is_none()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Predicate half of the filter
    pub fn matches(&self, message: &Message) -> bool {
        if self.what.is_some_and(|what| what != message.what()) {
            return false;
        }
        let delivery_ok = match self.delivery {
            MessageDelivery::Any => true,
            MessageDelivery::Local => !message.was_unflattened(),
            MessageDelivery::Remote => message.was_unflattened(),
        };
        let source_ok = match self.source {
            MessageSource::Any => true,
            MessageSource::Local => !message.is_remote(),
            MessageSource::Remote => message.is_remote(),
        };
        delivery_ok && source_ok
    }

    /// Run the filter against `message`; an unattached filter always skips
    pub fn do_filter(&mut self, message: &mut Message, target: &mut HandlerRef) -> FilterResult {
        if !self.attached {
            return FilterResult::Skip;
        }
        if !self.matches(message) {
            return FilterResult::Dispatch;
        }
        if let Some(hook) = self.hook.as_mut() {
            if hook(message, target) == FilterResult::Skip {
                return FilterResult::Skip;
            }
        }
        match self.filter.as_mut() {
            Some(filter) => filter.filter(message, target),
            None => FilterResult::Dispatch,
        }
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilter")
            .field("delivery", &self.delivery)
            .field("source", &self.source)
            .field("what", &self.what)
            .field("hook", &self.hook.is_some())
            .field("filter", &self.filter.is_some())
            .field("attached", &self.attached)
            .finish()
    }
}

/// Ordered filters owned by one handler or looper
#[derive(Debug, Default)]
pub(crate) struct FilterList {
    entries: Vec<(FilterId, MessageFilter)>,
}

impl FilterList {
    pub(crate) fn push(&mut self, mut filter: MessageFilter) -> FilterId {
        let id = FilterId(NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed));
        filter.attached = true;
        self.entries.push((id, filter));
        id
    }

    pub(crate) fn remove(&mut self, id: FilterId) -> Option<MessageFilter> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        let (_, mut filter) = self.entries.remove(index);
        filter.attached = false;
        Some(filter)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every filter in order until one skips
    pub(crate) fn run(&mut self, message: &mut Message, target: &mut HandlerRef) -> FilterResult {
        for (id, filter) in self.entries.iter_mut() {
            if filter.do_filter(message, target) == FilterResult::Skip {
                trace!(filter = ?id, "Filter skipped message");
                return FilterResult::Skip;
            }
        }
        FilterResult::Dispatch
    }

    /// Put back a list taken out for a filter pass, keeping filters added meanwhile
    pub(crate) fn restore(&mut self, mut taken: FilterList) {
        taken.entries.append(&mut self.entries);
        *self = taken;
    }
}
