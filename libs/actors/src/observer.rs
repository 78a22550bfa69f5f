//! Observers
//!
//! A handler keeps a lazily created list of messengers that want to hear
//! about state changes. A messenger either watches specific `what` codes or
//! watches everything; in the latter mode `stop_watching(what)` records an
//! exclusion instead of removing the registration.

use codec::constants::{fields, OBSERVER_NOTICE_CHANGE, OBSERVE_ALL, START_WATCHING, STOP_WATCHING};
use codec::{MessagingError, Message, Result};
use looper_config::RuntimeConfig;
use std::collections::HashSet;
use tracing::debug;

use crate::handler::HandlerRef;
use crate::messenger::Messenger;

#[derive(Debug, Default)]
pub(crate) struct ObserverList {
    specific: Vec<(u32, Vec<Messenger>)>,
    watch_all: Vec<(Messenger, HashSet<u32>)>,
}

impl ObserverList {
    pub(crate) fn start_watching(&mut self, observer: Messenger, what: u32) {
        if what == OBSERVE_ALL {
            return self.start_watching_all(observer);
        }
        self.watch_all.retain(|(m, _)| *m != observer);
        match self.specific.iter_mut().find(|(w, _)| *w == what) {
            Some((_, observers)) => {
                if !observers.contains(&observer) {
                    observers.push(observer);
                }
            }
            None => self.specific.push((what, vec![observer])),
        }
    }

    pub(crate) fn start_watching_all(&mut self, observer: Messenger) {
        self.remove_specific(&observer);
        match self.watch_all.iter_mut().find(|(m, _)| *m == observer) {
            Some((_, excluded)) => excluded.clear(),
            None => self.watch_all.push((observer, HashSet::new())),
        }
    }

    pub(crate) fn stop_watching(&mut self, observer: &Messenger, what: u32) {
        if what == OBSERVE_ALL {
            return self.stop_watching_all(observer);
        }
        if let Some((_, excluded)) = self.watch_all.iter_mut().find(|(m, _)| m == observer) {
            excluded.insert(what);
        }
        for (w, observers) in self.specific.iter_mut() {
            if *w == what {
                observers.retain(|m| m != observer);
            }
        }
        self.specific.retain(|(_, observers)| !observers.is_empty());
    }

    pub(crate) fn stop_watching_all(&mut self, observer: &Messenger) {
        self.watch_all.retain(|(m, _)| m != observer);
        self.remove_specific(observer);
    }

    /// Every messenger that should hear about `what`, without duplicates
    pub(crate) fn observers_for(&self, what: u32) -> Vec<Messenger> {
        let mut observers: Vec<Messenger> = self
            .specific
            .iter()
            .filter(|(w, _)| *w == what)
            .flat_map(|(_, observers)| observers.iter().copied())
            .collect();
        for (observer, excluded) in &self.watch_all {
            if !excluded.contains(&what) && !observers.contains(observer) {
                observers.push(*observer);
            }
        }
        observers
    }

    pub(crate) fn is_watched(&self, what: u32) -> bool {
        !self.observers_for(what).is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.specific.is_empty() && self.watch_all.is_empty()
    }

    fn remove_specific(&mut self, observer: &Messenger) {
        for (_, observers) in self.specific.iter_mut() {
            observers.retain(|m| m != observer);
        }
        self.specific.retain(|(_, observers)| !observers.is_empty());
    }
}

impl HandlerRef {
    /// Register `observer` for notices about `what` (`OBSERVE_ALL` for every code)
    pub fn start_watching(&self, observer: Messenger, what: u32) -> Result<()> {
        if !observer.is_valid() {
            return Err(MessagingError::bad_handler("observer messenger is not valid"));
        }
        self.node()
            .observers
            .lock()
            .get_or_insert_with(ObserverList::default)
            .start_watching(observer, what);
        Ok(())
    }

    pub fn start_watching_all(&self, observer: Messenger) -> Result<()> {
        self.start_watching(observer, OBSERVE_ALL)
    }

    pub fn stop_watching(&self, observer: &Messenger, what: u32) -> Result<()> {
        let mut observers = self.node().observers.lock();
        let list = observers
            .as_mut()
            .ok_or_else(|| MessagingError::bad_value("handler has no observers"))?;
        list.stop_watching(observer, what);
        if list.is_empty() {
            *observers = None;
        }
        Ok(())
    }

    pub fn stop_watching_all(&self, observer: &Messenger) -> Result<()> {
        self.stop_watching(observer, OBSERVE_ALL)
    }

    /// True when at least one observer would receive a notice for `what`
    pub fn is_watched(&self, what: u32) -> bool {
        self.node()
            .observers
            .lock()
            .as_ref()
            .map(|list| list.is_watched(what))
            .unwrap_or(false)
    }

    /// Notify observers of a change, optionally carrying `notice` as payload
    ///
    /// Delivery is best effort with a short timeout. Observers whose handler
    /// or looper is gone are unregistered. Returns the number of observers
    /// that accepted the notice.
    pub fn send_notices(&self, what: u32, notice: Option<&Message>) -> usize {
        let observers = match self.node().observers.lock().as_ref() {
            Some(list) => list.observers_for(what),
            None => return 0,
        };
        if observers.is_empty() {
            return 0;
        }

        let mut payload = match notice {
            Some(original) => {
                let mut copy = original.clone();
                if let Err(e) = copy.add(fields::OBSERVE_ORIGINAL_WHAT, original.what() as i32) {
                    debug!(error = %e, "Could not tag notice with its original what");
                }
                copy
            }
            None => Message::new(OBSERVER_NOTICE_CHANGE),
        };
        payload.set_what(OBSERVER_NOTICE_CHANGE);
        if let Err(e) = payload.add(fields::OBSERVE_CHANGE_WHAT, what as i32) {
            debug!(error = %e, "Could not tag notice with its change code");
        }

        let timeout = RuntimeConfig::global().observer.notice_timeout();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for observer in observers {
            match observer.send_message_timeout(payload.clone(), timeout) {
                Ok(()) => delivered += 1,
                Err(MessagingError::BadHandler(reason)) => {
                    debug!(handler = %self, %reason, "Pruning dead observer");
                    dead.push(observer);
                }
                Err(e) => debug!(handler = %self, error = %e, "Notice not delivered"),
            }
        }

        if !dead.is_empty() {
            let mut observers = self.node().observers.lock();
            if let Some(list) = observers.as_mut() {
                for observer in &dead {
                    list.stop_watching_all(observer);
                }
                if list.is_empty() {
                    *observers = None;
                }
            }
        }
        delivered
    }

    /// Ask the handler behind `target` to send this handler notices about `what`
    pub fn request_watching(&self, target: &Messenger, what: u32) -> Result<()> {
        self.send_watch_request(target, START_WATCHING, what)
    }

    pub fn request_watching_all(&self, target: &Messenger) -> Result<()> {
        self.send_watch_request(target, START_WATCHING, OBSERVE_ALL)
    }

    pub fn request_stop_watching(&self, target: &Messenger, what: u32) -> Result<()> {
        self.send_watch_request(target, STOP_WATCHING, what)
    }

    pub fn request_stop_watching_all(&self, target: &Messenger) -> Result<()> {
        self.send_watch_request(target, STOP_WATCHING, OBSERVE_ALL)
    }

    fn send_watch_request(&self, target: &Messenger, request: u32, what: u32) -> Result<()> {
        let observer = Messenger::for_handler(self, None)?;
        let mut message = Message::new(request);
        message.add(fields::OBSERVE_OBSERVER, observer)?;
        message.add(fields::OBSERVE_CHANGE_WHAT, what as i32)?;
        target.send_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{current_team, Token};

    fn messenger(id: u64) -> Messenger {
        Messenger::from_raw(current_team(), Some(Token::new(id, 1)), false)
    }

    #[test]
    fn test_specific_watch() {
        let mut list = ObserverList::default();
        list.start_watching(messenger(1), 10);
        list.start_watching(messenger(1), 10);
        assert_eq!(list.observers_for(10), vec![messenger(1)]);
        assert!(list.observers_for(11).is_empty());

        list.stop_watching(&messenger(1), 10);
        assert!(list.is_empty());
    }

    #[test]
    fn test_watch_all_exclusions() {
        let mut list = ObserverList::default();
        list.start_watching_all(messenger(1));
        list.stop_watching(&messenger(1), 20);

        assert!(list.is_watched(21));
        assert!(!list.is_watched(20));
        assert_eq!(list.observers_for(99), vec![messenger(1)]);

        list.start_watching_all(messenger(1));
        assert!(list.is_watched(20));
    }

    #[test]
    fn test_modes_are_exclusive() {
        let mut list = ObserverList::default();
        list.start_watching(messenger(2), 5);
        list.start_watching_all(messenger(2));
        list.stop_watching(&messenger(2), 5);
        assert!(!list.is_watched(5));
        assert!(list.is_watched(6));

        list.start_watching(messenger(2), 7);
        assert!(!list.is_watched(6));
        assert!(list.is_watched(7));
    }

    #[test]
    fn test_no_duplicate_observers() {
        let mut list = ObserverList::default();
        list.start_watching(messenger(3), 1);
        list.start_watching_all(messenger(4));
        list.start_watching(messenger(4), 1);
        assert_eq!(list.observers_for(1), vec![messenger(3), messenger(4)]);
    }
}
