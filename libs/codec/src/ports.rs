//! Reply ports
//!
//! A synchronous sender opens a single-slot port, stamps its id into the
//! request's `sourceHandle`, and blocks on it. Whoever holds the request
//! delivers exactly one reply through [`deliver`]. The table is
//! process-wide, so a port id is meaningless outside this process.

use crate::error::{MessagingError, Result};
use crate::message::Message;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

static PORTS: Lazy<DashMap<u64, Sender<Message>>> = Lazy::new(DashMap::new);

/// Port ids start at 1; 0 is "no port" on the wire
static NEXT_PORT: AtomicU64 = AtomicU64::new(1);

/// Receiving end of a reply port; closes the port on drop
#[derive(Debug)]
pub struct ReplyPort {
    id: u64,
    receiver: Receiver<Message>,
}

impl ReplyPort {
    pub fn open() -> Self {
        let id = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = bounded(1);
        PORTS.insert(id, sender);
        trace!(port = id, "Opened reply port");
        Self { id, receiver }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until a reply arrives; `None` waits forever
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Message> {
        match timeout {
            None => self
                .receiver
                .recv()
                .map_err(|_| MessagingError::BadPort { port: self.id }),
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(reply) => Ok(reply),
                Err(RecvTimeoutError::Timeout) => {
                    Err(MessagingError::timed_out(timeout, format!("reply on port {}", self.id)))
                }
                Err(RecvTimeoutError::Disconnected) => Err(MessagingError::BadPort { port: self.id }),
            },
        }
    }

    /// Non-blocking check for an already delivered reply
    pub fn try_take(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ReplyPort {
    fn drop(&mut self) {
        PORTS.remove(&self.id);
        trace!(port = self.id, "Closed reply port");
    }
}

/// Hand `reply` to the waiter on `port`
pub fn deliver(port: u64, reply: Message) -> Result<()> {
    let sender = PORTS
        .get(&port)
        .map(|entry| entry.value().clone())
        .ok_or(MessagingError::BadPort { port })?;

    match sender.try_send(reply) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(MessagingError::DuplicateReply { port }),
        Err(TrySendError::Disconnected(_)) => Err(MessagingError::BadPort { port }),
    }
}

pub fn is_open(port: u64) -> bool {
    PORTS.contains_key(&port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_reply_slot() {
        let port = ReplyPort::open();
        assert!(is_open(port.id()));

        deliver(port.id(), Message::new(1)).unwrap();
        assert_eq!(
            deliver(port.id(), Message::new(2)),
            Err(MessagingError::DuplicateReply { port: port.id() })
        );
        assert_eq!(port.wait(Some(Duration::from_millis(10))).unwrap().what(), 1);
    }

    #[test]
    fn test_closed_port_rejects_delivery() {
        let id = {
            let port = ReplyPort::open();
            port.id()
        };
        assert!(!is_open(id));
        assert_eq!(deliver(id, Message::new(1)), Err(MessagingError::BadPort { port: id }));
    }

    #[test]
    fn test_wait_times_out() {
        let port = ReplyPort::open();
        let err = port.wait(Some(Duration::from_millis(5))).unwrap_err();
        assert!(err.is_timeout());
        assert!(port.try_take().is_none());
    }
}
