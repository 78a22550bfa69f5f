//! Messenger - validated reference to a handler/looper pair
//!
//! A messenger stores only `(team, token, preferred)`, so it is `Copy` and can
//! be embedded in messages. Every send re-resolves the token; a messenger whose
//! handler has been dropped (generation mismatch) or whose looper has quit
//! fails with `BadHandler`.
//!
//! ## Wire format (25 bytes, native endian)
//!
//! ```text
//! team:i64 | token id:u64 (NULL_TOKEN if unset) | generation:i64 | preferred:u8
//! ```

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use codec::constants::NO_REPLY;
use codec::{current_team, FieldValue, Message, MessageData, MessagingError, ReplyPort, Result, Target, Token, TypeCode, NULL_TOKEN};
use looper_config::RuntimeConfig;
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use crate::handler::HandlerRef;
use crate::looper::{self, Looper, LooperShared};

/// Flattened size of a messenger
pub const MESSENGER_SIZE: usize = 8 + 8 + 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Messenger {
    team: i64,
    token: Option<Token>,
    preferred: bool,
}

impl Default for Messenger {
    fn default() -> Self {
        Self {
            team: current_team(),
            token: None,
            preferred: false,
        }
    }
}

impl Messenger {
    /// Messenger targeting `handler`
    ///
    /// When `looper` is given the handler must belong to it.
    pub fn for_handler(handler: &HandlerRef, looper: Option<&Looper>) -> Result<Self> {
        let owner = handler
            .looper_shared()
            .ok_or_else(|| MessagingError::bad_handler(format!("{} is not attached to a looper", handler)))?;
        if let Some(looper) = looper {
            if !Arc::ptr_eq(&owner, looper.shared()) {
                return Err(MessagingError::bad_value(format!(
                    "{} does not belong to looper '{}'",
                    handler,
                    looper.name()
                )));
            }
        }
        Ok(Self {
            team: current_team(),
            token: Some(handler.token()),
            preferred: false,
        })
    }

    /// Messenger targeting whatever handler `looper` prefers at delivery time
    pub fn for_looper(looper: &Looper) -> Self {
        Self {
            team: current_team(),
            token: Some(looper.root_handler().token()),
            preferred: true,
        }
    }

    pub fn from_raw(team: i64, token: Option<Token>, preferred: bool) -> Self {
        Self { team, token, preferred }
    }

    pub fn team(&self) -> i64 {
        self.team
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_preferred(&self) -> bool {
        self.preferred
    }

    pub fn is_target_local(&self) -> bool {
        self.team == current_team()
    }

    pub fn is_valid(&self) -> bool {
        self.resolve().is_ok()
    }

    /// Target handler (`None` for the preferred handler) and its looper
    pub fn target(&self) -> Option<(Option<HandlerRef>, Looper)> {
        let (looper, target) = self.resolve().ok()?;
        let handler = target.token().and_then(HandlerRef::resolve);
        Some((handler, Looper::from_shared(looper)))
    }

    // ----- sending --------------------------------------------------------

    /// Post `message`; waits for queue space up to the configured delivery timeout
    pub fn send_message(&self, message: Message) -> Result<()> {
        let timeout = RuntimeConfig::global().messenger.delivery_timeout();
        self.deliver(message, None, timeout)
    }

    pub fn send_what(&self, what: u32) -> Result<()> {
        self.send_message(Message::new(what))
    }

    /// Post `message`; replies go to `reply_to`
    pub fn send_message_with_reply(&self, message: Message, reply_to: &HandlerRef) -> Result<()> {
        let timeout = RuntimeConfig::global().messenger.delivery_timeout();
        self.deliver(message, Some(reply_to.token()), timeout)
    }

    /// Post `message`, giving up after `timeout` if the queue stays full
    pub fn send_message_timeout(&self, message: Message, timeout: Duration) -> Result<()> {
        self.deliver(message, None, Some(timeout))
    }

    /// Post `message` and block for its reply
    ///
    /// `timeout` bounds the wait for the reply (`None` falls back to the
    /// configured reply timeout, which defaults to waiting forever). A request
    /// dropped without an answer, or not answered in time, produces a
    /// `NO_REPLY` message.
    pub fn send_and_wait(&self, mut message: Message, timeout: Option<Duration>) -> Result<Message> {
        let (looper, _) = self.resolve()?;
        if looper::dispatched_by_current_thread(&looper) {
            return Err(MessagingError::bad_value(
                "synchronous send to a looper dispatched by the calling thread would deadlock",
            ));
        }

        let port = ReplyPort::open();
        message.attach_reply_port(port.id());
        self.send_message(message)?;

        let timeout = timeout.or_else(|| RuntimeConfig::global().messenger.reply_timeout());
        match port.wait(timeout) {
            Ok(reply) => {
                trace!(port = port.id(), what = reply.what(), "Synchronous reply received");
                Ok(reply)
            }
            Err(e) if e.is_timeout() => {
                debug!(port = port.id(), error = %e, "No reply before the deadline");
                let mut reply = Message::new(NO_REPLY);
                reply.set_is_reply(true);
                Ok(reply)
            }
            Err(e) => Err(e),
        }
    }

    fn deliver(&self, mut message: Message, reply_to: Option<Token>, timeout: Option<Duration>) -> Result<()> {
        let (looper, target) = self.resolve()?;
        message.set_target(target);
        if reply_to.is_some() {
            message.set_reply_target(reply_to);
        }
        looper::enqueue(&looper, message, timeout)
    }

    fn resolve(&self) -> Result<(Arc<LooperShared>, Target)> {
        if !self.is_target_local() {
            return Err(MessagingError::bad_handler(format!(
                "team {} is remote; cross-process delivery is unsupported",
                self.team
            )));
        }
        let token = self
            .token
            .ok_or_else(|| MessagingError::bad_handler("messenger has no target"))?;
        let handler =
            HandlerRef::resolve(token).ok_or_else(|| MessagingError::bad_handler(format!("{} is stale", token)))?;
        let looper = handler
            .looper_shared()
            .ok_or_else(|| MessagingError::bad_handler(format!("{} is not attached to a looper", handler)))?;
        if looper.is_destroyed() {
            return Err(MessagingError::bad_handler(format!("looper '{}' has quit", looper.name())));
        }
        let target = if self.preferred {
            Target::Preferred
        } else {
            Target::Handler(token)
        };
        Ok((looper, target))
    }

    // ----- wire format ----------------------------------------------------

    pub fn flatten(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(MESSENGER_SIZE);
        let (id, generation) = match self.token {
            Some(token) => (token.id, token.generation),
            None => (NULL_TOKEN, 0),
        };
        // Writes into a Vec cannot fail
        let _ = buffer.write_i64::<NativeEndian>(self.team);
        let _ = buffer.write_u64::<NativeEndian>(id);
        let _ = buffer.write_i64::<NativeEndian>(generation);
        let _ = buffer.write_u8(self.preferred as u8);
        buffer
    }

    pub fn unflatten(data: &[u8]) -> Result<Self> {
        if data.len() != MESSENGER_SIZE {
            return Err(MessagingError::invalid_length(0, data.len() as u64, "flattened messenger"));
        }
        let mut cursor = Cursor::new(data);
        let read_err = |_: std::io::Error| MessagingError::truncated(0, MESSENGER_SIZE, data.len(), "flattened messenger");
        let team = cursor.read_i64::<NativeEndian>().map_err(read_err)?;
        let id = cursor.read_u64::<NativeEndian>().map_err(read_err)?;
        let generation = cursor.read_i64::<NativeEndian>().map_err(read_err)?;
        let preferred = cursor.read_u8().map_err(read_err)? != 0;
        let token = (id != NULL_TOKEN).then(|| Token::new(id, generation));
        Ok(Self { team, token, preferred })
    }
}

impl MessageData for Messenger {
    const TYPE_CODE: TypeCode = TypeCode::MESSENGER;

    fn to_value(&self) -> FieldValue {
        FieldValue::owned(self.flatten())
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        Messenger::unflatten(&value.data).ok()
    }
}

/// Messenger for the calling thread's looper, if it is a dispatch thread
pub fn current_looper_messenger() -> Option<Messenger> {
    crate::directory::looper_for(thread::current().id()).map(|looper| Messenger::for_looper(&looper))
}
