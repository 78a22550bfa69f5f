//! Replying to messages
//!
//! A reply goes to the request's reply port when a synchronous sender is
//! waiting on one, otherwise to the handler named as its reply target.

use codec::{Message, MessagingError, Result};
use tracing::trace;

use crate::messenger::Messenger;

/// Reply routing for received messages
pub trait Reply {
    fn send_reply(&mut self, reply: Message) -> Result<()>;

    fn send_reply_what(&mut self, what: u32) -> Result<()> {
        self.send_reply(Message::new(what))
    }
}

impl Reply for Message {
    fn send_reply(&mut self, mut reply: Message) -> Result<()> {
        if self.is_reply() {
            return Err(MessagingError::bad_value("replies cannot be answered"));
        }
        reply.set_is_reply(true);

        if let Some(port) = self.reply_port() {
            if self.was_replied() {
                return Err(MessagingError::DuplicateReply { port });
            }
            codec::ports::deliver(port, reply)?;
            self.mark_replied();
            trace!(port, "Reply delivered to waiting sender");
            return Ok(());
        }

        if let Some(token) = self.reply_target() {
            let messenger = Messenger::from_raw(self.team(), Some(token), false);
            messenger.send_message(reply)?;
            self.mark_replied();
            trace!(%token, "Reply posted to reply target");
            return Ok(());
        }

        Err(MessagingError::bad_value("message has no reply route"))
    }
}
