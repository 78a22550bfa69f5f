//! # Looper Runtime
//!
//! Thread-per-looper message dispatch built on the `codec` message model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  send_message   ┌────────────────────────────────────┐
//! │  Messenger   │ ──────────────► │ Looper                             │
//! │ (team,token) │                 │  queue ─► filters ─► handler chain │
//! └──────────────┘                 │  recursive lock, dispatch thread   │
//!        ▲                         └────────────────────────────────────┘
//!        │ resolve(token)                      │ proxy_by(Some(root))
//! ┌──────────────┐                             ▼
//! │ token table  │                 shares root's lock, queue and thread
//! └──────────────┘
//! ```
//!
//! - [`Looper`]: owns a queue, a recursive lock and a handler chain; `run()`
//!   spawns the thread that dispatches one message at a time.
//! - [`HandlerRef`]: addressable handler with filters and observers; its
//!   [`Handler`] behavior runs only on its looper's dispatch thread.
//! - [`Messenger`]: `Copy` address that re-validates its target on every send
//!   and fails with `BadHandler` once the handler or looper is gone.
//! - [`MessageFilter`]: predicate plus hook that can drop or redirect a
//!   message before its handler sees it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use messaging_actors::{HandlerRef, Looper, Messenger, Reply};
//! use messaging_actors::codec::Message;
//!
//! let looper = Looper::new("worker");
//! let echo = HandlerRef::from_fn("echo", |message: &mut Message, _ctx| {
//!     let _ = message.send_reply(Message::new(message.what()));
//! });
//! looper.add_handler(&echo).unwrap();
//! looper.run().unwrap();
//!
//! let messenger = Messenger::for_handler(&echo, None).unwrap();
//! let reply = messenger.send_and_wait(Message::new(0x1234), None).unwrap();
//! assert_eq!(reply.what(), 0x1234);
//!
//! looper.remove_handler(&echo);
//! looper.quit();
//! ```

pub use codec;

pub mod directory;
mod dispatch;
pub mod filter;
pub mod handler;
mod lock;
pub mod looper;
pub mod messenger;
pub mod observer;
mod queue;
pub mod registry;
pub mod reply;

pub use directory::{looper_count, looper_for, looper_for_thread, loopers};
pub use filter::{Filter, FilterId, FilterResult, MessageDelivery, MessageFilter, MessageSource};
pub use handler::{default_message_received, ChainSplice, DefaultHandler, Dispatch, FnHandler, Handler, HandlerRef};
pub use looper::{Looper, LooperBuilder, LooperGuard, LooperId, LooperState};
pub use messenger::{current_looper_messenger, Messenger, MESSENGER_SIZE};
pub use registry::TokenRegistry;
pub use reply::Reply;

pub use codec::{Message, MessagingError, Result, Target, Token};
