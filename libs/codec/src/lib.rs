//! # Message Codec
//!
//! ## Purpose
//!
//! Data layer of the looper runtime:
//! - [`Message`]: ordered, typed, multi-valued property bag with a routing envelope
//! - [`MessageData`]: mapping between Rust values and four-character type codes
//! - Binary flatten/unflatten so messages (and messengers) nest inside each other
//! - [`Token`]: generation-checked handler addresses carried in the envelope
//! - Reply ports used by synchronous senders
//! - [`MessagingError`]: the status taxonomy shared with the runtime
//!
//! ## What This Crate Does NOT Contain
//! - Handlers, loopers, dispatch threads (see `messaging-actors`)
//! - Any cross-process transport
//!
//! ## Architecture Role
//!
//! ```text
//! codec (Message, wire, tokens) → messaging-actors (Looper, Handler, Messenger)
//!        ↑                                  ↓
//!  input backends build messages      dispatch threads deliver them
//! ```

pub mod constants;
pub mod error;
pub mod message;
pub mod ports;
pub mod token;
pub mod type_code;
pub mod value;
pub mod wire;

pub use constants::fields;
pub use error::{MessagingError, Result};
pub use message::{current_team, FieldInfo, Message};
pub use ports::ReplyPort;
pub use token::{Target, Token, NULL_TOKEN, PREFERRED_TOKEN};
pub use type_code::{format_what, TypeCode};
pub use value::{FieldValue, MessageData, Point, RawPointer, Rect};
pub use wire::{HEADER_SIZE, RECORD_OVERHEAD};
