//! Status taxonomy for message construction, wire decoding and delivery
//!
//! Every fallible operation in the messaging stack reports one of these
//! variants. The diagnostic variants carry enough context (offsets, sizes)
//! to debug a malformed blob without a hex dump.

use thiserror::Error;

/// Messaging errors shared by the codec and the looper runtime
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Null or otherwise invalid argument
    #[error("Bad value: {0}")]
    BadValue(String),

    /// Messenger or token no longer resolves to a live handler
    #[error("Bad handler: {0}")]
    BadHandler(String),

    /// Reply port is closed or was never opened
    #[error("Bad reply port {port}")]
    BadPort { port: u64 },

    /// Allocation failure while building or flattening
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// Lock, queue or port wait expired
    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    TimedOut { waited_ms: u64, what: String },

    /// Zero-timeout operation could not complete immediately
    #[error("Operation would block: {0}")]
    WouldBlock(String),

    /// A reply port already holds an unread reply
    #[error("Reply port {port} already holds an unread reply")]
    DuplicateReply { port: u64 },

    /// Field name, type group or index does not exist
    #[error("Field '{name}' ({type_code}) has no item at index {index}")]
    NotFound {
        name: String,
        type_code: String,
        index: usize,
    },

    /// Destination buffer cannot hold the flattened form
    #[error("Buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall { need: usize, got: usize },

    /// Encoded data ends before a declared length is satisfied
    #[error("Truncated data at offset {offset}: need {need} bytes, {remaining} remaining (reading {context})")]
    Truncated {
        offset: usize,
        need: usize,
        remaining: usize,
        context: String,
    },

    /// A length or size field holds a value that cannot be valid
    #[error("Invalid length {value} at offset {offset} ({context})")]
    InvalidLength {
        offset: usize,
        value: u64,
        context: String,
    },

    /// Generic failure
    #[error("{0}")]
    Error(String),
}

impl MessagingError {
    pub fn bad_value(reason: impl Into<String>) -> Self {
        Self::BadValue(reason.into())
    }

    pub fn bad_handler(reason: impl Into<String>) -> Self {
        Self::BadHandler(reason.into())
    }

    pub fn timed_out(waited: std::time::Duration, what: impl Into<String>) -> Self {
        Self::TimedOut {
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            what: what.into(),
        }
    }

    pub fn not_found(name: &str, type_code: crate::TypeCode, index: usize) -> Self {
        Self::NotFound {
            name: name.to_string(),
            type_code: type_code.to_string(),
            index,
        }
    }

    pub fn truncated(offset: usize, need: usize, remaining: usize, context: impl Into<String>) -> Self {
        Self::Truncated {
            offset,
            need,
            remaining,
            context: context.into(),
        }
    }

    pub fn invalid_length(offset: usize, value: u64, context: impl Into<String>) -> Self {
        Self::InvalidLength {
            offset,
            value,
            context: context.into(),
        }
    }

    /// True for the two "wait expired" variants
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::WouldBlock(_))
    }
}

/// Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;
