//! Default values for every runtime setting

/// Looper defaults
pub mod looper {
    /// Dispatch threads are named `<prefix>:<looper name>`
    pub const THREAD_NAME_PREFIX: &str = "looper";

    /// Upper bound on one idle wait of a dispatch thread (milliseconds)
    ///
    /// The thread re-checks its proxy state after each expiry.
    pub const IDLE_WAIT_MS: u64 = 250;
}

/// Messenger defaults
pub mod messenger {
    /// `None` blocks until the reply (or a NO_REPLY) arrives
    pub const REPLY_TIMEOUT_MS: Option<u64> = None;

    /// `None` blocks while a bounded queue is full
    pub const DELIVERY_TIMEOUT_MS: Option<u64> = None;
}

/// Observer defaults
pub mod observer {
    /// Per-observer delivery bound used by `send_notices` (milliseconds)
    pub const NOTICE_TIMEOUT_MS: u64 = 50;
}

/// Logging defaults
pub mod logging {
    pub const LEVEL: &str = "info";
}
