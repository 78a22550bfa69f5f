//! Reserved message codes and conventional field names

const fn four_cc(chars: [u8; 4]) -> u32 {
    u32::from_be_bytes(chars)
}

/// Terminal message: the dispatch loop exits when it pops one
pub const QUIT: u32 = four_cc(*b"_QIT");
/// Ask a looper to quit; its root handler decides via `quit_requested`
pub const QUIT_REQUESTED: u32 = four_cc(*b"_QRQ");
/// Sentinel reply for a request that was dropped or timed out
pub const NO_REPLY: u32 = four_cc(*b"_NRP");
/// Reply to an awaited request no handler understood
pub const MESSAGE_NOT_UNDERSTOOD: u32 = four_cc(*b"_NUN");
/// Generic reply code (e.g. the answer to an awaited `QUIT_REQUESTED`)
pub const REPLY: u32 = four_cc(*b"RPLY");
/// Remote request to add an observer
pub const START_WATCHING: u32 = four_cc(*b"_STW");
/// Remote request to remove an observer
pub const STOP_WATCHING: u32 = four_cc(*b"_SPW");
/// Envelope for observer notifications
pub const OBSERVER_NOTICE_CHANGE: u32 = four_cc(*b"NTCH");
/// `what` used in watch requests for "every notice"
pub const OBSERVE_ALL: u32 = 0xffff_ffff;

/// Leading byte of the private `what` range
pub const PRIVATE_WHAT_PREFIX: u8 = b'_';

/// True for codes in the reserved `'_xxx'` range
pub const fn is_private_what(what: u32) -> bool {
    (what >> 24) as u8 == PRIVATE_WHAT_PREFIX
}

pub mod fields {
    //! Field names understood by the runtime and by backends posting input

    pub const OBSERVE_CHANGE_WHAT: &str = "be:observe_change_what";
    pub const OBSERVE_ORIGINAL_WHAT: &str = "be:observe_orig_what";
    pub const OBSERVE_OBSERVER: &str = "be:observe_observer";
    pub const RESULT: &str = "result";
    pub const WHERE: &str = "where";
    pub const BUTTONS: &str = "buttons";
    pub const WHEN: &str = "when";
}
