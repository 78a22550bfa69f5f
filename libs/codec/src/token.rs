//! Generation-checked handler tokens
//!
//! A token names a handler slot in the process-wide handler table. The
//! generation is bumped every time a slot is reissued, so a token that
//! outlives its handler stops resolving instead of aliasing a newer one.

use std::fmt;

/// Wire value meaning "no token"
pub const NULL_TOKEN: u64 = u64::MAX;

/// Wire value meaning "the destination looper's preferred handler"
pub const PREFERRED_TOKEN: u64 = u64::MAX - 1;

/// Opaque handle to a handler: `(slot id, generation)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub id: u64,
    pub generation: i64,
}

impl Token {
    pub const fn new(id: u64, generation: i64) -> Self {
        Self { id, generation }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{}@{}", self.id, self.generation)
    }
}

/// Where a queued message should be delivered inside its looper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// No explicit handler; the looper itself receives it
    #[default]
    None,
    /// Whatever handler the looper currently prefers
    Preferred,
    /// A specific handler
    Handler(Token),
}

impl Target {
    /// Wire form: `(token, generation)`
    pub fn to_wire(self) -> (u64, i64) {
        match self {
            Target::None => (NULL_TOKEN, 0),
            Target::Preferred => (PREFERRED_TOKEN, 0),
            Target::Handler(token) => (token.id, token.generation),
        }
    }

    pub fn from_wire(id: u64, generation: i64) -> Self {
        match id {
            NULL_TOKEN => Target::None,
            PREFERRED_TOKEN => Target::Preferred,
            _ => Target::Handler(Token::new(id, generation)),
        }
    }

    pub fn token(self) -> Option<Token> {
        match self {
            Target::Handler(token) => Some(token),
            _ => None,
        }
    }
}
