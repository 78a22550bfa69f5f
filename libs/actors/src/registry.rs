//! Token Registry
//!
//! Generation-checked slot arena mapping a [`Token`] to a live object. A slot
//! stores a `Weak` reference plus the generation it was issued with; freeing
//! a slot bumps the generation, so a token minted before the slot was reused
//! never resolves to the new occupant.

use codec::Token;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::handler::HandlerNode;

/// Tokens of every live handler in the process
pub(crate) static HANDLER_TOKENS: Lazy<TokenRegistry<HandlerNode>> = Lazy::new(TokenRegistry::new);

#[derive(Debug)]
struct Slot<T> {
    generation: i64,
    entry: Option<Weak<T>>,
}

#[derive(Debug)]
struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

/// Slot arena handing out `(id, generation)` tokens
#[derive(Debug)]
pub struct TokenRegistry<T> {
    inner: Mutex<Slots<T>>,
}

impl<T> Default for TokenRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TokenRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Issue a token for `entry`, recycling a freed slot when one exists
    pub fn register(&self, entry: Weak<T>) -> Token {
        let mut inner = self.inner.lock();
        let token = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.entry = Some(entry);
                Token::new(index as u64, slot.generation)
            }
            None => {
                inner.slots.push(Slot {
                    generation: 1,
                    entry: Some(entry),
                });
                Token::new((inner.slots.len() - 1) as u64, 1)
            }
        };
        trace!(%token, "Registered token");
        token
    }

    /// Revoke `token`; a stale token is ignored
    pub fn revoke(&self, token: Token) -> bool {
        let mut inner = self.inner.lock();
        let index = token.id as usize;
        let Some(slot) = inner.slots.get_mut(index) else {
            return false;
        };
        if slot.generation != token.generation || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        slot.generation += 1;
        inner.free.push(index);
        trace!(%token, "Revoked token");
        true
    }

    /// Live object for `token`, if the generation still matches
    pub fn resolve(&self, token: Token) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(token.id as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        slot.entry.as_ref()?.upgrade()
    }

    /// True while `token` still names its original occupant
    pub fn is_current(&self, token: Token) -> bool {
        let inner = self.inner.lock();
        inner
            .slots
            .get(token.id as usize)
            .map(|slot| slot.generation == token.generation && slot.entry.is_some())
            .unwrap_or(false)
    }

    /// Number of occupied slots
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }
}
