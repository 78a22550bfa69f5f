//! # Message - Ordered, Typed, Multi-Valued Property Bag
//!
//! ## Layout
//!
//! ```text
//! Message
//!  ├─ what: u32
//!  ├─ envelope (team, target, reply target, reply port, flags)
//!  └─ fields (insertion order)
//!      └─ name → type groups (insertion order)
//!                 └─ type code → values (index addressable)
//! ```
//!
//! A name may hold several type groups; `(name, type)` identifies one ordered
//! sequence of values. Removing an item shifts the later indices of that
//! sequence down by one. Empty groups and names are pruned so that counts and
//! iteration never report them.
//!
//! ## Reply ownership
//!
//! A message carrying an owned reply port releases its waiting sender when it
//! is dropped unanswered by delivering a [`NO_REPLY`](crate::constants::NO_REPLY)
//! reply. Clones and decoded copies never own the port.

use crate::constants::{self, NO_REPLY};
use crate::error::{MessagingError, Result};
use crate::ports;
use crate::token::{Target, Token};
use crate::type_code::TypeCode;
use crate::value::{FieldValue, MessageData};
use tracing::trace;

/// Process identifier stamped into every message built here
pub fn current_team() -> i64 {
    std::process::id() as i64
}

#[derive(Debug, Clone, PartialEq)]
struct TypeGroup {
    type_code: TypeCode,
    values: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    name: String,
    groups: Vec<TypeGroup>,
}

#[derive(Debug, Clone)]
struct Envelope {
    team: i64,
    target: Target,
    reply_target: Option<Token>,
    reply_port: Option<u64>,
    owns_reply_port: bool,
    replied: bool,
    is_reply: bool,
    unflattened: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            team: current_team(),
            target: Target::None,
            reply_target: None,
            reply_port: None,
            owns_reply_port: false,
            replied: false,
            is_reply: false,
            unflattened: false,
        }
    }
}

/// One `(name, type)` group as reported by [`Message::fields`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo<'a> {
    pub name: &'a str,
    pub type_code: TypeCode,
    pub count: usize,
}

/// Dynamically typed message
#[derive(Debug, Default)]
pub struct Message {
    what: u32,
    fields: Vec<Field>,
    envelope: Envelope,
}

impl Message {
    pub fn new(what: u32) -> Self {
        Self {
            what,
            fields: Vec::new(),
            envelope: Envelope::default(),
        }
    }

    pub fn what(&self) -> u32 {
        self.what
    }

    pub fn set_what(&mut self, what: u32) {
        self.what = what;
    }

    /// True when `what` lies in the reserved `'_xxx'` range
    pub fn is_system(&self) -> bool {
        constants::is_private_what(self.what)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Drop every field; `what` and the envelope are kept
    pub fn make_empty(&mut self) {
        self.fields.clear();
    }

    // ----- adding ---------------------------------------------------------

    /// Append `value` to the `(name, T::TYPE_CODE)` group
    pub fn add<T: MessageData>(&mut self, name: &str, value: T) -> Result<()> {
        self.add_value(name, T::TYPE_CODE, value.to_value())
    }

    pub fn add_str(&mut self, name: &str, value: &str) -> Result<()> {
        self.add(name, value.to_string())
    }

    /// Append raw bytes under an explicit type code
    ///
    /// With `fixed_size == false` the bytes must be exactly the 8 pointer bytes.
    pub fn add_data(&mut self, name: &str, type_code: TypeCode, data: &[u8], fixed_size: bool) -> Result<()> {
        let value = FieldValue {
            fixed_size,
            data: data.to_vec(),
        };
        self.add_value(name, type_code, value)
    }

    pub fn add_value(&mut self, name: &str, type_code: TypeCode, value: FieldValue) -> Result<()> {
        check_name(name)?;
        check_value(type_code, &value)?;

        let index = match self.fields.iter().position(|f| f.name == name) {
            Some(index) => index,
            None => {
                self.fields.push(Field {
                    name: name.to_string(),
                    groups: Vec::new(),
                });
                self.fields.len() - 1
            }
        };
        let field = &mut self.fields[index];

        match field.groups.iter_mut().find(|g| g.type_code == type_code) {
            Some(group) => group.values.push(value),
            None => field.groups.push(TypeGroup {
                type_code,
                values: vec![value],
            }),
        }
        Ok(())
    }

    // ----- finding --------------------------------------------------------

    pub fn find<T: MessageData>(&self, name: &str, index: usize) -> Result<T> {
        let value = self.find_value(name, T::TYPE_CODE, index)?;
        T::from_value(value).ok_or_else(|| {
            MessagingError::bad_value(format!(
                "item {} of '{}' does not decode as {}",
                index,
                name,
                T::TYPE_CODE
            ))
        })
    }

    /// Bytes of the item at `index`; `TypeCode::ANY` selects the first type group
    pub fn find_data(&self, name: &str, type_code: TypeCode, index: usize) -> Result<&[u8]> {
        self.find_value(name, type_code, index).map(|v| v.data.as_slice())
    }

    pub fn find_value(&self, name: &str, type_code: TypeCode, index: usize) -> Result<&FieldValue> {
        self.group(name, type_code)
            .and_then(|group| group.values.get(index))
            .ok_or_else(|| MessagingError::not_found(name, type_code, index))
    }

    pub fn has_field(&self, name: &str, type_code: TypeCode) -> bool {
        self.group(name, type_code).is_some()
    }

    // ----- replacing and removing ---------------------------------------

    pub fn replace<T: MessageData>(&mut self, name: &str, index: usize, value: T) -> Result<()> {
        self.replace_value(name, T::TYPE_CODE, index, value.to_value())
    }

    pub fn replace_data(
        &mut self,
        name: &str,
        type_code: TypeCode,
        index: usize,
        data: &[u8],
        fixed_size: bool,
    ) -> Result<()> {
        let value = FieldValue {
            fixed_size,
            data: data.to_vec(),
        };
        self.replace_value(name, type_code, index, value)
    }

    pub fn replace_value(&mut self, name: &str, type_code: TypeCode, index: usize, value: FieldValue) -> Result<()> {
        check_value(type_code, &value)?;
        let slot = self
            .group_mut(name, type_code)
            .and_then(|group| group.values.get_mut(index))
            .ok_or_else(|| MessagingError::not_found(name, type_code, index))?;
        *slot = value;
        Ok(())
    }

    pub fn remove<T: MessageData>(&mut self, name: &str, index: usize) -> Result<()> {
        self.remove_data(name, T::TYPE_CODE, index)
    }

    /// Remove one item; later items of the group move down one index
    pub fn remove_data(&mut self, name: &str, type_code: TypeCode, index: usize) -> Result<()> {
        let not_found = || MessagingError::not_found(name, type_code, index);
        let field_index = self
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(not_found)?;
        let field = &mut self.fields[field_index];
        let group_index = field
            .groups
            .iter()
            .position(|g| type_code.matches(g.type_code))
            .ok_or_else(not_found)?;
        let group = &mut field.groups[group_index];
        if index >= group.values.len() {
            return Err(not_found());
        }

        group.values.remove(index);
        if group.values.is_empty() {
            field.groups.remove(group_index);
        }
        if field.groups.is_empty() {
            self.fields.remove(field_index);
        }
        Ok(())
    }

    /// Remove every type group stored under `name`
    pub fn remove_name(&mut self, name: &str) -> Result<()> {
        let index = self
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| MessagingError::not_found(name, TypeCode::ANY, 0))?;
        self.fields.remove(index);
        Ok(())
    }

    // ----- counting and iteration ---------------------------------------

    /// Items in the `(name, type)` group; `TypeCode::ANY` sums every group of `name`
    pub fn count_items(&self, name: &str, type_code: TypeCode) -> usize {
        let Some(field) = self.fields.iter().find(|f| f.name == name) else {
            return 0;
        };
        field
            .groups
            .iter()
            .filter(|g| type_code.matches(g.type_code))
            .map(|g| g.values.len())
            .sum()
    }

    /// Names holding at least one group of `type_code` (`ANY` counts every name)
    pub fn count_names(&self, type_code: TypeCode) -> usize {
        self.fields
            .iter()
            .filter(|f| f.groups.iter().any(|g| type_code.matches(g.type_code)))
            .count()
    }

    /// Every `(name, type)` group in iteration order
    pub fn fields(&self) -> impl Iterator<Item = FieldInfo<'_>> + '_ {
        self.fields.iter().flat_map(|field| {
            field.groups.iter().map(move |group| FieldInfo {
                name: &field.name,
                type_code: group.type_code,
                count: group.values.len(),
            })
        })
    }

    /// The `index`-th group whose type matches `type_code`
    pub fn get_info(&self, type_code: TypeCode, index: usize) -> Option<FieldInfo<'_>> {
        self.fields()
            .filter(|info| type_code.matches(info.type_code))
            .nth(index)
    }

    pub(crate) fn raw_values(&self) -> impl Iterator<Item = (&str, TypeCode, &FieldValue)> + '_ {
        self.fields.iter().flat_map(|field| {
            field.groups.iter().flat_map(move |group| {
                group
                    .values
                    .iter()
                    .map(move |value| (field.name.as_str(), group.type_code, value))
            })
        })
    }

    fn group(&self, name: &str, type_code: TypeCode) -> Option<&TypeGroup> {
        self.fields
            .iter()
            .find(|f| f.name == name)?
            .groups
            .iter()
            .find(|g| type_code.matches(g.type_code))
    }

    fn group_mut(&mut self, name: &str, type_code: TypeCode) -> Option<&mut TypeGroup> {
        self.fields
            .iter_mut()
            .find(|f| f.name == name)?
            .groups
            .iter_mut()
            .find(|g| type_code.matches(g.type_code))
    }

    // ----- envelope -------------------------------------------------------

    /// Originating process
    pub fn team(&self) -> i64 {
        self.envelope.team
    }

    pub fn target(&self) -> Target {
        self.envelope.target
    }

    pub fn set_target(&mut self, target: Target) {
        self.envelope.target = target;
    }

    /// Handler that should receive replies, when no reply port is attached
    pub fn reply_target(&self) -> Option<Token> {
        self.envelope.reply_target
    }

    pub fn set_reply_target(&mut self, token: Option<Token>) {
        self.envelope.reply_target = token;
    }

    pub fn reply_port(&self) -> Option<u64> {
        self.envelope.reply_port
    }

    /// Attach a reply port this message owns until it is answered or dropped
    pub fn attach_reply_port(&mut self, port: u64) {
        self.envelope.reply_port = Some(port);
        self.envelope.owns_reply_port = true;
        self.envelope.replied = false;
    }

    /// True while a synchronous sender is blocked on this message's reply port
    pub fn is_source_waiting(&self) -> bool {
        self.envelope.owns_reply_port && !self.envelope.replied && self.envelope.reply_port.is_some()
    }

    /// True when some reply route (port or handler) is attached
    pub fn expects_reply(&self) -> bool {
        !self.envelope.is_reply
            && (self.envelope.reply_port.is_some() || self.envelope.reply_target.is_some())
    }

    pub fn mark_replied(&mut self) {
        self.envelope.replied = true;
    }

    pub fn was_replied(&self) -> bool {
        self.envelope.replied
    }

    pub fn is_reply(&self) -> bool {
        self.envelope.is_reply
    }

    pub fn set_is_reply(&mut self, is_reply: bool) {
        self.envelope.is_reply = is_reply;
    }

    /// True when this message was decoded from a flattened blob
    pub fn was_unflattened(&self) -> bool {
        self.envelope.unflattened
    }

    /// True when the message was built in another process
    pub fn is_remote(&self) -> bool {
        self.envelope.team != current_team()
    }

    pub(crate) fn set_wire_envelope(
        &mut self,
        team: i64,
        target: Target,
        reply_target: Option<Token>,
        reply_port: Option<u64>,
        is_reply: bool,
    ) {
        self.envelope = Envelope {
            team,
            target,
            reply_target,
            reply_port,
            owns_reply_port: false,
            replied: false,
            is_reply,
            unflattened: true,
        };
    }
}

impl Clone for Message {
    /// Deep copy; the copy never owns the reply port
    fn clone(&self) -> Self {
        let mut envelope = self.envelope.clone();
        envelope.owns_reply_port = false;
        Self {
            what: self.what,
            fields: self.fields.clone(),
            envelope,
        }
    }
}

impl PartialEq for Message {
    /// Compares `what`, every field, and the routing envelope
    fn eq(&self, other: &Self) -> bool {
        self.what == other.what
            && self.fields == other.fields
            && self.envelope.team == other.envelope.team
            && self.envelope.target == other.envelope.target
            && self.envelope.reply_target == other.envelope.reply_target
            && self.envelope.reply_port == other.envelope.reply_port
            && self.envelope.is_reply == other.envelope.is_reply
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if !self.is_source_waiting() || self.envelope.is_reply {
            return;
        }
        if let Some(port) = self.envelope.reply_port {
            let mut reply = Message::new(NO_REPLY);
            reply.set_is_reply(true);
            // The waiter may already be gone; nothing to release then.
            if ports::deliver(port, reply).is_ok() {
                trace!(port, what = self.what, "Released waiting sender with NO_REPLY");
            }
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MessagingError::bad_value("field name must not be empty"));
    }
    Ok(())
}

fn check_value(type_code: TypeCode, value: &FieldValue) -> Result<()> {
    if type_code.is_any() {
        return Err(MessagingError::bad_value("ANY is not a storable type code"));
    }
    if !value.fixed_size && value.data.len() != 8 {
        return Err(MessagingError::bad_value(format!(
            "pointer values are 8 bytes, got {}",
            value.data.len()
        )));
    }
    Ok(())
}
