//! # Message Wire Format
//!
//! Self-describing binary form used to embed a message inside another one
//! and to hand it across a process boundary. All integers use the host byte
//! order; pointer-width fields are written as 8 bytes.
//!
//! ```text
//! header (69 bytes)
//! ┌────────────┬───────┬──────┬──────────┬─────────┬─────────┬─────────┬────────┬─────────┬──────────┐
//! │ total_size │ what  │ team │ target   │ target  │ reply   │ reply   │ source │ is_reply│ records  │
//! │ u64        │ u32   │ i64  │ token u64│ gen i64 │ tok u64 │ gen i64 │ u64    │ u8      │ u64      │
//! └────────────┴───────┴──────┴──────────┴─────────┴─────────┴─────────┴────────┴─────────┴──────────┘
//! record (21 bytes + name + data), repeated `records` times
//! ┌──────────┬──────┬───────────┬────────────┬──────────┬──────┐
//! │ name_len │ name │ type u32  │ fixed u8   │ data_len │ data │
//! └──────────┴──────┴───────────┴────────────┴──────────┴──────┘
//! ```
//!
//! Records are emitted one per stored item, grouped by name then type in
//! iteration order, so decoding re-creates the same indices.
//!
//! Routing fields (`target`, `reply`, `source`) only mean something inside the
//! process that wrote them; decoding a blob whose `team` differs clears them.

use crate::error::{MessagingError, Result};
use crate::message::{current_team, Message};
use crate::token::{Target, Token, NULL_TOKEN};
use crate::type_code::TypeCode;
use crate::value::{FieldValue, MessageData};
use byteorder::{ByteOrder, NativeEndian, WriteBytesExt};
use std::io::Write;
use tracing::debug;

/// Fixed header length in bytes
pub const HEADER_SIZE: usize = 8 + 4 + 8 + 8 + 8 + 8 + 8 + 8 + 1 + 8;

/// Per-record overhead excluding name and data bytes
pub const RECORD_OVERHEAD: usize = 8 + 4 + 1 + 8;

/// Size of a flattened pointer value
const POINTER_SIZE: usize = 8;

impl Message {
    /// Exact number of bytes [`flatten`](Self::flatten) produces
    pub fn flattened_size(&self) -> usize {
        HEADER_SIZE
            + self
                .raw_values()
                .map(|(name, _, value)| RECORD_OVERHEAD + name.len() + value.data.len())
                .sum::<usize>()
    }

    /// Flatten into `buffer`, returning the number of bytes written
    ///
    /// Fails with `BufferTooSmall` (writing nothing) when `buffer` is short.
    pub fn flatten_into(&self, buffer: &mut [u8]) -> Result<usize> {
        let need = self.flattened_size();
        if buffer.len() < need {
            return Err(MessagingError::BufferTooSmall {
                need,
                got: buffer.len(),
            });
        }
        let mut cursor = &mut buffer[..need];
        self.write_to(&mut cursor, need)
            .map_err(|e| MessagingError::NoMemory(format!("flatten failed: {}", e)))?;
        Ok(need)
    }

    pub fn flatten(&self) -> Vec<u8> {
        let need = self.flattened_size();
        let mut buffer = vec![0u8; need];
        match self.flatten_into(&mut buffer) {
            Ok(_) => buffer,
            // flatten_into only fails on a short buffer, which cannot happen here
            Err(_) => Vec::new(),
        }
    }

    fn write_to<W: Write>(&self, out: &mut W, total: usize) -> std::io::Result<()> {
        let (target_token, target_generation) = self.target().to_wire();
        let (reply_token, reply_generation) = match self.reply_target() {
            Some(token) => (token.id, token.generation),
            None => (NULL_TOKEN, 0),
        };
        let record_count = self.raw_values().count();

        out.write_u64::<NativeEndian>(total as u64)?;
        out.write_u32::<NativeEndian>(self.what())?;
        out.write_i64::<NativeEndian>(self.team())?;
        out.write_u64::<NativeEndian>(target_token)?;
        out.write_i64::<NativeEndian>(target_generation)?;
        out.write_u64::<NativeEndian>(reply_token)?;
        out.write_i64::<NativeEndian>(reply_generation)?;
        out.write_u64::<NativeEndian>(self.reply_port().unwrap_or(0))?;
        out.write_u8(self.is_reply() as u8)?;
        out.write_u64::<NativeEndian>(record_count as u64)?;

        for (name, type_code, value) in self.raw_values() {
            out.write_u64::<NativeEndian>(name.len() as u64)?;
            out.write_all(name.as_bytes())?;
            out.write_u32::<NativeEndian>(type_code.0)?;
            out.write_u8(value.fixed_size as u8)?;
            out.write_u64::<NativeEndian>(value.data.len() as u64)?;
            out.write_all(&value.data)?;
        }
        Ok(())
    }

    /// Decode a flattened message
    pub fn from_flattened(data: &[u8]) -> Result<Message> {
        let mut reader = Reader::new(data);
        let total = reader.read_len("total size")?;
        if total < HEADER_SIZE || total > data.len() {
            return Err(if total > data.len() {
                MessagingError::truncated(0, total, data.len(), "message body")
            } else {
                MessagingError::invalid_length(0, total as u64, "total size below header size")
            });
        }
        let mut reader = Reader::new(&data[..total]);
        reader.skip(8);

        let what = reader.read_u32("what")?;
        let team = reader.read_i64("team")?;
        let target_token = reader.read_u64("target token")?;
        let target_generation = reader.read_i64("target generation")?;
        let reply_token = reader.read_u64("reply token")?;
        let reply_generation = reader.read_i64("reply generation")?;
        let source = reader.read_u64("source handle")?;
        let is_reply = reader.read_u8("is_reply")? != 0;
        let record_offset = reader.offset;
        let records = reader.read_u64("record count")?;

        if records > (reader.remaining() / RECORD_OVERHEAD) as u64 {
            return Err(MessagingError::invalid_length(record_offset, records, "record count"));
        }

        let mut message = Message::new(what);
        for _ in 0..records {
            let name_offset = reader.offset;
            let name_len = reader.read_len("name length")?;
            let name = std::str::from_utf8(reader.take(name_len, "name")?)
                .map_err(|_| MessagingError::bad_value(format!("field name at offset {} is not UTF-8", name_offset)))?;
            let type_code = TypeCode(reader.read_u32("type code")?);
            let fixed_size = reader.read_u8("fixed size flag")? != 0;
            let data_offset = reader.offset;
            let data_len = reader.read_len("data length")?;
            if !fixed_size && data_len != POINTER_SIZE {
                return Err(MessagingError::invalid_length(data_offset, data_len as u64, "pointer value length"));
            }
            let bytes = reader.take(data_len, "value data")?;
            message.add_value(
                name,
                type_code,
                FieldValue {
                    fixed_size,
                    data: bytes.to_vec(),
                },
            )?;
        }

        if reader.remaining() != 0 {
            return Err(MessagingError::invalid_length(
                reader.offset,
                reader.remaining() as u64,
                "trailing bytes after last record",
            ));
        }

        if team == current_team() {
            let reply = (reply_token != NULL_TOKEN).then(|| Token::new(reply_token, reply_generation));
            let port = (source != 0).then_some(source);
            message.set_wire_envelope(
                team,
                Target::from_wire(target_token, target_generation),
                reply,
                port,
                is_reply,
            );
        } else {
            debug!(team, what, "Decoded foreign message; routing fields cleared");
            message.set_wire_envelope(team, Target::None, None, None, is_reply);
        }
        Ok(message)
    }

    /// Replace `self` with the decoded message; `self` is untouched on failure
    pub fn unflatten(&mut self, data: &[u8]) -> Result<()> {
        *self = Message::from_flattened(data)?;
        Ok(())
    }
}

/// Nested messages travel as their flattened bytes
impl MessageData for Message {
    const TYPE_CODE: TypeCode = TypeCode::MESSAGE;

    fn to_value(&self) -> FieldValue {
        FieldValue::owned(self.flatten())
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        Message::from_flattened(&value.data).ok()
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn skip(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    fn take(&mut self, n: usize, context: &str) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(MessagingError::truncated(self.offset, n, self.remaining(), context));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self, context: &str) -> Result<u8> {
        Ok(self.take(1, context)?[0])
    }

    fn read_u32(&mut self, context: &str) -> Result<u32> {
        Ok(NativeEndian::read_u32(self.take(4, context)?))
    }

    fn read_u64(&mut self, context: &str) -> Result<u64> {
        Ok(NativeEndian::read_u64(self.take(8, context)?))
    }

    fn read_i64(&mut self, context: &str) -> Result<i64> {
        Ok(NativeEndian::read_i64(self.take(8, context)?))
    }

    /// Pointer-width length that must fit in the remaining input
    fn read_len(&mut self, context: &str) -> Result<usize> {
        let offset = self.offset;
        let value = self.read_u64(context)?;
        usize::try_from(value).map_err(|_| MessagingError::invalid_length(offset, value, context))
    }
}
