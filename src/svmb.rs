//! The `.svmb` binary form.
//!
//! ```text
//! "SVMB" | version u8 | root list record
//!
//! record := 0x01 f64              number
//!         | 0x02 u32 len, bytes   string (UTF-8)
//!         | 0x03 u32 count, record*  list
//!         | 0x04 u32 len, bytes   name (UTF-8 identifier)
//!         | 0x05 u8               opcode
//! ```
//!
//! All integers and floats are little-endian. Scope IDs and labels are never
//! written: decoding rebuilds the tree through [`TreeBuilder`], which assigns
//! IDs in the same pre-order as the text form and validates every instruction.
//! Any malformed input yields [`Error::Codec`] carrying the byte offset of the
//! problem; the decoder never reads past the buffer.

use crate::Error;
use crate::ast::{ListHandle, ListRef, ScopeId, Slot, Value};
use crate::builtinops::Opcode;
use crate::config::RuntimeConfig;
use crate::scope::{ScopeTree, TreeBuilder};
use crate::svmp::is_identifier;

/// File magic: "SVMB"
pub const MAGIC: &[u8; 4] = b"SVMB";

/// Supported format version
pub const VERSION: u8 = 1;

const TAG_NUMBER: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_LIST: u8 = 0x03;
const TAG_NAME: u8 = 0x04;
const TAG_OPCODE: u8 = 0x05;

/// Smallest record (an opcode: tag plus one byte)
const MIN_RECORD_LEN: usize = 2;

//
// Encoding
//

fn write_str(out: &mut Vec<u8>, tag: u8, s: &str) {
    out.push(tag);
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_list(tree: &ScopeTree, id: ScopeId, out: &mut Vec<u8>) {
    let slots: &[Slot] = tree.get(id).map_or(&[], |scope| &scope.slots);
    out.push(TAG_LIST);
    out.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    for slot in slots {
        match slot {
            Slot::Value(Value::Number(n)) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Slot::Value(Value::String(s)) => write_str(out, TAG_STRING, s),
            Slot::Value(Value::List(list)) => match list.handle {
                ListHandle::Scope(child) => write_list(tree, child, out),
                // trees outside the engine never hold heap lists
                ListHandle::Heap(_) => {
                    out.push(TAG_LIST);
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            },
            Slot::Name(name) => write_str(out, TAG_NAME, name),
            Slot::Opcode(op) => {
                out.push(TAG_OPCODE);
                out.push(*op as u8);
            }
        }
    }
}

/// Serialize a tree; the output is a pure function of the tree's structure
pub fn encode_binary(tree: &ScopeTree) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    write_list(tree, 0, &mut out);
    out
}

//
// Decoding
//

struct Reader<'b> {
    bytes: &'b [u8],
    cursor: usize,
    builder: TreeBuilder,
    max_depth: usize,
}

fn codec_error(offset: usize, message: impl Into<String>) -> Error {
    Error::Codec {
        offset,
        message: message.into(),
    }
}

impl<'b> Reader<'b> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'b [u8], Error> {
        if n > self.remaining() {
            return Err(codec_error(
                self.cursor,
                format!(
                    "unexpected end of input: need {n} byte(s), {} left",
                    self.remaining()
                ),
            ));
        }
        let bytes = &self.bytes[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, Error> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_text(&mut self, what: &str) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let start = self.cursor;
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(e) => Err(codec_error(
                start + e.valid_up_to(),
                format!("{what} is not valid UTF-8"),
            )),
        }
    }

    fn read_header(&mut self) -> Result<(), Error> {
        let magic = self.take(MAGIC.len()).map_err(|_| {
            codec_error(0, "input too short for an svmb header")
        })?;
        if magic != MAGIC {
            return Err(codec_error(0, "bad magic, expected \"SVMB\""));
        }
        let version = self.read_u8()?;
        if version != VERSION {
            return Err(codec_error(
                MAGIC.len(),
                format!("unsupported version {version}, expected {VERSION}"),
            ));
        }
        Ok(())
    }

    /// Decode the body of a list record whose tag sits at `tag_offset`
    fn read_list(
        &mut self,
        parent: Option<ScopeId>,
        depth: usize,
        tag_offset: usize,
    ) -> Result<ListRef, Error> {
        if depth > self.max_depth {
            return Err(codec_error(
                tag_offset,
                format!("lists nested deeper than {}", self.max_depth),
            ));
        }
        let count_offset = self.cursor;
        let count = self.read_u32()? as usize;
        if count > self.remaining() / MIN_RECORD_LEN {
            return Err(codec_error(
                count_offset,
                format!(
                    "list claims {count} slots but only {} bytes remain",
                    self.remaining()
                ),
            ));
        }

        let id = self
            .builder
            .open_scope(parent, None)
            .map_err(|msg| codec_error(tag_offset, msg))?;
        let mut slots = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = self.cursor;
            offsets.push(offset);
            slots.push(self.read_slot(id, depth, offset)?);
        }

        self.builder.close_scope(id, slots).map_err(|m| {
            let offset = offsets.get(m.slot).copied().unwrap_or(tag_offset);
            codec_error(offset, m.message)
        })
    }

    fn read_slot(&mut self, scope: ScopeId, depth: usize, offset: usize) -> Result<Slot, Error> {
        let tag = self.read_u8()?;
        let slot = match tag {
            TAG_NUMBER => {
                let n = self.read_f64()?;
                if !n.is_finite() {
                    return Err(codec_error(offset, format!("non-finite number {n}")));
                }
                Slot::Value(Value::Number(n))
            }
            TAG_STRING => Slot::Value(Value::from(self.read_text("string")?)),
            TAG_LIST => Slot::Value(Value::List(self.read_list(Some(scope), depth + 1, offset)?)),
            TAG_NAME => {
                let name = self.read_text("name")?;
                if !is_identifier(&name) {
                    return Err(codec_error(offset, format!("invalid name {name:?}")));
                }
                crate::ast::name(name)
            }
            TAG_OPCODE => {
                let byte = self.read_u8()?;
                match Opcode::from_u8(byte) {
                    Some(op) => Slot::Opcode(op),
                    None => {
                        return Err(codec_error(
                            offset + 1,
                            format!("unknown opcode 0x{byte:02x}"),
                        ));
                    }
                }
            }
            other => {
                return Err(codec_error(offset, format!("unknown record tag 0x{other:02x}")));
            }
        };
        Ok(slot)
    }
}

/// Decode a binary program, validating it completely before returning
pub fn decode_binary(bytes: &[u8], config: &RuntimeConfig) -> Result<ScopeTree, Error> {
    let mut reader = Reader {
        bytes,
        cursor: 0,
        builder: TreeBuilder::new(config.max_parse_depth),
        max_depth: config.max_parse_depth,
    };
    reader.read_header()?;

    let root_offset = reader.cursor;
    let tag = reader.read_u8()?;
    if tag != TAG_LIST {
        return Err(codec_error(
            root_offset,
            format!("program must start with a list record, found tag 0x{tag:02x}"),
        ));
    }
    reader.read_list(None, 0, root_offset)?;

    if reader.remaining() > 0 {
        return Err(codec_error(
            reader.cursor,
            format!("{} trailing byte(s) after the root list", reader.remaining()),
        ));
    }
    let tree = reader
        .builder
        .finish()
        .map_err(|msg| codec_error(bytes.len(), msg))?;
    tracing::debug!(bytes = bytes.len(), scopes = tree.len(), "decoded binary program");
    Ok(tree)
}
