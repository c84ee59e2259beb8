//! Wire encoding of directory records.
//!
//! A record is a length-prefixed, versioned, field-tagged list of entries.
//! Field tags carry a wire type (varint or length-delimited) so readers can
//! skip fields they do not recognize, preserving forward compatibility.

use std::fmt;

use crate::dir::PathComponent;
use crate::inode::InodeNumber;
use crate::model::ObjectId;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Version written by this encoder. Readers accept exactly this version and
/// skip unknown fields within it.
pub const FORMAT_VERSION: u64 = 1;

const WIRE_VARINT: u64 = 0;
const WIRE_BYTES: u64 = 2;

const FIELD_NAME: u64 = 1;
const FIELD_MODE: u64 = 2;
const FIELD_INODE: u64 = 3;
const FIELD_OBJECT_ID: u64 = 4;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Serialized form of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub mode: u32,
    pub inode: InodeNumber,
    /// Source-control object the entry matches, absent once materialized.
    pub id: Option<ObjectId>,
}

impl OverlayEntry {
    pub fn is_materialized(&self) -> bool {
        self.id.is_none()
    }
}

/// Serialized form of one directory: the unit of storage in the inode
/// catalog. Entry order is preserved exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OverlayDir {
    pub entries: Vec<(PathComponent, OverlayEntry)>,
}

impl OverlayDir {
    pub fn new() -> Self {
        OverlayDir::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&OverlayEntry> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, entry)| entry)
    }
}

/// A record that could not be decoded.
#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for DecodeError {}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(input: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| DecodeError("truncated varint".into()))?;
        *input = rest;
        if shift >= 64 {
            return Err(DecodeError("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn get_bytes<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let len = get_varint(input)? as usize;
    if input.len() < len {
        return Err(DecodeError(format!(
            "truncated field: need {} bytes, have {}",
            len,
            input.len()
        )));
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Ok(bytes)
}

fn put_tag(out: &mut Vec<u8>, field: u64, wire: u64) {
    put_varint(out, (field << 3) | wire);
}

/// Encodes a directory record.
pub fn encode_dir(dir: &OverlayDir) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + dir.entries.len() * 32);
    put_varint(&mut out, FORMAT_VERSION);
    put_varint(&mut out, dir.entries.len() as u64);
    for (name, entry) in &dir.entries {
        put_tag(&mut out, FIELD_NAME, WIRE_BYTES);
        put_varint(&mut out, name.as_str().len() as u64);
        out.extend_from_slice(name.as_str().as_bytes());

        put_tag(&mut out, FIELD_MODE, WIRE_VARINT);
        put_varint(&mut out, u64::from(entry.mode));

        put_tag(&mut out, FIELD_INODE, WIRE_VARINT);
        put_varint(&mut out, entry.inode.get());

        if let Some(id) = &entry.id {
            put_tag(&mut out, FIELD_OBJECT_ID, WIRE_BYTES);
            put_varint(&mut out, id.as_bytes().len() as u64);
            out.extend_from_slice(id.as_bytes());
        }

        // End-of-entry marker.
        put_varint(&mut out, 0);
    }
    out
}

/// Decodes a directory record, skipping unknown fields.
pub fn decode_dir(mut input: &[u8]) -> Result<OverlayDir, DecodeError> {
    let input = &mut input;
    let version = get_varint(input)?;
    if version != FORMAT_VERSION {
        return Err(DecodeError(format!(
            "unsupported directory record version {}",
            version
        )));
    }
    let count = get_varint(input)? as usize;
    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        entries.push(decode_entry(input)?);
    }
    if !input.is_empty() {
        return Err(DecodeError(format!(
            "{} trailing bytes after directory record",
            input.len()
        )));
    }
    Ok(OverlayDir { entries })
}

fn decode_entry(input: &mut &[u8]) -> Result<(PathComponent, OverlayEntry), DecodeError> {
    let mut name = None;
    let mut mode = None;
    let mut inode = None;
    let mut id: Option<ObjectId> = None;

    loop {
        let tag = get_varint(input)?;
        if tag == 0 {
            break;
        }
        let field = tag >> 3;
        let wire = tag & 0x7;
        match (field, wire) {
            (FIELD_NAME, WIRE_BYTES) => {
                let bytes = get_bytes(input)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError("entry name is not valid UTF-8".into()))?;
                let component = PathComponent::new(text)
                    .map_err(|_| DecodeError(format!("invalid entry name {:?}", text)))?;
                name = Some(component);
            }
            (FIELD_MODE, WIRE_VARINT) => {
                let value = get_varint(input)?;
                let value = u32::try_from(value)
                    .map_err(|_| DecodeError(format!("entry mode {} out of range", value)))?;
                mode = Some(value);
            }
            (FIELD_INODE, WIRE_VARINT) => {
                let value = get_varint(input)?;
                let value = InodeNumber::from_raw(value)
                    .ok_or_else(|| DecodeError("entry has inode number 0".into()))?;
                inode = Some(value);
            }
            (FIELD_OBJECT_ID, WIRE_BYTES) => {
                let bytes = get_bytes(input)?;
                // An empty identifier means the same thing as no identifier.
                if !bytes.is_empty() {
                    id = Some(ObjectId::from_bytes(bytes));
                }
            }
            (_, WIRE_VARINT) => {
                get_varint(input)?;
            }
            (_, WIRE_BYTES) => {
                get_bytes(input)?;
            }
            (_, wire) => {
                return Err(DecodeError(format!("unsupported wire type {}", wire)));
            }
        }
    }

    let name = name.ok_or_else(|| DecodeError("entry is missing a name".into()))?;
    let mode = mode
        .ok_or_else(|| DecodeError(format!("entry {:?} is missing a mode", name.as_str())))?;
    let inode = inode.ok_or_else(|| {
        DecodeError(format!("entry {:?} is missing an inode number", name.as_str()))
    })?;
    Ok((name, OverlayEntry { mode, inode, id }))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
