//! Typed multi-part framing over an unspecified transport.
//!
//! A logical message is an ordered sequence of typed fields, optionally
//! addressed to a peer. On the wire, every message becomes one frame of the
//! shape `SIGN@ADDR:L1:L2:...:LN:+F1F2...FN` (spec §4.1): `SIGN` rejects
//! cross-wired ports sharing a transport, `ADDR` is either a stable peer
//! identity or the literal `none`, each `Li` is the byte length of field i,
//! and the field bytes themselves follow concatenated without delimiters.

pub mod codec;
pub mod socket;

use serde::{Deserialize, Serialize};

/// A raw, not-yet-schema-cast field as it travels on the wire: an opaque
/// byte string. The protocol engine casts these against a [`FieldType`]
/// once it knows which schema entry applies.
pub type RawField = Vec<u8>;

/// A frame after signature/length/field-count validation, before schema
/// casting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Peer identity carried out-of-band by a router-type channel, or the
    /// address stamped in the textual header otherwise. `None` corresponds
    /// to the wire literal `none`.
    pub address: Option<String>,
    pub fields: Vec<RawField>,
}

impl RawFrame {
    pub fn header(&self) -> Option<&[u8]> {
        self.fields.first().map(|v| v.as_slice())
    }

    pub fn header_str(&self) -> Option<&str> {
        self.header().and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Field types drawn from the schema alphabet (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Bool,
    Str,
    Bytes,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Bool => "bool",
            FieldType::Str => "str",
            FieldType::Bytes => "bytes",
        }
    }
}

/// A schema-cast field value, the tagged variant called for in the design
/// notes in place of the dynamically-typed mapping the original used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Casts a raw wire field to its declared type. Booleans are cast from
    /// the single bytes `0`/`1`, never from the literal strings `"true"` /
    /// `"false"` (spec §4.6 step 3).
    pub fn cast(raw: &RawField, ty: FieldType, index: usize) -> Result<Self, crate::error::FrameError> {
        use crate::error::FrameError;
        match ty {
            FieldType::Str => std::str::from_utf8(raw)
                .map(|s| FieldValue::Str(s.to_string()))
                .map_err(|_| FrameError::CastFailure { index, expected: "str" }),
            FieldType::Bytes => Ok(FieldValue::Bytes(raw.clone())),
            FieldType::Int => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .map(FieldValue::Int)
                .ok_or(FrameError::CastFailure { index, expected: "int" }),
            FieldType::Bool => match raw.as_slice() {
                b"0" => Ok(FieldValue::Bool(false)),
                b"1" => Ok(FieldValue::Bool(true)),
                _ => Err(FrameError::CastFailure { index, expected: "bool" }),
            },
        }
    }

    /// Encodes a typed field back to its raw wire representation.
    pub fn to_raw(&self) -> RawField {
        match self {
            FieldValue::Str(s) => s.as_bytes().to_vec(),
            FieldValue::Bytes(b) => b.clone(),
            FieldValue::Int(v) => v.to_string().into_bytes(),
            FieldValue::Bool(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
        }
    }
}

/// A message ready for dispatch: a header name plus schema-cast fields, and
/// the peer address it arrived from (if any).
#[derive(Debug, Clone)]
pub struct Inbound {
    pub address: Option<String>,
    pub header: String,
    pub fields: Vec<FieldValue>,
}

/// Field descriptor within a schema entry: `{name, type}` (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub ty: FieldType,
}

pub const fn field(name: &'static str, ty: FieldType) -> FieldDescriptor {
    FieldDescriptor { name, ty }
}
