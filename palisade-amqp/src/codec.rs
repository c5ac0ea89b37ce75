//! AMQP 1.0 primitive type encoding and decoding.
//!
//! Implements the subset of the AMQP 1.0 type system used by the frames in
//! this crate: fixed-width scalars, variable-width binaries/strings/symbols,
//! lists, maps, and described types. Array types and the exotic scalar
//! widths are not emitted by either end of a palisade link and decode as
//! errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unknown type constructor: 0x{0:02x}")]
    UnknownConstructor(u8),
    #[error("invalid utf-8 in string or symbol")]
    InvalidUtf8,
    #[error("declared size exceeds remaining input")]
    BadSize,
    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
}

/// A decoded AMQP value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Int(i32),
    Long(i64),
    Binary(Bytes),
    String(String),
    Symbol(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// descriptor + described value
    Described(Box<Value>, Box<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::UByte(_) => "ubyte",
            Self::UShort(_) => "ushort",
            Self::UInt(_) => "uint",
            Self::ULong(_) => "ulong",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Binary(_) => "binary",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Described(..) => "described",
        }
    }

    // --- Decoding accessors. `Null` maps to `None`; a present value of the
    // --- wrong type is an error.

    pub fn into_opt_u32(self) -> Result<Option<u32>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::UByte(n) => Ok(Some(u32::from(n))),
            Self::UShort(n) => Ok(Some(u32::from(n))),
            Self::UInt(n) => Ok(Some(n)),
            other => Err(unexpected("uint", &other)),
        }
    }

    pub fn into_opt_u16(self) -> Result<Option<u16>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::UByte(n) => Ok(Some(u16::from(n))),
            Self::UShort(n) => Ok(Some(n)),
            other => Err(unexpected("ushort", &other)),
        }
    }

    pub fn into_opt_u8(self) -> Result<Option<u8>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::UByte(n) => Ok(Some(n)),
            other => Err(unexpected("ubyte", &other)),
        }
    }

    pub fn into_opt_bool(self) -> Result<Option<bool>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::Bool(b) => Ok(Some(b)),
            other => Err(unexpected("bool", &other)),
        }
    }

    pub fn into_opt_string(self) -> Result<Option<String>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::String(s) => Ok(Some(s)),
            other => Err(unexpected("string", &other)),
        }
    }

    pub fn into_opt_symbol(self) -> Result<Option<String>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::Symbol(s) => Ok(Some(s)),
            other => Err(unexpected("symbol", &other)),
        }
    }

    pub fn into_opt_binary(self) -> Result<Option<Bytes>, CodecError> {
        match self {
            Self::Null => Ok(None),
            Self::Binary(b) => Ok(Some(b)),
            other => Err(unexpected("binary", &other)),
        }
    }
}

fn unexpected(expected: &'static str, found: &Value) -> CodecError {
    CodecError::UnexpectedType {
        expected,
        found: found.type_name(),
    }
}

/// Encode `value` onto the end of `buf`.
pub fn encode(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(0x40),
        Value::Bool(true) => buf.put_u8(0x41),
        Value::Bool(false) => buf.put_u8(0x42),
        Value::UByte(n) => {
            buf.put_u8(0x50);
            buf.put_u8(*n);
        }
        Value::UShort(n) => {
            buf.put_u8(0x60);
            buf.put_u16(*n);
        }
        Value::UInt(n) => match n {
            0 => buf.put_u8(0x43),
            1..=255 => {
                buf.put_u8(0x52);
                buf.put_u8(*n as u8);
            }
            _ => {
                buf.put_u8(0x70);
                buf.put_u32(*n);
            }
        },
        Value::ULong(n) => match n {
            0 => buf.put_u8(0x44),
            1..=255 => {
                buf.put_u8(0x53);
                buf.put_u8(*n as u8);
            }
            _ => {
                buf.put_u8(0x80);
                buf.put_u64(*n);
            }
        },
        Value::Int(n) =>
            if let Ok(small) = i8::try_from(*n) {
                buf.put_u8(0x54);
                buf.put_i8(small);
            } else {
                buf.put_u8(0x71);
                buf.put_i32(*n);
            },
        Value::Long(n) =>
            if let Ok(small) = i8::try_from(*n) {
                buf.put_u8(0x55);
                buf.put_i8(small);
            } else {
                buf.put_u8(0x81);
                buf.put_i64(*n);
            },
        Value::Binary(bytes) => {
            if bytes.len() <= 255 {
                buf.put_u8(0xa0);
                buf.put_u8(bytes.len() as u8);
            } else {
                buf.put_u8(0xb0);
                buf.put_u32(bytes.len() as u32);
            }
            buf.put_slice(bytes);
        }
        Value::String(s) => {
            if s.len() <= 255 {
                buf.put_u8(0xa1);
                buf.put_u8(s.len() as u8);
            } else {
                buf.put_u8(0xb1);
                buf.put_u32(s.len() as u32);
            }
            buf.put_slice(s.as_bytes());
        }
        Value::Symbol(s) => {
            if s.len() <= 255 {
                buf.put_u8(0xa3);
                buf.put_u8(s.len() as u8);
            } else {
                buf.put_u8(0xb3);
                buf.put_u32(s.len() as u32);
            }
            buf.put_slice(s.as_bytes());
        }
        Value::List(items) => {
            if items.is_empty() {
                buf.put_u8(0x45);
                return;
            }
            let mut body = BytesMut::new();
            for item in items {
                encode(item, &mut body);
            }
            put_compound(buf, 0xc0, 0xd0, items.len(), &body);
        }
        Value::Map(pairs) => {
            let mut body = BytesMut::new();
            for (k, v) in pairs {
                encode(k, &mut body);
                encode(v, &mut body);
            }
            put_compound(buf, 0xc1, 0xd1, pairs.len() * 2, &body);
        }
        Value::Described(descriptor, described) => {
            buf.put_u8(0x00);
            encode(descriptor, buf);
            encode(described, buf);
        }
    }
}

/// Write a list/map body with the small encoding when it fits.
fn put_compound(
    buf: &mut BytesMut,
    small: u8,
    large: u8,
    count: usize,
    body: &[u8],
) {
    // size field counts the count field plus the body
    if body.len() + 1 <= 255 && count <= 255 {
        buf.put_u8(small);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(large);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_u32(count as u32);
    }
    buf.put_slice(body);
}

/// Decode a single value off the front of `buf`.
pub fn decode(buf: &mut Bytes) -> Result<Value, CodecError> {
    let constructor = get_u8(buf)?;
    match constructor {
        0x00 => {
            let descriptor = decode(buf)?;
            let described = decode(buf)?;
            Ok(Value::Described(
                Box::new(descriptor),
                Box::new(described),
            ))
        }
        0x40 => Ok(Value::Null),
        0x41 => Ok(Value::Bool(true)),
        0x42 => Ok(Value::Bool(false)),
        0x56 => match get_u8(buf)? {
            0 => Ok(Value::Bool(false)),
            _ => Ok(Value::Bool(true)),
        },
        0x50 => Ok(Value::UByte(get_u8(buf)?)),
        0x60 => Ok(Value::UShort(get_u16(buf)?)),
        0x43 => Ok(Value::UInt(0)),
        0x52 => Ok(Value::UInt(u32::from(get_u8(buf)?))),
        0x70 => Ok(Value::UInt(get_u32(buf)?)),
        0x44 => Ok(Value::ULong(0)),
        0x53 => Ok(Value::ULong(u64::from(get_u8(buf)?))),
        0x80 => Ok(Value::ULong(get_u64(buf)?)),
        0x54 => Ok(Value::Int(i32::from(get_u8(buf)? as i8))),
        0x71 => Ok(Value::Int(get_u32(buf)? as i32)),
        0x55 => Ok(Value::Long(i64::from(get_u8(buf)? as i8))),
        0x81 => Ok(Value::Long(get_u64(buf)? as i64)),
        0xa0 => {
            let len = usize::from(get_u8(buf)?);
            Ok(Value::Binary(get_bytes(buf, len)?))
        }
        0xb0 => {
            let len = get_u32(buf)? as usize;
            Ok(Value::Binary(get_bytes(buf, len)?))
        }
        0xa1 => {
            let len = usize::from(get_u8(buf)?);
            Ok(Value::String(get_string(buf, len)?))
        }
        0xb1 => {
            let len = get_u32(buf)? as usize;
            Ok(Value::String(get_string(buf, len)?))
        }
        0xa3 => {
            let len = usize::from(get_u8(buf)?);
            Ok(Value::Symbol(get_string(buf, len)?))
        }
        0xb3 => {
            let len = get_u32(buf)? as usize;
            Ok(Value::Symbol(get_string(buf, len)?))
        }
        0x45 => Ok(Value::List(Vec::new())),
        0xc0 => {
            let size = usize::from(get_u8(buf)?);
            let mut body = get_bytes(buf, size)?;
            let count = usize::from(get_u8(&mut body)?);
            decode_list(&mut body, count)
        }
        0xd0 => {
            let size = get_u32(buf)? as usize;
            let mut body = get_bytes(buf, size)?;
            let count = get_u32(&mut body)? as usize;
            decode_list(&mut body, count)
        }
        0xc1 => {
            let size = usize::from(get_u8(buf)?);
            let mut body = get_bytes(buf, size)?;
            let count = usize::from(get_u8(&mut body)?);
            decode_map(&mut body, count)
        }
        0xd1 => {
            let size = get_u32(buf)? as usize;
            let mut body = get_bytes(buf, size)?;
            let count = get_u32(&mut body)? as usize;
            decode_map(&mut body, count)
        }
        other => Err(CodecError::UnknownConstructor(other)),
    }
}

fn decode_list(body: &mut Bytes, count: usize) -> Result<Value, CodecError> {
    let mut items = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        items.push(decode(body)?);
    }
    Ok(Value::List(items))
}

fn decode_map(body: &mut Bytes, count: usize) -> Result<Value, CodecError> {
    if count % 2 != 0 {
        return Err(CodecError::BadSize);
    }
    let mut pairs = Vec::with_capacity((count / 2).min(64));
    for _ in 0..count / 2 {
        let k = decode(body)?;
        let v = decode(body)?;
        pairs.push((k, v));
    }
    Ok(Value::Map(pairs))
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::UnexpectedEnd);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::UnexpectedEnd);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::UnexpectedEnd);
    }
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::BadSize);
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes, len: usize) -> Result<String, CodecError> {
    let bytes = get_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}
