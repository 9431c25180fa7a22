use std::fmt;

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::value::{Schema, Value, ValueKind};

/// Storage column-type descriptor, as emitted by a codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnType(pub String);

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-neutral serialized value.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Maps value kinds to storage column types and values to/from their
/// serialized representation. Statically dispatched: the store and engine
/// are generic over the codec, so the diagnostic codec can stand in for
/// the real one in tests without touching a store.
pub trait Codec {
    fn column_type(kind: &ValueKind) -> ColumnType;
    fn encode(value: &Value) -> StorageValue;
    fn decode(kind: &ValueKind, stored: &StorageValue) -> Result<Value>;
}

/// The column name/type list for a collection, as consumed by the store's
/// provisioning step and by external tools inspecting persisted history.
pub fn export_schema<C: Codec>(schema: &Schema) -> Vec<(String, ColumnType)> {
    schema
        .columns()
        .iter()
        .map(|c| (c.name.clone(), C::column_type(&c.kind)))
        .collect()
}

/// The real codec: maps to SQLite's native column types.
pub struct SqliteCodec;

impl Codec for SqliteCodec {
    fn column_type(kind: &ValueKind) -> ColumnType {
        let name = match kind {
            ValueKind::Bool
            | ValueKind::I16
            | ValueKind::I32
            | ValueKind::I64
            | ValueKind::U32
            | ValueKind::U64 => "INTEGER",
            ValueKind::F32 | ValueKind::F64 => "REAL",
            ValueKind::Char | ValueKind::Str | ValueKind::Array(..) => "TEXT",
        };
        ColumnType(name.to_owned())
    }

    fn encode(value: &Value) -> StorageValue {
        match value {
            Value::Bool(b) => StorageValue::Integer(*b as i64),
            Value::Char(c) => StorageValue::Text(c.to_string()),
            Value::Str(s) => StorageValue::Text(s.clone()),
            Value::I16(x) => StorageValue::Integer(*x as i64),
            Value::I32(x) => StorageValue::Integer(*x as i64),
            Value::I64(x) => StorageValue::Integer(*x),
            Value::U32(x) => StorageValue::Integer(*x as i64),
            // SQLite integers are i64; u64 is stored as the raw 64-bit
            // pattern and reinterpreted on decode.
            Value::U64(x) => StorageValue::Integer(*x as i64),
            Value::F32(x) => StorageValue::Real(*x as f64),
            Value::F64(x) => StorageValue::Real(*x),
            Value::Array { items, .. } => StorageValue::Text(array_text(items)),
        }
    }

    fn decode(kind: &ValueKind, stored: &StorageValue) -> Result<Value> {
        let mismatch = || {
            Error::Store(format!(
                "stored value {:?} does not decode as {}",
                stored, kind
            ))
        };
        match (kind, stored) {
            (ValueKind::Bool, StorageValue::Integer(x)) => Ok(Value::Bool(*x != 0)),
            (ValueKind::Char, StorageValue::Text(s)) => {
                s.chars().exactly_one().map(Value::Char).map_err(|_| mismatch())
            }
            (ValueKind::Str, StorageValue::Text(s)) => Ok(Value::Str(s.clone())),
            (ValueKind::I16, StorageValue::Integer(x)) => {
                i16::try_from(*x).map(Value::I16).map_err(|_| mismatch())
            }
            (ValueKind::I32, StorageValue::Integer(x)) => {
                i32::try_from(*x).map(Value::I32).map_err(|_| mismatch())
            }
            (ValueKind::I64, StorageValue::Integer(x)) => Ok(Value::I64(*x)),
            (ValueKind::U32, StorageValue::Integer(x)) => {
                u32::try_from(*x).map(Value::U32).map_err(|_| mismatch())
            }
            (ValueKind::U64, StorageValue::Integer(x)) => Ok(Value::U64(*x as u64)),
            (ValueKind::F32, StorageValue::Real(x)) => Ok(Value::F32(*x as f32)),
            (ValueKind::F64, StorageValue::Real(x)) => Ok(Value::F64(*x)),
            (ValueKind::Array(elem, n), StorageValue::Text(s)) => {
                let items = parse_array(elem, *n, s)?;
                Value::array((**elem).clone(), items)
                    .map_err(|e| Error::Store(e.to_string()))
            }
            _ => Err(mismatch()),
        }
    }
}

/// The diagnostic codec: every kind maps to its native type name and every
/// value passes through as human-readable text. Used to verify schema
/// generation and serialization without a real store behind it.
pub struct MockCodec;

impl Codec for MockCodec {
    fn column_type(kind: &ValueKind) -> ColumnType {
        ColumnType(kind.to_string())
    }

    fn encode(value: &Value) -> StorageValue {
        let text = match value {
            Value::Bool(b) => if *b { "true" } else { "false" }.to_owned(),
            Value::Char(c) => c.to_string(),
            Value::Str(s) => s.clone(),
            Value::I16(x) => x.to_string(),
            Value::I32(x) => x.to_string(),
            Value::I64(x) => x.to_string(),
            Value::U32(x) => x.to_string(),
            Value::U64(x) => x.to_string(),
            Value::F32(x) => x.to_string(),
            Value::F64(x) => x.to_string(),
            Value::Array { items, .. } => array_text(items),
        };
        StorageValue::Text(text)
    }

    fn decode(kind: &ValueKind, stored: &StorageValue) -> Result<Value> {
        let text = match stored {
            StorageValue::Text(s) => s,
            _ => {
                return Err(Error::Store(format!(
                    "mock codec stores text, got {:?}",
                    stored
                )))
            }
        };
        match kind {
            ValueKind::Str => Ok(Value::Str(text.clone())),
            ValueKind::Char => text
                .chars()
                .exactly_one()
                .map(Value::Char)
                .map_err(|_| Error::Store(format!("not a char: {:?}", text))),
            ValueKind::Array(elem, n) => {
                let items = parse_array(elem, *n, text)?;
                Value::array((**elem).clone(), items)
                    .map_err(|e| Error::Store(e.to_string()))
            }
            _ => plain_scalar(kind, text),
        }
    }
}

/// Arrays serialize as an ordered bracketed sequence of element values.
/// String and char elements are double-quoted with backslash escapes so the
/// format round-trips exactly.
fn array_text(items: &[Value]) -> String {
    let rendered = items.iter().map(elem_text).join(", ");
    format!("[{}]", rendered)
}

fn elem_text(value: &Value) -> String {
    match value {
        Value::Str(s) => quote(s),
        Value::Char(c) => quote(&c.to_string()),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_owned(),
        Value::I16(x) => x.to_string(),
        Value::I32(x) => x.to_string(),
        Value::I64(x) => x.to_string(),
        Value::U32(x) => x.to_string(),
        Value::U64(x) => x.to_string(),
        Value::F32(x) => x.to_string(),
        Value::F64(x) => x.to_string(),
        Value::Array { items, .. } => array_text(items),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_array(elem: &ValueKind, len: usize, text: &str) -> Result<Vec<Value>> {
    let bad = || Error::Store(format!("malformed array text {:?}", text));
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(bad)?;
    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('"') => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => s.push(c),
                            None => return Err(bad()),
                        },
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => return Err(bad()),
                    }
                }
                items.push(quoted_scalar(elem, s)?);
                while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                    chars.next();
                }
                match chars.next() {
                    Some(',') | None => {}
                    Some(_) => return Err(bad()),
                }
            }
            Some(_) => {
                let mut s = String::new();
                loop {
                    match chars.peek() {
                        Some(',') => {
                            chars.next();
                            break;
                        }
                        None => break,
                        Some(_) => {
                            if let Some(c) = chars.next() {
                                s.push(c);
                            }
                        }
                    }
                }
                items.push(plain_scalar(elem, s.trim())?);
            }
        }
    }
    if items.len() != len {
        return Err(Error::Store(format!(
            "array text {:?} has {} elements, expected {}",
            text,
            items.len(),
            len
        )));
    }
    Ok(items)
}

fn quoted_scalar(kind: &ValueKind, s: String) -> Result<Value> {
    match kind {
        ValueKind::Str => Ok(Value::Str(s)),
        ValueKind::Char => s
            .chars()
            .exactly_one()
            .map(Value::Char)
            .map_err(|_| Error::Store(format!("not a char: {:?}", s))),
        _ => Err(Error::Store(format!(
            "quoted element where {} expected",
            kind
        ))),
    }
}

fn plain_scalar(kind: &ValueKind, s: &str) -> Result<Value> {
    let bad = || Error::Store(format!("cannot parse {:?} as {}", s, kind));
    match kind {
        ValueKind::Bool => match s {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        ValueKind::I16 => s.parse().map(Value::I16).map_err(|_| bad()),
        ValueKind::I32 => s.parse().map(Value::I32).map_err(|_| bad()),
        ValueKind::I64 => s.parse().map(Value::I64).map_err(|_| bad()),
        ValueKind::U32 => s.parse().map(Value::U32).map_err(|_| bad()),
        ValueKind::U64 => s.parse().map(Value::U64).map_err(|_| bad()),
        ValueKind::F32 => s.parse().map(Value::F32).map_err(|_| bad()),
        ValueKind::F64 => s.parse().map(Value::F64).map_err(|_| bad()),
        ValueKind::Char | ValueKind::Str | ValueKind::Array(..) => Err(bad()),
    }
}
