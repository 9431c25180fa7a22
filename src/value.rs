use std::fmt;
use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Char,
    Str,
    I16,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Array(Box<ValueKind>, usize),
}

impl ValueKind {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, ValueKind::Array(..))
    }

    /// Kinds that support ordered comparison in predicates.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, ValueKind::Bool | ValueKind::Array(..))
    }

    fn tag(&self) -> u8 {
        match self {
            ValueKind::Bool => 1,
            ValueKind::Char => 2,
            ValueKind::Str => 3,
            ValueKind::I16 => 4,
            ValueKind::I32 => 5,
            ValueKind::I64 => 6,
            ValueKind::U32 => 7,
            ValueKind::U64 => 8,
            ValueKind::F32 => 9,
            ValueKind::F64 => 10,
            ValueKind::Array(..) => 11,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Char => write!(f, "char"),
            ValueKind::Str => write!(f, "string"),
            ValueKind::I16 => write!(f, "i16"),
            ValueKind::I32 => write!(f, "i32"),
            ValueKind::I64 => write!(f, "i64"),
            ValueKind::U32 => write!(f, "u32"),
            ValueKind::U64 => write!(f, "u64"),
            ValueKind::F32 => write!(f, "f32"),
            ValueKind::F64 => write!(f, "f64"),
            ValueKind::Array(elem, n) => write!(f, "array<{}, {}>", elem, n),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    Bool(bool),
    Char(char),
    Str(String),
    I16(i16),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Array { elem: ValueKind, items: Vec<Value> },
}

impl Value {
    /// Arrays are homogeneous and carry their element kind so that an empty
    /// array still has a definite kind. Element kinds must be primitive.
    pub fn array(elem: ValueKind, items: Vec<Value>) -> Result<Value> {
        if !elem.is_primitive() {
            return Err(Error::Construction(format!(
                "array element kind must be primitive, got {}",
                elem
            )));
        }
        for item in &items {
            if item.kind() != elem {
                return Err(Error::Construction(format!(
                    "array element {:?} does not have kind {}",
                    item, elem
                )));
            }
        }
        Ok(Value::Array { elem, items })
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Char(_) => ValueKind::Char,
            Value::Str(_) => ValueKind::Str,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::Array { elem, items } => {
                ValueKind::Array(Box::new(elem.clone()), items.len())
            }
        }
    }

    /// Ordered comparison for predicate evaluation. Mismatched kinds and
    /// NaN comparisons surface as evaluation errors rather than an
    /// arbitrary ordering.
    pub(crate) fn try_cmp(&self, other: &Value) -> Result<std::cmp::Ordering> {
        let incomparable = || {
            Error::Evaluation(format!(
                "cannot order {:?} against {:?}",
                self, other
            ))
        };
        match (self, other) {
            (Value::Char(a), Value::Char(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::I16(a), Value::I16(b)) => Ok(a.cmp(b)),
            (Value::I32(a), Value::I32(b)) => Ok(a.cmp(b)),
            (Value::I64(a), Value::I64(b)) => Ok(a.cmp(b)),
            (Value::U32(a), Value::U32(b)) => Ok(a.cmp(b)),
            (Value::U64(a), Value::U64(b)) => Ok(a.cmp(b)),
            (Value::F32(a), Value::F32(b)) => a.partial_cmp(b).ok_or_else(incomparable),
            (Value::F64(a), Value::F64(b)) => a.partial_cmp(b).ok_or_else(incomparable),
            _ => Err(incomparable()),
        }
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(self.kind().tag());
        match self {
            Value::Bool(b) => out.push(*b as u8),
            Value::Char(c) => out.extend_from_slice(&(*c as u32).to_le_bytes()),
            Value::Str(s) => {
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::I16(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::I32(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::I64(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::U32(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::U64(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::F32(x) => out.extend_from_slice(&x.to_bits().to_le_bytes()),
            Value::F64(x) => out.extend_from_slice(&x.to_bits().to_le_bytes()),
            Value::Array { elem, items } => {
                out.push(elem.tag());
                out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.write_canonical(out);
                }
            }
        }
    }
}

// Floats compare and hash by bit pattern so values can live in sets and
// identity hashes stay stable.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (
                Value::Array { elem: ea, items: ia },
                Value::Array { elem: eb, items: ib },
            ) => ea == eb && ia == ib,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.kind().tag());
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Char(c) => c.hash(state),
            Value::Str(s) => s.hash(state),
            Value::I16(x) => x.hash(state),
            Value::I32(x) => x.hash(state),
            Value::I64(x) => x.hash(state),
            Value::U32(x) => x.hash(state),
            Value::U64(x) => x.hash(state),
            Value::F32(x) => x.to_bits().hash(state),
            Value::F64(x) => x.to_bits().hash(state),
            Value::Array { items, .. } => items.hash(state),
        }
    }
}

/// Content identity of a tuple: a stable hash over the canonical encoding
/// of its values. Lineage edges reference tuples by this identity, never by
/// in-memory address, so provenance stays valid after persistence and
/// across process restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleId(pub u64);

impl TupleId {
    pub fn from_hex(s: &str) -> Result<TupleId> {
        u64::from_str_radix(s, 16)
            .map(TupleId)
            .map_err(|_| Error::Store(format!("malformed tuple hash {:?}", s)))
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tuple(pub Vec<Value>);

impl Tuple {
    pub fn new(values: Vec<Value>) -> Tuple {
        Tuple(values)
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn id(&self) -> TupleId {
        let mut bytes = Vec::new();
        for value in &self.0 {
            value.write_canonical(&mut bytes);
        }
        TupleId(xxh3_64(&bytes))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema(Vec<Column>);

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Schema> {
        if columns.is_empty() {
            return Err(Error::Construction("schema has no columns".to_owned()));
        }
        for (i, column) in columns.iter().enumerate() {
            if let ValueKind::Array(elem, _) = &column.kind {
                if !elem.is_primitive() {
                    return Err(Error::Construction(format!(
                        "column {} has nested array kind {}",
                        column.name, column.kind
                    )));
                }
            }
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::Construction(format!(
                    "duplicate column name {}",
                    column.name
                )));
            }
        }
        Ok(Schema(columns))
    }

    pub fn of(columns: &[(&str, ValueKind)]) -> Result<Schema> {
        Schema::new(
            columns
                .iter()
                .map(|(name, kind)| Column {
                    name: (*name).to_owned(),
                    kind: kind.clone(),
                })
                .collect(),
        )
    }

    pub fn columns(&self) -> &[Column] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|c| c.name == name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ValueKind> {
        self.0.iter().map(|c| &c.kind)
    }

    pub fn admits(&self, tuple: &Tuple) -> bool {
        tuple.arity() == self.arity()
            && tuple
                .0
                .iter()
                .zip(self.kinds())
                .all(|(value, kind)| value.kind() == *kind)
    }
}
