use std::fmt;
use std::sync::Arc;

use crate::Ident;

/// Fixed-width unsigned integer with wrapping arithmetic.
///
/// `Uint::new(24, (1 << 24) + 7)` holds `7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uint {
    bits: u8,
    value: u64,
}

impl Uint {
    pub const DEFAULT_BITS: u8 = 24;

    pub fn new(bits: u8, value: u64) -> Self {
        let bits = bits.clamp(1, 64);
        Self {
            bits,
            value: value & Self::mask(bits),
        }
    }

    pub fn u24(value: u64) -> Self {
        Self::new(24, value)
    }

    #[inline]
    pub fn mask(bits: u8) -> u64 {
        if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for Uint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// An instance of a declared record type, as host code sees it.
#[derive(Debug, Clone)]
pub struct Record {
    pub ty: Ident,
    pub fields: Vec<Value>,
}

impl Record {
    pub fn new(ty: impl Into<Ident>, fields: Vec<Value>) -> Self {
        Self {
            ty: ty.into(),
            fields,
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((a, b)) = pending.pop() {
            if a.ty != b.ty || a.fields.len() != b.fields.len() {
                return false;
            }
            for pair in a.fields.iter().zip(&b.fields) {
                match pair {
                    (Value::Record(x), Value::Record(y)) => {
                        if !Arc::ptr_eq(x, y) {
                            pending.push((x, y));
                        }
                    }
                    (x, y) if x != y => return false,
                    _ => {}
                }
            }
        }
        true
    }
}

// Long chains (a million-element list) would otherwise drop recursively.
impl Drop for Record {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.fields);
        while let Some(value) = stack.pop() {
            if let Value::Record(record) = value
                && let Some(mut record) = Arc::into_inner(record)
            {
                stack.append(&mut record.fields);
            }
        }
    }
}

/// Host-visible value crossing the boundary into and out of compiled code.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Plain host integer without a declared width.
    Int(u64),
    Uint(Uint),
    Record(Arc<Record>),
    /// The incomplete-match sentinel. Equal only to itself.
    #[default]
    Incomplete,
}

impl Value {
    pub fn record(ty: &str, fields: Vec<Value>) -> Self {
        Value::Record(Arc::new(Record::new(ty, fields)))
    }

    pub fn u24(value: u64) -> Self {
        Value::Uint(Uint::u24(value))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Value::Incomplete)
    }

    /// Integer payload, reading an untyped `Int` at `default_bits`.
    pub fn as_uint(&self, default_bits: u8) -> Option<Uint> {
        match self {
            Value::Int(n) => Some(Uint::new(default_bits, *n)),
            Value::Uint(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Int(_) => "int".to_string(),
            Value::Uint(u) => format!("u{}", u.bits()),
            Value::Record(r) => r.ty.as_str(),
            Value::Incomplete => "incomplete".to_string(),
        }
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<Uint> for Value {
    fn from(u: Uint) -> Self {
        Value::Uint(u)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(Arc::new(r))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        enum Piece<'a> {
            Value(&'a Value),
            Text(&'static str),
        }

        let mut stack = vec![Piece::Value(self)];
        while let Some(piece) = stack.pop() {
            match piece {
                Piece::Text(text) => write!(f, "{}", text)?,
                Piece::Value(Value::Int(n)) => write!(f, "{}", n)?,
                Piece::Value(Value::Uint(u)) => write!(f, "{}", u)?,
                Piece::Value(Value::Incomplete) => write!(f, "<incomplete>")?,
                Piece::Value(Value::Record(r)) => {
                    write!(f, "{}(", r.ty)?;
                    stack.push(Piece::Text(")"));
                    for (i, field) in r.fields.iter().enumerate().rev() {
                        stack.push(Piece::Value(field));
                        if i > 0 {
                            stack.push(Piece::Text(", "));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
