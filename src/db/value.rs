use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use rusqlite::types::{Value, ValueRef};
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::{AdapterError, AdapterResult};

/// Text layout used for date-only values.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Text layout used for date-time values, millisecond precision with offset.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Native field type reported by a backend for one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Int16,
    Int32,
    Int64,
    Byte,
    Boolean,
    Float32,
    Float64,
    Decimal,
    String,
    Char,
    Date,
    DateTime,
    DateTimeOffset,
    /// Anything else, carrying the backend's type name.
    Other(String),
}

/// Storage class declared to SQLite for a remote column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostType {
    Integer,
    Real,
    Text,
}

impl HostType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            HostType::Integer => "integer",
            HostType::Real => "real",
            HostType::Text => "text",
        }
    }
}

impl FieldType {
    /// Schema direction: collapse a backend type onto a SQLite storage class.
    pub fn host_type(&self) -> HostType {
        match self {
            FieldType::Int16
            | FieldType::Int32
            | FieldType::Int64
            | FieldType::Byte
            | FieldType::Boolean => HostType::Integer,
            FieldType::Float32 | FieldType::Float64 | FieldType::Decimal => HostType::Real,
            FieldType::String
            | FieldType::Char
            | FieldType::Date
            | FieldType::DateTime
            | FieldType::DateTimeOffset
            | FieldType::Other(_) => HostType::Text,
        }
    }
}

/// One field of the current row, as produced by a backend driver.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Byte(u8),
    Boolean(bool),
    Float32(f32),
    Float64(f64),
    /// Fixed-point values arrive already narrowed to `f64`.
    Decimal(f64),
    String(String),
    Char(char),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    /// The driver's own text rendering of a value with no closer mapping.
    Other(String),
}

impl FieldValue {
    /// Row direction: convert to the value handed to SQLite.
    ///
    /// Text is passed with an explicit length, so embedded NUL characters
    /// survive intact.
    pub fn to_host(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Int16(v) => Value::Integer(i64::from(*v)),
            FieldValue::Int32(v) => Value::Integer(i64::from(*v)),
            FieldValue::Int64(v) => Value::Integer(*v),
            FieldValue::Byte(v) => Value::Integer(i64::from(*v)),
            FieldValue::Boolean(v) => Value::Integer(i64::from(*v)),
            FieldValue::Float32(v) => Value::Real(f64::from(*v)),
            FieldValue::Float64(v) | FieldValue::Decimal(v) => Value::Real(*v),
            FieldValue::String(s) | FieldValue::Other(s) => Value::Text(s.clone()),
            FieldValue::Char(c) => Value::Text(c.to_string()),
            FieldValue::Date(d) => Value::Text(d.format(DATE_FORMAT).to_string()),
            FieldValue::DateTime(dt) => Value::Text(format_naive_datetime(dt)),
            FieldValue::DateTimeOffset(dt) => Value::Text(dt.format(DATETIME_FORMAT).to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Stable 64-bit hash of this value.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Naive date-times carry no offset of their own and are rendered as UTC.
pub fn format_naive_datetime(dt: &NaiveDateTime) -> String {
    dt.and_utc().fixed_offset().format(DATETIME_FORMAT).to_string()
}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldValue::Null => {}
            FieldValue::Int16(v) => v.hash(state),
            FieldValue::Int32(v) => v.hash(state),
            FieldValue::Int64(v) => v.hash(state),
            FieldValue::Byte(v) => v.hash(state),
            FieldValue::Boolean(v) => v.hash(state),
            FieldValue::Float32(v) => v.to_bits().hash(state),
            FieldValue::Float64(v) | FieldValue::Decimal(v) => v.to_bits().hash(state),
            FieldValue::String(s) | FieldValue::Other(s) => s.hash(state),
            FieldValue::Char(c) => c.hash(state),
            FieldValue::Date(d) => d.hash(state),
            FieldValue::DateTime(dt) => dt.hash(state),
            FieldValue::DateTimeOffset(dt) => dt.hash(state),
        }
    }
}

/// Best-effort identity for a row: the XOR of every value's hash.
///
/// Collisions are possible and identical rows share an identity, so this is
/// only a per-scan distinguishing token, never a key.
pub fn row_identity<'a, I>(values: I) -> i64
where
    I: IntoIterator<Item = &'a FieldValue>,
{
    values
        .into_iter()
        .fold(0u64, |acc, value| acc ^ value.hash_code()) as i64
}

/// A SQLite filter argument translated into a backend parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl BoundValue {
    /// Only integer, real, text and null arguments can be pushed down.
    pub fn from_host(value: ValueRef<'_>) -> AdapterResult<Self> {
        match value {
            ValueRef::Null => Ok(BoundValue::Null),
            ValueRef::Integer(i) => Ok(BoundValue::Int(i)),
            ValueRef::Real(f) => Ok(BoundValue::Real(f)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| BoundValue::Text(s.to_string()))
                .map_err(|_| AdapterError::UnsupportedArgument("text argument is not valid UTF-8")),
            ValueRef::Blob(_) => Err(AdapterError::UnsupportedArgument("blob")),
        }
    }
}
