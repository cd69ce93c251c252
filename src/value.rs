//! The closed universe of values the engine can carry.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};
use indexmap::IndexMap;
use ordered_float::NotNan;
use uuid::Uuid;

use crate::error::{WireError, WireResult};

/// A dynamically-typed wire value.
///
/// This is the catch-all representation used by polymorphic reads and
/// writes; statically-typed paths go through the scalar methods of the
/// writer and reader contracts instead. Maps preserve insertion order
/// because field order is the encoding order.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The null sentinel.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer, any width up to 64 bits.
    I64(i64),
    /// Unsigned integer that does not fit `i64`.
    U64(u64),
    /// A float that is not NaN.
    F64(NotNan<f64>),
    /// UTF-8 text.
    Text(String),
    /// Opaque byte sequence.
    Bytes(Bytes),
    /// Wall-clock time without a date.
    Time(NaiveTime),
    /// Calendar date without a time.
    Date(NaiveDate),
    /// Date and time without a zone.
    DateTime(NaiveDateTime),
    /// Date and time with a fixed UTC offset.
    ZonedDateTime(DateTime<FixedOffset>),
    /// UUID.
    Uuid(Uuid),
    /// A reference to a type by name.
    TypeLiteral(String),
    /// Ordered sequence.
    Sequence(Vec<Value>),
    /// Named-field composite; insertion order is preserved.
    Map(IndexMap<String, Value>),
    /// A value carrying an explicit type tag.
    Typed(String, Box<Value>),
}

impl Value {
    /// Returns a short name for the kind of data represented.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I64(_) => "int",
            Value::U64(_) => "uint",
            Value::F64(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Time(_) => "time",
            Value::Date(_) => "date",
            Value::DateTime(_) => "date-time",
            Value::ZonedDateTime(_) => "zoned-date-time",
            Value::Uuid(_) => "uuid",
            Value::TypeLiteral(_) => "type",
            Value::Sequence(_) => "sequence",
            Value::Map(_) => "map",
            Value::Typed(..) => "typed",
        }
    }

    /// Builds a float value; NaN maps to null because the universe only
    /// admits ordered floats.
    pub fn from_f64(v: f64) -> Value {
        NotNan::new(v).map(Value::F64).unwrap_or(Value::Null)
    }

    /// True for the null sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The stored integer widened to `i128`, if this is an integer.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::I64(v) => Some(i128::from(*v)),
            Value::U64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// Strips any type tag, yielding the underlying value.
    pub fn untagged(&self) -> &Value {
        match self {
            Value::Typed(_, inner) => inner.untagged(),
            other => other,
        }
    }
}

/// Narrowing integer conversion used by typed pulls; fails with
/// `range-violation` when the stored value does not fit.
pub(crate) fn narrow<T>(value: i128, target: &'static str, offset: u64) -> WireResult<T>
where
    T: TryFrom<i128>,
{
    T::try_from(value).map_err(|_| WireError::RangeViolation {
        target,
        value,
        offset,
        excerpt: String::new(),
    })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Time(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::DateTime(v) => write!(f, "{v}"),
            Value::ZonedDateTime(v) => {
                write!(f, "{}", v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Uuid(v) => write!(f, "{v}"),
            Value::TypeLiteral(v) => write!(f, "!type {v}"),
            Value::Sequence(items) => {
                let joined = items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[ {joined} ]")
            }
            Value::Map(map) => {
                let joined = map
                    .iter()
                    .map(|(key, value)| format!("{key}: {value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{{ {joined} }}")
            }
            Value::Typed(tag, inner) => write!(f, "!{tag} {inner}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(signed) => Value::I64(signed),
            Err(_) => Value::U64(v),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Sequence(v)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(v: IndexMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_becomes_null() {
        assert_eq!(Value::from_f64(f64::NAN), Value::Null);
        assert_eq!(Value::from_f64(1.5), Value::F64(NotNan::new(1.5).expect("not nan")));
    }

    #[test]
    fn unsigned_values_fold_into_signed_when_they_fit() {
        assert_eq!(Value::from(7u64), Value::I64(7));
        assert_eq!(Value::from(u64::MAX), Value::U64(u64::MAX));
    }

    #[test]
    fn narrow_rejects_out_of_range() {
        assert_eq!(narrow::<i16>(12345, "i16", 0).expect("fits"), 12345i16);
        let err = narrow::<i16>(1 << 20, "i16", 9).expect_err("too wide");
        assert!(matches!(err, WireError::RangeViolation { offset: 9, .. }));
    }

    #[test]
    fn untagged_sees_through_nested_tags() {
        let v = Value::Typed(
            "Outer".into(),
            Box::new(Value::Typed("Inner".into(), Box::new(Value::I64(3)))),
        );
        assert_eq!(v.untagged(), &Value::I64(3));
    }
}
