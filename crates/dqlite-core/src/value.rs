//! Dynamic SQL values.
//!
//! dqlite stores SQLite values, so the set is smaller than a general
//! SQL type system: integers, doubles, text, blobs and NULL, plus the
//! boolean and timestamp hints the wire protocol carries.

use serde::{Deserialize, Serialize};

/// A value bound as a parameter or decoded from a row.
///
/// `Int` and `BigInt` both travel as dqlite INTEGER; the split only
/// records what the caller handed in. `Json` is sent as TEXT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Microseconds since the Unix epoch, UTC.
    Timestamp(i64),
    Json(serde_json::Value),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL spelling of the variant, used in type errors and cursor
    /// descriptions.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Json(_) => "JSON",
        }
    }

    /// Integers count as booleans; SQLite has no separate storage class.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => self.integer().map(|n| n != 0),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Timestamp(micros) => Some(*micros),
            _ => self.integer(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => self.integer().map(|n| n as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::Text(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// Text is readable as its UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    fn integer(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(i64::from(*n)),
            Value::BigInt(n) => Some(*n),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $body:expr;)*) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )*
    };
}

value_from! {
    bool => |v| Value::Bool(v);
    i32 => |v| Value::Int(v);
    i64 => |v| Value::BigInt(v);
    u32 => |v| Value::BigInt(i64::from(v));
    f64 => |v| Value::Double(v);
    String => |v| Value::Text(v);
    &str => |v| Value::Text(v.to_owned());
    Vec<u8> => |v| Value::Bytes(v);
    &[u8] => |v| Value::Bytes(v.to_vec());
    serde_json::Value => |v| Value::Json(v);
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_family() {
        assert_eq!(Value::Int(7).as_i64(), Some(7));
        assert_eq!(Value::BigInt(-2).as_f64(), Some(-2.0));
        assert_eq!(Value::Bool(true).as_i64(), Some(1));
        assert_eq!(Value::BigInt(0).as_bool(), Some(false));
        assert_eq!(Value::Int(5).as_bool(), Some(true));
        assert_eq!(Value::Timestamp(1_500_000).as_i64(), Some(1_500_000));
        assert_eq!(Value::Timestamp(1).as_f64(), None);
    }

    #[test]
    fn test_text_is_not_numeric() {
        assert_eq!(Value::Text("3".into()).as_i64(), None);
        assert_eq!(Value::Text("3".into()).as_bool(), None);
        assert_eq!(Value::Text("ab".into()).as_bytes(), Some(&b"ab"[..]));
        assert_eq!(Value::Bytes(vec![1]).as_str(), None);
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(9u32), Value::BigInt(9));
        assert_eq!(Value::from(&b"\x00\x01"[..]), Value::Bytes(vec![0, 1]));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
        assert_eq!(
            Value::from(serde_json::json!([1])).type_name(),
            "JSON"
        );
    }

    #[test]
    fn test_serde_roundtrip_keeps_variant() {
        let encoded = serde_json::to_string(&Value::Timestamp(42)).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Value::Timestamp(42));
        assert!(Value::Null.is_null());
    }
}
