//! Rows decoded from dqlite `Rows` responses.

use std::sync::Arc;

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;

/// Column names of one result set.
///
/// A `Rows` response names its columns once in the first batch; every row
/// decoded from it holds the same `Arc`. Result sets are narrow, so lookup by
/// name is a scan. Duplicate names resolve to the leftmost column, as SQLite
/// does for `SELECT a.id, b.id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    /// A row with its own column list; tests and one-off rows use this,
    /// decoders use [`with_columns`](Self::with_columns).
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_columns(Arc::new(ColumnInfo::new(column_names)), values)
    }

    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.get(self.columns.index_of(name)?)
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Convert the value at `index`.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        match self.get(index) {
            Some(value) => T::from_value(value),
            None => Err(type_error::<T>(format!(
                "no column {} in a row of {}",
                index,
                self.len()
            ))),
        }
    }

    /// Convert the value of column `name`; errors name the column.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let result = match self.get_by_name(name) {
            Some(value) => T::from_value(value),
            None => Err(type_error::<T>("missing column".to_string())),
        };
        result.map_err(|err| match err {
            Error::Type(detail) => Error::Type(TypeError {
                column: Some(name.to_string()),
                ..detail
            }),
            other => other,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

fn type_error<T>(actual: String) -> Error {
    Error::Type(TypeError {
        expected: std::any::type_name::<T>(),
        actual,
        column: None,
        rust_type: None,
    })
}

fn mismatch<T>(value: &Value) -> Error {
    type_error::<T>(value.type_name().to_string())
}

/// Conversion out of a dqlite [`Value`].
pub trait FromValue: Sized {
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| type_error::<Self>(format!("{} does not fit", wide)))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        u64::try_from(wide).map_err(|_| type_error::<Self>(format!("{} is negative", wide)))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(text) => Ok(text.clone()),
            Value::Json(json) => Ok(json.to_string()),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value.as_bytes() {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(mismatch::<Self>(value)),
        }
    }
}

/// JSON columns arrive as TEXT.
impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(json) => Ok(json.clone()),
            Value::Text(text) => serde_json::from_str(text)
                .map_err(|e| type_error::<Self>(format!("invalid JSON text: {}", e))),
            other => Err(mismatch::<Self>(other)),
        }
    }
}
