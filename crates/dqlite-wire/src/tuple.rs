//! Parameter and row tuples.
//!
//! A parameter tuple is a count, one type byte per value, padding to a
//! word, then the values. Schema 0 uses a one-byte count; schema 1 a
//! four-byte count and is needed for more than 255 parameters.
//!
//! A row tuple packs the column types as 4-bit codes, two per byte with the
//! low nibble first, pads to a word, then carries the values.

#![allow(clippy::cast_possible_truncation)]

use crate::time::{format_timestamp, parse_timestamp};
use crate::{WireReader, WireWriter, protocol_error, value_type};
use dqlite_core::error::Result;
use dqlite_core::Value;

/// Largest parameter count that fits schema 0.
pub const MAX_SCHEMA0_PARAMS: usize = u8::MAX as usize;

/// Schema needed to encode `count` parameters.
pub fn params_schema(count: usize) -> u8 {
    if count > MAX_SCHEMA0_PARAMS { 1 } else { 0 }
}

/// Wire type code used to send a parameter.
pub fn param_type(value: &Value) -> u8 {
    match value {
        Value::Null => value_type::NULL,
        Value::Bool(_) => value_type::BOOLEAN,
        Value::Int(_) | Value::BigInt(_) => value_type::INTEGER,
        Value::Double(_) => value_type::FLOAT,
        Value::Text(_) | Value::Json(_) => value_type::TEXT,
        Value::Bytes(_) => value_type::BLOB,
        Value::Timestamp(_) => value_type::ISO8601,
    }
}

/// Append a parameter tuple. Nothing is written for an empty list.
#[allow(clippy::result_large_err)]
pub fn encode_params(w: &mut WireWriter, params: &[Value]) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    if params_schema(params.len()) == 0 {
        w.write_u8(params.len() as u8);
    } else {
        let count = u32::try_from(params.len())
            .map_err(|_| protocol_error(format!("too many parameters: {}", params.len())))?;
        w.write_u32(count);
    }
    for value in params {
        w.write_u8(param_type(value));
    }
    w.pad();

    for value in params {
        encode_value(w, value)?;
    }
    Ok(())
}

/// Read a parameter tuple with the given schema. Used by the test server.
#[allow(clippy::result_large_err)]
pub fn decode_params(r: &mut WireReader<'_>, schema: u8) -> Result<Vec<Value>> {
    if r.is_empty() {
        return Ok(Vec::new());
    }
    let count = if schema == 0 {
        usize::from(r.read_u8().ok_or_else(|| truncated("parameter count"))?)
    } else {
        r.read_u32().ok_or_else(|| truncated("parameter count"))? as usize
    };
    let types = r
        .read_bytes(count)
        .ok_or_else(|| truncated("parameter types"))?
        .to_vec();
    r.align().ok_or_else(|| truncated("parameter header"))?;
    types.into_iter().map(|code| decode_value(r, code)).collect()
}

/// Bytes occupied by a row header for `columns` columns, padding included.
pub fn row_header_len(columns: usize) -> usize {
    let raw = columns.div_ceil(2);
    raw + crate::padding(raw)
}

/// Append one row tuple. Used by the test server.
#[allow(clippy::result_large_err)]
pub fn encode_row(w: &mut WireWriter, values: &[Value]) -> Result<()> {
    let mut header = vec![0u8; row_header_len(values.len())];
    for (i, value) in values.iter().enumerate() {
        let code = param_type(value);
        if i % 2 == 0 {
            header[i / 2] |= code;
        } else {
            header[i / 2] |= code << 4;
        }
    }
    for byte in header {
        w.write_u8(byte);
    }
    for value in values {
        encode_value(w, value)?;
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn encode_value(w: &mut WireWriter, value: &Value) -> Result<()> {
    match value {
        Value::Null => w.write_u64(0),
        Value::Bool(b) => w.write_u64(u64::from(*b)),
        Value::Int(v) => w.write_i64(i64::from(*v)),
        Value::BigInt(v) => w.write_i64(*v),
        Value::Double(v) => w.write_f64(*v),
        Value::Text(s) => {
            if s.as_bytes().contains(&0) {
                return Err(protocol_error("text value contains a NUL byte"));
            }
            w.write_text(s);
        }
        Value::Json(v) => w.write_text(&v.to_string()),
        Value::Bytes(b) => w.write_blob(b),
        Value::Timestamp(micros) => w.write_text(&format_timestamp(*micros)),
    }
    Ok(())
}

/// Read one row tuple of `columns` values.
#[allow(clippy::result_large_err)]
pub fn decode_row(r: &mut WireReader<'_>, columns: usize) -> Result<Vec<Value>> {
    let header = r
        .read_bytes(row_header_len(columns))
        .ok_or_else(|| truncated("row header"))?;
    let mut values = Vec::with_capacity(columns);
    for i in 0..columns {
        let byte = header[i / 2];
        let code = if i % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        values.push(decode_value(r, code)?);
    }
    Ok(values)
}

/// Read one value of the given wire type.
#[allow(clippy::result_large_err)]
pub fn decode_value(r: &mut WireReader<'_>, code: u8) -> Result<Value> {
    let value = match code {
        value_type::INTEGER => Value::BigInt(r.read_i64().ok_or_else(|| truncated("integer"))?),
        value_type::FLOAT => Value::Double(r.read_f64().ok_or_else(|| truncated("float"))?),
        value_type::TEXT => Value::Text(read_string(r)?),
        value_type::BLOB => Value::Bytes(r.read_blob().ok_or_else(|| truncated("blob"))?.to_vec()),
        value_type::NULL => {
            r.read_u64().ok_or_else(|| truncated("null"))?;
            Value::Null
        }
        value_type::UNIXTIME => {
            let secs = r.read_i64().ok_or_else(|| truncated("unixtime"))?;
            Value::Timestamp(secs.saturating_mul(1_000_000))
        }
        value_type::ISO8601 => {
            let text = read_string(r)?;
            if text.is_empty() {
                Value::Null
            } else {
                match parse_timestamp(&text) {
                    Some(micros) => Value::Timestamp(micros),
                    None => Value::Text(text),
                }
            }
        }
        value_type::BOOLEAN => Value::Bool(r.read_u64().ok_or_else(|| truncated("boolean"))? != 0),
        other => return Err(protocol_error(format!("unknown value type code {}", other))),
    };
    Ok(value)
}

#[allow(clippy::result_large_err)]
pub(crate) fn read_string(r: &mut WireReader<'_>) -> Result<String> {
    match r.read_text() {
        Some(Ok(s)) => Ok(s.to_string()),
        Some(Err(e)) => Err(protocol_error(format!("invalid UTF-8 in text field: {}", e))),
        None => Err(truncated("text")),
    }
}

pub(crate) fn truncated(what: &str) -> dqlite_core::Error {
    protocol_error(format!("message truncated while reading {}", what))
}
