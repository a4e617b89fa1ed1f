//! Placeholder translation to qmark style.
//!
//! dqlite binds parameters by position only. Statements written with
//! numbered (`$1`, `?2`) or named (`:name`) placeholders are rewritten to
//! plain `?` and the values reordered to match. String literals, quoted
//! identifiers and comments are copied through untouched.

use std::iter::Peekable;
use std::str::CharIndices;

use dqlite_core::error::{QueryError, QueryErrorKind};
use dqlite_core::{Error, Result, Value};
use serde::Serialize;

/// DB-API parameter styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamStyle {
    /// `WHERE id = ?`
    Qmark,
    /// `WHERE id = :1`
    Numeric,
    /// `WHERE id = :id`
    Named,
    /// `WHERE id = %s`
    Format,
    /// `WHERE id = %(id)s`
    Pyformat,
}

impl ParamStyle {
    pub const fn as_str(self) -> &'static str {
        match self {
            ParamStyle::Qmark => "qmark",
            ParamStyle::Numeric => "numeric",
            ParamStyle::Named => "named",
            ParamStyle::Format => "format",
            ParamStyle::Pyformat => "pyformat",
        }
    }
}

impl std::fmt::Display for ParamStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder<'a> {
    /// Bare `?`
    Next,
    /// `$N` or `?N`, one-based
    Index(usize),
    /// `:name`
    Name(&'a str),
}

fn bind_error(sql: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        code: None,
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

/// Rewrite numbered placeholders to `?`.
///
/// A bare `?` takes the value after the highest number used so far, the
/// way SQLite numbers them.
#[allow(clippy::result_large_err)]
pub fn to_qmark(sql: &str, params: &[Value]) -> Result<(String, Vec<Value>)> {
    let mut highest = 0usize;
    rewrite(sql, |placeholder| {
        let index = match placeholder {
            Placeholder::Next => highest + 1,
            Placeholder::Index(n) => n,
            Placeholder::Name(name) => {
                return Err(bind_error(
                    sql,
                    format!("named parameter :{} needs named values", name),
                ));
            }
        };
        highest = highest.max(index);
        params
            .get(index.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| {
                bind_error(
                    sql,
                    format!(
                        "parameter {} out of range, {} value(s) given",
                        index,
                        params.len()
                    ),
                )
            })
    })
}

/// Rewrite `:name` placeholders to `?`; a name may appear more than once.
#[allow(clippy::result_large_err)]
pub fn to_qmark_named(sql: &str, params: &[(&str, Value)]) -> Result<(String, Vec<Value>)> {
    rewrite(sql, |placeholder| match placeholder {
        Placeholder::Name(name) => params
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| bind_error(sql, format!("no value for parameter :{}", name))),
        Placeholder::Next | Placeholder::Index(_) => Err(bind_error(
            sql,
            "positional parameter mixed with named values".to_string(),
        )),
    })
}

#[allow(clippy::result_large_err)]
fn rewrite<'a>(
    sql: &'a str,
    mut resolve: impl FnMut(Placeholder<'a>) -> Result<Value>,
) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((start, ch)) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&mut chars, ch, sql.len());
                out.push_str(&sql[start..end]);
            }
            '[' => {
                let end = skip_quoted(&mut chars, ']', sql.len());
                out.push_str(&sql[start..end]);
            }
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                let end = skip_until(&mut chars, "\n", sql, start + 2);
                out.push_str(&sql[start..end]);
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let end = skip_until(&mut chars, "*/", sql, start + 2);
                out.push_str(&sql[start..end]);
            }
            '?' => {
                let digits = take_while(&mut chars, sql, start + 1, |c| c.is_ascii_digit());
                let placeholder = if digits.is_empty() {
                    Placeholder::Next
                } else {
                    Placeholder::Index(parse_index(sql, digits)?)
                };
                values.push(resolve(placeholder)?);
                out.push('?');
            }
            '$' if matches!(chars.peek(), Some((_, c)) if c.is_ascii_digit()) => {
                let digits = take_while(&mut chars, sql, start + 1, |c| c.is_ascii_digit());
                values.push(resolve(Placeholder::Index(parse_index(sql, digits)?))?);
                out.push('?');
            }
            ':' if matches!(chars.peek(), Some((_, ':'))) => {
                chars.next();
                out.push_str("::");
            }
            ':' if matches!(chars.peek(), Some((_, c)) if c.is_ascii_alphabetic() || *c == '_') => {
                let name = take_while(&mut chars, sql, start + 1, |c| {
                    c.is_ascii_alphanumeric() || c == '_'
                });
                values.push(resolve(Placeholder::Name(name))?);
                out.push('?');
            }
            _ => out.push(ch),
        }
    }

    Ok((out, values))
}

#[allow(clippy::result_large_err)]
fn parse_index(sql: &str, digits: &str) -> Result<usize> {
    match digits.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(bind_error(sql, format!("invalid parameter number {}", digits))),
    }
}

/// Consume the rest of a quoted run; returns the byte offset after the
/// closing quote. Doubled quotes are escapes.
pub(crate) fn skip_quoted(chars: &mut Peekable<CharIndices<'_>>, close: char, len: usize) -> usize {
    while let Some((i, c)) = chars.next() {
        if c == close {
            if close != ']' && matches!(chars.peek(), Some((_, next)) if *next == close) {
                chars.next();
                continue;
            }
            return i + c.len_utf8();
        }
    }
    len
}

/// Consume through `terminator`; returns the byte offset after it.
pub(crate) fn skip_until(
    chars: &mut Peekable<CharIndices<'_>>,
    terminator: &str,
    sql: &str,
    from: usize,
) -> usize {
    match sql[from..].find(terminator) {
        Some(offset) => {
            let end = from + offset + terminator.len();
            while matches!(chars.peek(), Some((i, _)) if *i < end) {
                chars.next();
            }
            end
        }
        None => {
            for _ in chars.by_ref() {}
            sql.len()
        }
    }
}

pub(crate) fn take_while<'a>(
    chars: &mut Peekable<CharIndices<'_>>,
    sql: &'a str,
    from: usize,
    keep: impl Fn(char) -> bool,
) -> &'a str {
    let mut end = from;
    while let Some(&(i, c)) = chars.peek() {
        if !keep(c) {
            break;
        }
        chars.next();
        end = i + c.len_utf8();
    }
    &sql[from..end]
}
