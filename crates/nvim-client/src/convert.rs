//! Typed views of call results.

use crate::error::{ClientError, Result};
use crate::handle::Handle;
use rmpv::Value;

pub(crate) fn as_i64(method: &str, value: Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| ClientError::unexpected(method, format!("expected an integer, got {}", value)))
}

pub(crate) fn as_bool(method: &str, value: Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| ClientError::unexpected(method, format!("expected a boolean, got {}", value)))
}

pub(crate) fn as_string(method: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| ClientError::unexpected(method, "string is not valid UTF-8")),
        // Older editors send text as raw bytes
        Value::Binary(bytes) => String::from_utf8(bytes)
            .map_err(|_| ClientError::unexpected(method, "string is not valid UTF-8")),
        other => Err(ClientError::unexpected(
            method,
            format!("expected a string, got {}", other),
        )),
    }
}

pub(crate) fn as_strings(method: &str, value: Value) -> Result<Vec<String>> {
    as_array(method, value)?
        .into_iter()
        .map(|item| as_string(method, item))
        .collect()
}

/// A `[row, col]` style pair.
pub(crate) fn as_pair(method: &str, value: Value) -> Result<(i64, i64)> {
    let items = as_array(method, value)?;
    match items.as_slice() {
        [first, second] => match (first.as_i64(), second.as_i64()) {
            (Some(first), Some(second)) => Ok((first, second)),
            _ => Err(ClientError::unexpected(method, "pair items are not integers")),
        },
        _ => Err(ClientError::unexpected(
            method,
            format!("expected a pair, got {} items", items.len()),
        )),
    }
}

pub(crate) fn as_handle(method: &str, value: Value) -> Result<Handle> {
    Handle::from_value(&value)
        .ok_or_else(|| ClientError::unexpected(method, format!("expected a handle, got {}", value)))
}

pub(crate) fn as_handles(method: &str, value: Value) -> Result<Vec<Handle>> {
    as_array(method, value)?
        .into_iter()
        .map(|item| as_handle(method, item))
        .collect()
}

pub(crate) fn lines_value(lines: Vec<String>) -> Value {
    Value::Array(lines.into_iter().map(Value::from).collect())
}

fn as_array(method: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(ClientError::unexpected(
            method,
            format!("expected an array, got {}", other),
        )),
    }
}
