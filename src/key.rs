//! Routing keys.
//!
//! A key joins `name=value` for each split field, in split order, with `,`:
//! `latgrid=50,longrid=-10`. Timestamps are rendered with the run's time
//! resolution so that, for example, all messages of one day share a key.

use thiserror::Error;

use crate::record::{Record, Value, format_time, format_timestamp};

/// A split field is absent (or null) in a record.
///
/// This is the one per-record error the driver recovers from: the record is
/// dropped from routing and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record has no value for split field '{field}'")]
pub struct MissingFieldError {
    pub field: String,
}

/// How field values are written into a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Values as-is. A value containing `,` or `=` makes the key ambiguous.
    #[default]
    Raw,
    /// Percent-encode `%`, `,`, `=` and `/` in values.
    Escaped,
}

/// Build the routing key for `record`.
///
/// An empty `split_fields` yields the empty key, so every record goes to the
/// same destination.
pub fn extract_key(
    record: &Record,
    split_fields: &[String],
    time_format: &str,
    encoding: KeyEncoding,
) -> Result<String, MissingFieldError> {
    let mut parts = Vec::with_capacity(split_fields.len());
    for field in split_fields {
        let value = match record.get(field) {
            Some(v) if !v.is_null() => v,
            _ => {
                return Err(MissingFieldError {
                    field: field.clone(),
                });
            }
        };
        let text = key_value(value, time_format);
        let text = match encoding {
            KeyEncoding::Raw => text,
            KeyEncoding::Escaped => escape(&text),
        };
        parts.push(format!("{}={}", field, text));
    }
    Ok(parts.join(","))
}

fn key_value(value: &Value, time_format: &str) -> String {
    match value {
        // The pattern is validated with the run configuration; fall back to
        // RFC 3339 rather than fail a record on it.
        Value::Timestamp(ts) => format_time(ts, time_format).unwrap_or_else(|| format_timestamp(ts)),
        other => other.to_string(),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            ',' => out.push_str("%2C"),
            '=' => out.push_str("%3D"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}
