/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conversions between driver values and the JSON values carried by change
//! items, plus the per-column coercion driven by a table's record schema.
//! A value that doesn't fit its declared kind falls through unchanged -
//! coercion shapes values, it never drops them.

use crate::config::ColumnKind;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{json, Value as JsonValue};

/// Read one column off a driver row into the interchange representation,
/// applying the declared kind when the table carries a record schema.
pub(crate) fn sql_to_json(value: ValueRef<'_>, kind: Option<ColumnKind>) -> JsonValue {
    let native = match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::Array(b.iter().map(|byte| json!(byte)).collect()),
    };
    match kind {
        Some(kind) => coerce(native, kind),
        None => native,
    }
}

pub(crate) fn coerce(value: JsonValue, kind: ColumnKind) -> JsonValue {
    if value.is_null() {
        return value;
    }
    match kind {
        ColumnKind::Text => coerce_text(value),
        ColumnKind::Char => coerce_char(value),
        ColumnKind::Integer => coerce_integer(value),
        ColumnKind::Byte => match coerce_integer(value) {
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => json!(i as u8),
                None => JsonValue::Number(n),
            },
            other => other,
        },
        ColumnKind::Boolean => coerce_boolean(value),
        ColumnKind::Float => match as_f64(&value) {
            // Squeeze through single precision.
            Some(f) => json!(f as f32 as f64),
            None => value,
        },
        ColumnKind::Double => match as_f64(&value) {
            Some(f) => json!(f),
            None => value,
        },
        ColumnKind::Decimal => coerce_decimal(value),
        ColumnKind::DateTime => coerce_datetime(value),
    }
}

fn coerce_text(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(_) => value,
        JsonValue::Number(n) => JsonValue::String(n.to_string()),
        JsonValue::Bool(b) => JsonValue::String(b.to_string()),
        other => other,
    }
}

fn coerce_char(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => match s.chars().next() {
            Some(c) => JsonValue::String(c.to_string()),
            None => JsonValue::String(s),
        },
        JsonValue::Number(n) => match n.as_u64().and_then(|u| char::from_u32(u as u32)) {
            Some(c) => JsonValue::String(c.to_string()),
            None => JsonValue::Number(n),
        },
        other => other,
    }
}

fn coerce_integer(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(ref n) => match n.as_i64() {
            Some(_) => value,
            None => match n.as_f64() {
                Some(f) => json!(f as i64),
                None => value,
            },
        },
        JsonValue::Bool(b) => json!(b as i64),
        JsonValue::String(ref s) => match s.trim().parse::<i64>() {
            Ok(i) => json!(i),
            Err(_) => value,
        },
        other => other,
    }
}

fn coerce_boolean(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Bool(_) => value,
        JsonValue::Number(ref n) => match n.as_f64() {
            Some(f) => json!(f != 0.0),
            None => value,
        },
        JsonValue::String(ref s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => json!(true),
            "false" | "0" => json!(false),
            _ => value,
        },
        other => other,
    }
}

fn coerce_decimal(value: JsonValue) -> JsonValue {
    // Decimals cross the boundary as text so no precision is silently lost
    // to binary floating point on the far side.
    match value {
        JsonValue::String(_) => value,
        JsonValue::Number(n) => JsonValue::String(n.to_string()),
        other => other,
    }
}

fn coerce_datetime(value: JsonValue) -> JsonValue {
    match value {
        // Strings pass through verbatim; SQLite has no datetime type and
        // whatever format the application writes is what its peers expect.
        JsonValue::String(_) => value,
        JsonValue::Number(ref n) => {
            let rendered = if let Some(secs) = n.as_i64() {
                chrono::DateTime::from_timestamp(secs, 0)
            } else {
                n.as_f64().and_then(|f| {
                    let secs = f.trunc() as i64;
                    let nanos = (f.fract().abs() * 1e9) as u32;
                    chrono::DateTime::from_timestamp(secs, nanos)
                })
            };
            match rendered {
                Some(dt) => JsonValue::String(dt.to_rfc3339()),
                None => value,
            }
        }
        other => other,
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Bind-side conversion: change-item values back to driver values.
pub(crate) fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                // u64 beyond i64::MAX, or a float.
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        JsonValue::Array(items) => match byte_array(items) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        // Structured values are stored as their JSON text.
        JsonValue::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn byte_array(items: &[JsonValue]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|item| match item {
            JsonValue::Number(n) => n.as_u64().filter(|u| *u <= u8::MAX as u64).map(|u| u as u8),
            _ => None,
        })
        .collect()
}
