//! Reversible encoding of document keys.
//!
//! Stored documents are addressed with dot-delimited paths, so a raw key may
//! not contain the separator, may not start with the operator sigil and may
//! not contain the characters used by array element selectors. Each reserved
//! character is replaced by a `%XX` sequence; `%` itself is escaped first so
//! that a key which already contains a substitute sequence still round-trips.
//! The empty key is written as `%00`, a sequence no other key escapes to.

use crate::error::CoreError;
use crate::value::{Map, Value};

const SUBSTITUTES: [(char, &str); 5] = [
    ('%', "%25"),
    ('.', "%2E"),
    ('[', "%5B"),
    (']', "%5D"),
    ('=', "%3D"),
];

const SIGIL: char = '$';
const SIGIL_SUBSTITUTE: &str = "%24";
const EMPTY_SUBSTITUTE: &str = "%00";

pub fn escape_key(key: &str) -> Result<String, CoreError> {
    validate_key(key)?;
    Ok(encode(key))
}

/// Checks that a raw key can be escaped.
pub fn validate_key(key: &str) -> Result<(), CoreError> {
    if key.contains('\0') {
        return Err(CoreError::invalid_key(key, "contains NUL"));
    }
    Ok(())
}

/// Escapes a key already known to be valid.
pub(crate) fn encode(key: &str) -> String {
    if key.is_empty() {
        return EMPTY_SUBSTITUTE.to_string();
    }
    let mut out = String::with_capacity(key.len());
    for (i, c) in key.chars().enumerate() {
        if i == 0 && c == SIGIL {
            out.push_str(SIGIL_SUBSTITUTE);
            continue;
        }
        match SUBSTITUTES.iter().find(|(raw, _)| *raw == c) {
            Some((_, substitute)) => out.push_str(substitute),
            None => out.push(c),
        }
    }
    out
}

pub fn unescape_key(escaped: &str) -> Result<String, CoreError> {
    if escaped.is_empty() {
        return Err(CoreError::invalid_key(escaped, "empty escaped key"));
    }
    if escaped == EMPTY_SUBSTITUTE {
        return Ok(String::new());
    }

    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos..pos + 3)
            .ok_or_else(|| CoreError::invalid_key(escaped, "truncated escape sequence"))?;

        let at_start = out.is_empty() && pos == 0;
        let raw = if code == SIGIL_SUBSTITUTE && at_start {
            SIGIL
        } else {
            SUBSTITUTES
                .iter()
                .find(|(_, substitute)| *substitute == code)
                .map(|(raw, _)| *raw)
                .ok_or_else(|| {
                    CoreError::invalid_key(escaped, format!("unknown escape sequence {code}"))
                })?
        };
        out.push(raw);
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Escapes every object key of a document, including objects nested in arrays.
pub fn escape_document(value: &Value) -> Result<Value, CoreError> {
    transform_keys(value, &escape_key)
}

pub fn unescape_document(value: &Value) -> Result<Value, CoreError> {
    transform_keys(value, &unescape_key)
}

fn transform_keys(
    value: &Value,
    f: &dyn Fn(&str) -> Result<String, CoreError>,
) -> Result<Value, CoreError> {
    Ok(match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map.iter() {
                out.insert(f(key)?, transform_keys(child, f)?);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| transform_keys(item, f))
                .collect::<Result<_, _>>()?,
        ),
        scalar => scalar.clone(),
    })
}
