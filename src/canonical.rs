// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Canonical JSON, the signing domain for all Uptane metadata.
//!
//! Object keys are sorted, whitespace is dropped, integers are rendered
//! without a decimal point and strings use the standard JSON escapes for
//! control characters, quote and backslash. Every signature in the system is
//! computed over exactly this encoding; any deviation invalidates it.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;

/// Serialize `value` into its canonical byte representation.
///
/// Floating point numbers have no canonical form and are rejected with
/// [`Error::MalformedMetadata`].
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_value(value, &mut buf)?;
    Ok(buf)
}

fn write_value(value: &Value, buf: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => buf.extend(b"null"),
        Value::Bool(true) => buf.extend(b"true"),
        Value::Bool(false) => buf.extend(b"false"),
        Value::Number(n) => {
            if let Some(n) = n.as_u64() {
                itoa::write(&mut *buf, n).map_err(|e| Error::MalformedMetadata(e.to_string()))?;
            } else if let Some(n) = n.as_i64() {
                itoa::write(&mut *buf, n).map_err(|e| Error::MalformedMetadata(e.to_string()))?;
            } else {
                return Err(Error::MalformedMetadata(format!(
                    "non-integer number {} has no canonical form",
                    n
                )));
            }
        }
        Value::String(s) => write_string(s, buf)?,
        Value::Array(items) => {
            buf.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i != 0 {
                    buf.push(b',');
                }
                write_value(item, buf)?;
            }
            buf.push(b']');
        }
        Value::Object(fields) => {
            // BTreeMap gives the sorted key order the signing domain requires.
            let sorted: BTreeMap<&String, &Value> = fields.iter().collect();
            buf.push(b'{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i != 0 {
                    buf.push(b',');
                }
                write_string(key, buf)?;
                buf.push(b':');
                write_value(item, buf)?;
            }
            buf.push(b'}');
        }
    }
    Ok(())
}

// serde_json already implements the exact escaping rules the canonical form
// requires, so strings are routed through it.
fn write_string(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    let quoted =
        serde_json::to_string(s).map_err(|e| Error::MalformedMetadata(e.to_string()))?;
    buf.write_all(quoted.as_bytes())
        .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let out = canonicalize(&json!({"foo": "bar", "baz": "quux"})).unwrap();
        assert_eq!(out, br#"{"baz":"quux","foo":"bar"}"#.to_vec());
    }

    #[test]
    fn sorts_nested_objects() {
        let out = canonicalize(&json!({"b": {"z": 1, "a": 2}, "a": []})).unwrap();
        assert_eq!(out, br#"{"a":[],"b":{"a":2,"z":1}}"#.to_vec());
    }

    #[test]
    fn integers_without_decimal_point() {
        let out = canonicalize(&json!({"version": 3, "length": 12345678901u64, "delta": -2}))
            .unwrap();
        assert_eq!(out, br#"{"delta":-2,"length":12345678901,"version":3}"#.to_vec());
    }

    #[test]
    fn rejects_floats() {
        assert!(canonicalize(&json!({"pi": 3.14})).is_err());
    }

    #[test]
    fn escapes_control_characters() {
        let out = canonicalize(&json!(["haha", "new\nline", "quote\""])).unwrap();
        assert_eq!(out, b"[\"haha\",\"new\\nline\",\"quote\\\"\"]".to_vec());
    }

    #[test]
    fn array_order_is_preserved() {
        let out = canonicalize(&json!(["wat", "lol", "no"])).unwrap();
        assert_eq!(out, br#"["wat","lol","no"]"#.to_vec());
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let doc = json!({
            "signed": {
                "_type": "Targets",
                "expires": "2026-01-01T00:00:00Z",
                "version": 2,
                "targets": {"fw.bin": {"length": 4, "hashes": {"sha256": "00"}}},
            },
        });
        let once = canonicalize(&doc).unwrap();
        let reparsed: Value = serde_json::from_slice(&once).unwrap();
        assert_eq!(once, canonicalize(&reparsed).unwrap());
    }
}
