//! Order-preserving index key encoding.
//!
//! Encodes a sequence of values into a byte string whose bytewise order
//! matches the canonical value order. Each field is a type-class tag
//! followed by a body:
//!
//! - numbers normalize to sign-flipped big-endian IEEE doubles so
//!   Int32/Int64/Double interleave correctly,
//! - variable-length bodies (strings, binary, nested documents) escape
//!   0x00 as 0x01 0x01 and 0x01 as 0x01 0x02 and end with a 0x00
//!   terminator, so an encoded prefix is an exact byte string and the
//!   0x00 entry-key separator that follows a full key is unambiguous,
//! - descending fields are bitwise-complemented whole.

use crate::core::bson::{encode_document, Value};
use crate::core::common::DbError;

const TAG_NULL: u8 = 0x05;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x3C;
const TAG_DOCUMENT: u8 = 0x46;
const TAG_ARRAY: u8 = 0x50;
const TAG_BINARY: u8 = 0x5A;
const TAG_OBJECT_ID: u8 = 0x64;
const TAG_BOOL: u8 = 0x6E;
const TAG_DATETIME: u8 = 0x78;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

/// Encodes `values` into an order-preserving byte string. `ascending`
/// must be the same length; `false` inverts that field's ordering.
///
/// # Errors
/// Returns `Internal` when the slices disagree in length and codec
/// errors for unencodable nested documents.
pub fn from_values(values: &[Value], ascending: &[bool]) -> Result<Vec<u8>, DbError> {
    if values.len() != ascending.len() {
        return Err(DbError::Internal(format!(
            "key spec mismatch: {} values but {} directions",
            values.len(),
            ascending.len()
        )));
    }
    let mut out = Vec::new();
    for (value, asc) in values.iter().zip(ascending.iter()) {
        let mut field = Vec::new();
        encode_field(&mut field, value)?;
        if !asc {
            for byte in &mut field {
                *byte = !*byte;
            }
        }
        out.extend_from_slice(&field);
    }
    Ok(out)
}

/// Shorthand for the single-field ascending encoding used for `_id`
/// data-tree keys.
///
/// # Errors
/// See [`from_values`].
pub fn from_single(value: &Value) -> Result<Vec<u8>, DbError> {
    from_values(std::slice::from_ref(value), &[true])
}

fn encode_field(out: &mut Vec<u8>, value: &Value) -> Result<(), DbError> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Int32(v) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&sortable_f64(f64::from(*v)));
        }
        Value::Int64(v) => {
            out.push(TAG_NUMBER);
            #[allow(clippy::cast_precision_loss)]
            out.extend_from_slice(&sortable_f64(*v as f64));
        }
        Value::Double(v) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&sortable_f64(*v));
        }
        Value::String(v) => {
            out.push(TAG_STRING);
            push_escaped(out, v.as_bytes());
            out.push(TERMINATOR);
        }
        Value::Binary(v) => {
            out.push(TAG_BINARY);
            push_escaped(out, v);
            out.push(TERMINATOR);
        }
        Value::ObjectId(v) => {
            out.push(TAG_OBJECT_ID);
            out.extend_from_slice(v.bytes());
        }
        Value::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        Value::DateTime(v) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&sortable_i64(v.timestamp_millis()));
        }
        Value::Document(doc) => {
            out.push(TAG_DOCUMENT);
            push_escaped(out, &encode_document(doc)?);
            out.push(TERMINATOR);
        }
        Value::Array(items) => {
            // Arrays order bytewise over their element encodings.
            out.push(TAG_ARRAY);
            let mut inner = Vec::new();
            for item in items {
                encode_field(&mut inner, item)?;
            }
            push_escaped(out, &inner);
            out.push(TERMINATOR);
        }
    }
    Ok(())
}

// 0x00 -> 0x01 0x01 and 0x01 -> 0x01 0x02 keeps the escaped stream free
// of literal zero bytes while preserving bytewise order.
fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        match byte {
            0x00 => out.extend_from_slice(&[ESCAPE, 0x01]),
            0x01 => out.extend_from_slice(&[ESCAPE, 0x02]),
            other => out.push(other),
        }
    }
}

// Flip the sign bit of positives and all bits of negatives: the result
// compares bytewise the way the doubles compare numerically.
fn sortable_f64(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let sortable = if bits & (1 << 63) == 0 { bits ^ (1 << 63) } else { !bits };
    sortable.to_be_bytes()
}

fn sortable_i64(value: i64) -> [u8; 8] {
    #[allow(clippy::cast_sign_loss)]
    let flipped = (value as u64) ^ (1 << 63);
    flipped.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn key(value: Value) -> Vec<u8> {
        from_single(&value).unwrap()
    }

    #[test]
    fn test_numeric_order_across_types() {
        let ordered = [
            Value::Double(f64::NEG_INFINITY),
            Value::Int64(-1_000_000),
            Value::Double(-1.5),
            Value::Int32(0),
            Value::Double(0.5),
            Value::Int32(1),
            Value::Int64(1_000_000),
            Value::Double(f64::INFINITY),
        ];
        let keys: Vec<Vec<u8>> = ordered.into_iter().map(key).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_equal_numbers_encode_identically() {
        assert_eq!(key(Value::Int32(7)), key(Value::Int64(7)));
        assert_eq!(key(Value::Int64(7)), key(Value::Double(7.0)));
    }

    #[test]
    fn test_string_order() {
        assert!(key(Value::String("a".into())) < key(Value::String("b".into())));
        assert!(key(Value::String("a".into())) < key(Value::String("aa".into())));
    }

    #[test]
    fn test_type_classes_separate() {
        assert!(key(Value::Null) < key(Value::Int32(i32::MIN)));
        assert!(key(Value::Double(f64::INFINITY)) < key(Value::String(String::new())));
        assert!(key(Value::String("zzz".into())) < key(Value::Bool(false)));
    }

    #[test]
    fn test_no_embedded_zero_in_variable_fields() {
        let k = key(Value::String("a\u{0}b".into()));
        // Only the field terminator may be zero.
        assert_eq!(k.iter().filter(|&&b| b == 0).count(), 1);
        assert_eq!(*k.last().unwrap(), 0);
    }

    #[test]
    fn test_escape_preserves_order() {
        let a = key(Value::String("a\u{0}b".into()));
        let b = key(Value::String("a\u{1}b".into()));
        let c = key(Value::String("ab".into()));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_terminated_strings_prefix_order() {
        // "a" must sort before "a\0" even though the latter embeds NUL.
        let a = key(Value::String("a".into()));
        let b = key(Value::String("a\u{0}".into()));
        assert!(a < b);
    }

    #[test]
    fn test_descending_inverts_order() {
        let a = from_values(&[Value::Int32(1)], &[false]).unwrap();
        let b = from_values(&[Value::Int32(2)], &[false]).unwrap();
        assert!(b < a);
    }

    #[test]
    fn test_compound_keys_order_fieldwise() {
        let ab = from_values(
            &[Value::String("a".into()), Value::Int32(2)],
            &[true, true],
        )
        .unwrap();
        let ba = from_values(
            &[Value::String("b".into()), Value::Int32(1)],
            &[true, true],
        )
        .unwrap();
        let aa = from_values(
            &[Value::String("a".into()), Value::Int32(1)],
            &[true, true],
        )
        .unwrap();
        assert!(aa < ab);
        assert!(ab < ba);
    }

    #[test]
    fn test_compound_prefix_is_exact_prefix() {
        let prefix = from_values(&[Value::String("a".into())], &[true]).unwrap();
        let full = from_values(
            &[Value::String("a".into()), Value::Int32(1)],
            &[true, true],
        )
        .unwrap();
        assert!(full.starts_with(&prefix));
    }

    #[test]
    fn test_document_field_encodes() {
        let k = key(Value::Document(doc! { "a": 1 }));
        assert_eq!(k[0], TAG_DOCUMENT);
        assert_eq!(*k.last().unwrap(), TERMINATOR);
    }
}
