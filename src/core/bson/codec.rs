//! BSON encoding and decoding.
//!
//! Follows the BSON wire layout: a document is a little-endian i32 total
//! length, a sequence of type-tagged elements with NUL-terminated field
//! names, and a trailing 0x00. Arrays are documents keyed "0", "1", ….

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{TimeZone, Utc};

use crate::core::bson::{Document, ObjectId, Value};
use crate::core::common::limits::MAX_BSON_DEPTH;
use crate::core::common::DbError;

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_DATETIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_INT32: u8 = 0x10;
const TAG_INT64: u8 = 0x12;

/// Encodes a document to its BSON byte representation.
///
/// # Errors
/// Returns `FailedToParse` when nesting exceeds the depth limit and
/// `Storage` on buffer write failures.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>, DbError> {
    let mut buf = Vec::new();
    write_document(&mut buf, doc, 1)?;
    Ok(buf)
}

/// Decodes a BSON byte string into a document.
///
/// # Errors
/// Returns `FailedToParse` on malformed input or excessive nesting.
pub fn decode_document(bytes: &[u8]) -> Result<Document, DbError> {
    let mut cursor = Cursor::new(bytes);
    let doc = read_document(&mut cursor, 1)?;
    Ok(doc)
}

fn write_document(out: &mut Vec<u8>, doc: &Document, depth: usize) -> Result<(), DbError> {
    if depth > MAX_BSON_DEPTH {
        return Err(DbError::FailedToParse(format!(
            "document exceeds maximum nesting depth of {MAX_BSON_DEPTH}"
        )));
    }
    let start = out.len();
    out.write_i32::<LittleEndian>(0)
        .map_err(|e| DbError::Storage(e.to_string()))?;
    for (key, value) in doc.iter() {
        write_element(out, key, value, depth)?;
    }
    out.push(0x00);
    let total = i32::try_from(out.len() - start)
        .map_err(|_| DbError::Storage("document length overflows i32".to_string()))?;
    out[start..start + 4].copy_from_slice(&total.to_le_bytes());
    Ok(())
}

fn write_element(out: &mut Vec<u8>, key: &str, value: &Value, depth: usize) -> Result<(), DbError> {
    if key.as_bytes().contains(&0x00) {
        return Err(DbError::BadValue(format!(
            "field name '{}' contains an interior NUL byte",
            key.escape_default()
        )));
    }
    let tag = match value {
        Value::Double(_) => TAG_DOUBLE,
        Value::String(_) => TAG_STRING,
        Value::Document(_) => TAG_DOCUMENT,
        Value::Array(_) => TAG_ARRAY,
        Value::Binary(_) => TAG_BINARY,
        Value::ObjectId(_) => TAG_OBJECT_ID,
        Value::Bool(_) => TAG_BOOL,
        Value::DateTime(_) => TAG_DATETIME,
        Value::Null => TAG_NULL,
        Value::Int32(_) => TAG_INT32,
        Value::Int64(_) => TAG_INT64,
    };
    out.push(tag);
    out.extend_from_slice(key.as_bytes());
    out.push(0x00);

    let err = |e: std::io::Error| DbError::Storage(e.to_string());
    match value {
        Value::Double(v) => out.write_f64::<LittleEndian>(*v).map_err(err)?,
        Value::String(v) => {
            let len = i32::try_from(v.len() + 1)
                .map_err(|_| DbError::Storage("string length overflows i32".to_string()))?;
            out.write_i32::<LittleEndian>(len).map_err(err)?;
            out.extend_from_slice(v.as_bytes());
            out.push(0x00);
        }
        Value::Document(v) => write_document(out, v, depth + 1)?,
        Value::Array(items) => {
            let as_doc: Document = items
                .iter()
                .enumerate()
                .map(|(i, item)| (i.to_string(), item.clone()))
                .collect();
            write_document(out, &as_doc, depth + 1)?;
        }
        Value::Binary(v) => {
            let len = i32::try_from(v.len())
                .map_err(|_| DbError::Storage("binary length overflows i32".to_string()))?;
            out.write_i32::<LittleEndian>(len).map_err(err)?;
            out.push(0x00); // generic subtype
            out.extend_from_slice(v);
        }
        Value::ObjectId(v) => out.extend_from_slice(v.bytes()),
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::DateTime(v) => out
            .write_i64::<LittleEndian>(v.timestamp_millis())
            .map_err(err)?,
        Value::Null => {}
        Value::Int32(v) => out.write_i32::<LittleEndian>(*v).map_err(err)?,
        Value::Int64(v) => out.write_i64::<LittleEndian>(*v).map_err(err)?,
    }
    Ok(())
}

fn parse_err(e: impl std::fmt::Display) -> DbError {
    DbError::FailedToParse(format!("malformed BSON: {e}"))
}

fn read_document(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Document, DbError> {
    if depth > MAX_BSON_DEPTH {
        return Err(DbError::FailedToParse(format!(
            "document exceeds maximum nesting depth of {MAX_BSON_DEPTH}"
        )));
    }
    let start = cursor.position();
    let total = cursor.read_i32::<LittleEndian>().map_err(parse_err)?;
    if total < 5 {
        return Err(parse_err("document length too small"));
    }
    let end = start + u64::try_from(total).map_err(parse_err)?;

    let mut doc = Document::new();
    loop {
        let tag = cursor.read_u8().map_err(parse_err)?;
        if tag == 0x00 {
            break;
        }
        let key = read_cstring(cursor)?;
        let value = read_value(cursor, tag, depth)?;
        doc.set(key, value);
    }
    if cursor.position() != end {
        return Err(parse_err("document length does not match content"));
    }
    Ok(doc)
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String, DbError> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8().map_err(parse_err)?;
        if b == 0x00 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(parse_err)
}

fn read_value(cursor: &mut Cursor<&[u8]>, tag: u8, depth: usize) -> Result<Value, DbError> {
    Ok(match tag {
        TAG_DOUBLE => Value::Double(cursor.read_f64::<LittleEndian>().map_err(parse_err)?),
        TAG_STRING => {
            let len = cursor.read_i32::<LittleEndian>().map_err(parse_err)?;
            if len < 1 {
                return Err(parse_err("string length too small"));
            }
            let mut bytes = vec![0u8; usize::try_from(len).map_err(parse_err)? - 1];
            cursor.read_exact(&mut bytes).map_err(parse_err)?;
            let terminator = cursor.read_u8().map_err(parse_err)?;
            if terminator != 0x00 {
                return Err(parse_err("string missing NUL terminator"));
            }
            Value::String(String::from_utf8(bytes).map_err(parse_err)?)
        }
        TAG_DOCUMENT => Value::Document(read_document(cursor, depth + 1)?),
        TAG_ARRAY => {
            let as_doc = read_document(cursor, depth + 1)?;
            Value::Array(as_doc.iter().map(|(_, v)| v.clone()).collect())
        }
        TAG_BINARY => {
            let len = cursor.read_i32::<LittleEndian>().map_err(parse_err)?;
            let _subtype = cursor.read_u8().map_err(parse_err)?;
            let mut bytes = vec![0u8; usize::try_from(len).map_err(parse_err)?];
            cursor.read_exact(&mut bytes).map_err(parse_err)?;
            Value::Binary(bytes)
        }
        TAG_OBJECT_ID => {
            let mut bytes = [0u8; 12];
            cursor.read_exact(&mut bytes).map_err(parse_err)?;
            Value::ObjectId(ObjectId::from_bytes(bytes))
        }
        TAG_BOOL => Value::Bool(cursor.read_u8().map_err(parse_err)? != 0),
        TAG_DATETIME => {
            let millis = cursor.read_i64::<LittleEndian>().map_err(parse_err)?;
            let dt = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| parse_err("datetime out of range"))?;
            Value::DateTime(dt)
        }
        TAG_NULL => Value::Null,
        TAG_INT32 => Value::Int32(cursor.read_i32::<LittleEndian>().map_err(parse_err)?),
        TAG_INT64 => Value::Int64(cursor.read_i64::<LittleEndian>().map_err(parse_err)?),
        other => return Err(parse_err(format!("unsupported element type 0x{other:02x}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_round_trip_scalars() {
        let doc = doc! {
            "null": Value::Null,
            "bool": true,
            "i32": 42,
            "i64": 42i64,
            "double": 1.5,
            "string": "hello",
            "binary": vec![1u8, 2, 3],
            "oid": ObjectId::new(),
            "date": Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap(),
        };
        let bytes = encode_document(&doc).unwrap();
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn test_round_trip_nested() {
        let doc = doc! {
            "nested": doc! { "a": 1, "b": doc! { "c": "deep" } },
            "array": vec![Value::Int32(1), Value::String("two".into()), Value::Null],
        };
        let bytes = encode_document(&doc).unwrap();
        assert_eq!(decode_document(&bytes).unwrap(), doc);
    }

    #[test]
    fn test_field_order_preserved() {
        let doc = doc! { "z": 1, "a": 2, "m": 3 };
        let decoded = decode_document(&encode_document(&doc).unwrap()).unwrap();
        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_depth_limit_enforced() {
        let mut doc = doc! { "leaf": 1 };
        for _ in 0..MAX_BSON_DEPTH {
            doc = doc! { "nest": doc };
        }
        let result = encode_document(&doc);
        assert!(matches!(result, Err(DbError::FailedToParse(_))));
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(decode_document(&[]).is_err());
        assert!(decode_document(&[4, 0, 0, 0]).is_err());
        // Truncated document: claims 100 bytes but has 5.
        assert!(decode_document(&[100, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_interior_nul_in_key_rejected() {
        let mut doc = Document::new();
        doc.set("bad\0key", 1i32);
        assert!(matches!(encode_document(&doc), Err(DbError::BadValue(_))));
    }
}
