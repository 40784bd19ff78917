//! Canonical total order over values.
//!
//! Values compare by type class first (Null < numbers < String <
//! Document < Array < Binary < ObjectId < Bool < DateTime), then within
//! the class. The three numeric types form a single class and compare by
//! numeric value.

use std::cmp::Ordering;

use crate::core::bson::Value;

/// The rank of a value's type class in the canonical sort order.
const fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) => 1,
        Value::String(_) => 2,
        Value::Document(_) => 3,
        Value::Array(_) => 4,
        Value::Binary(_) => 5,
        Value::ObjectId(_) => 6,
        Value::Bool(_) => 7,
        Value::DateTime(_) => 8,
    }
}

/// Compares two values under the canonical total order.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Value::Int32(x), Value::Int32(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Int32(x), Value::Int64(y)) => i64::from(*x).cmp(y),
        (Value::Int64(x), Value::Int32(y)) => x.cmp(&i64::from(*y)),
        (Value::Array(_) | Value::Document(_), _) => a.canonical_cmp(b),
        (x, y) => compare_numeric(x, y),
    }
}

/// Mixed numeric and double comparisons go through f64. NaN sorts below
/// every other number, matching the canonical order for non-comparable
/// doubles.
fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    fn as_f64(value: &Value) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        match value {
            Value::Int32(v) => f64::from(*v),
            Value::Int64(v) => *v as f64,
            Value::Double(v) => *v,
            _ => unreachable!("compare_numeric called on non-numeric value"),
        }
    }
    let (x, y) = (as_f64(a), as_f64(b));
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Structural comparison for composite values, used after the type-rank
/// check has matched.
impl Value {
    /// Compares composite values elementwise; scalars defer to
    /// [`compare_values`].
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Array(x), Self::Array(y)) => {
                for (a, b) in x.iter().zip(y.iter()) {
                    let ord = a.canonical_cmp(b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                x.len().cmp(&y.len())
            }
            (Self::Document(x), Self::Document(y)) => {
                for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                    let key_ord = ka.cmp(kb);
                    if key_ord != Ordering::Equal {
                        return key_ord;
                    }
                    let val_ord = va.canonical_cmp(vb);
                    if val_ord != Ordering::Equal {
                        return val_ord;
                    }
                }
                x.len().cmp(&y.len())
            }
            _ => compare_values(self, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_type_classes_order() {
        let ordered = [
            Value::Null,
            Value::Int32(1),
            Value::String("a".into()),
            Value::Document(doc! {}),
            Value::Array(vec![]),
            Value::Binary(vec![]),
            Value::ObjectId(crate::core::bson::ObjectId::from_bytes([0; 12])),
            Value::Bool(false),
            Value::DateTime(chrono::Utc::now()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn test_cross_type_numeric_compare() {
        assert_eq!(
            compare_values(&Value::Int32(2), &Value::Double(2.0)),
            Ordering::Equal
        );
        assert_eq!(
            compare_values(&Value::Int64(3), &Value::Double(2.5)),
            Ordering::Greater
        );
        assert_eq!(
            compare_values(&Value::Int32(-1), &Value::Int64(0)),
            Ordering::Less
        );
    }

    #[test]
    fn test_nan_sorts_below_numbers() {
        assert_eq!(
            compare_values(&Value::Double(f64::NAN), &Value::Double(0.0)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Double(f64::NAN), &Value::Double(f64::NAN)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_array_elementwise() {
        let a = Value::Array(vec![Value::Int32(1), Value::Int32(2)]);
        let b = Value::Array(vec![Value::Int32(1), Value::Int32(3)]);
        let c = Value::Array(vec![Value::Int32(1)]);
        assert_eq!(a.canonical_cmp(&b), Ordering::Less);
        assert_eq!(c.canonical_cmp(&a), Ordering::Less);
    }

    #[test]
    fn test_compare_values_handles_composites() {
        let a = Value::Array(vec![Value::Int32(1)]);
        let b = Value::Array(vec![Value::Int32(1)]);
        assert_eq!(compare_values(&a, &b), Ordering::Equal);
        let x = Value::Document(doc! { "k": 1 });
        let y = Value::Document(doc! { "k": 2 });
        assert_eq!(compare_values(&x, &y), Ordering::Less);
    }

    #[test]
    fn test_document_compares_keys_then_values() {
        let a = Value::Document(doc! { "a": 1 });
        let b = Value::Document(doc! { "b": 0 });
        assert_eq!(a.canonical_cmp(&b), Ordering::Less);
    }
}
