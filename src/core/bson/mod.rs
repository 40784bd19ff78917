//! The document data model: a dynamically typed `Value`, an ordered
//! `Document`, ObjectId generation, the BSON codec, and the canonical
//! comparison routine.

pub mod codec;
pub mod compare;
pub mod object_id;

pub use codec::{decode_document, encode_document};
pub use compare::compare_values;
pub use object_id::ObjectId;

use chrono::{DateTime, Utc};

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
    ObjectId(ObjectId),
    Array(Vec<Value>),
    Document(Document),
}

impl Value {
    /// Returns the numeric content as an `i64` for any of the numeric
    /// variants.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            #[allow(clippy::cast_possible_truncation)]
            Self::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}
impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Self::ObjectId(v)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}
impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Self::Document(v)
    }
}

/// An ordered mapping from field names to values. Field order is
/// preserved across encode/decode round trips.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Resolves a dot-separated path through nested documents.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            current = current.as_document()?.get(part)?;
        }
        Some(current)
    }

    /// Sets a field, replacing an existing value in place or appending.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Inserts a field at the front, used for engine-assigned `_id`.
    pub fn set_front(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.remove(&key);
        self.entries.insert(0, (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The document's `_id` value, if present.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.get("_id")
    }

    /// The deepest nesting level of this document. A flat document has
    /// depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        fn value_depth(value: &Value) -> usize {
            match value {
                Value::Document(doc) => doc.depth(),
                Value::Array(items) => {
                    1 + items.iter().map(value_depth).max().unwrap_or(0)
                }
                _ => 0,
            }
        }
        1 + self
            .entries
            .iter()
            .map(|(_, v)| value_depth(v))
            .max()
            .unwrap_or(0)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Builds a [`Document`] from `key: value` pairs.
///
/// ```
/// use doclite::doc;
/// let d = doc! { "name": "ada", "age": 36 };
/// assert_eq!(d.len(), 2);
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::core::bson::Document::new() };
    ($($key:tt : $value:expr),+ $(,)?) => {{
        let mut document = $crate::core::bson::Document::new();
        $( document.set($key, $crate::core::bson::Value::from($value)); )+
        document
    }};
}
