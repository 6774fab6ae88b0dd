//! Ordered BSON document

use std::fmt;

use crate::datetime::DateTime;
use crate::error::{BsonError, Result};
use crate::oid::ObjectId;
use crate::value::{Binary, Bson};

/// An ordered mapping of element names to values
///
/// Element order is preserved exactly as inserted or decoded. The wire format
/// permits repeated names; `push` keeps them, `insert` replaces the first match.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Bson> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set `key`, replacing the first existing element with that name
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Append an element without checking for an existing name
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Bson>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Insert `key` as the first element, dropping any existing element with that name
    pub fn insert_first(&mut self, key: impl Into<String>, value: impl Into<Bson>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.insert(0, (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bson)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Bson> {
        self.entries.iter().map(|(_, v)| v)
    }

    fn require(&self, key: &str) -> Result<&Bson> {
        self.get(key)
            .ok_or_else(|| BsonError::FieldNotFound(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        let value = self.require(key)?;
        value
            .as_str()
            .ok_or_else(|| BsonError::type_mismatch("String", value.type_name()))
    }

    pub fn get_i32(&self, key: &str) -> Result<i32> {
        let value = self.require(key)?;
        value
            .as_i32()
            .ok_or_else(|| BsonError::type_mismatch("Int32", value.type_name()))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value
            .as_i64()
            .ok_or_else(|| BsonError::type_mismatch("Int64", value.type_name()))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        value
            .as_f64()
            .ok_or_else(|| BsonError::type_mismatch("Double", value.type_name()))
    }

    /// Numeric element of any width as `f64`
    pub fn get_f64_lossy(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        value
            .as_f64_lossy()
            .ok_or_else(|| BsonError::type_mismatch("number", value.type_name()))
    }

    /// Numeric element of any width as `i64`
    pub fn get_i64_lossy(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value
            .as_i64_lossy()
            .ok_or_else(|| BsonError::type_mismatch("number", value.type_name()))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.require(key)?;
        value
            .as_bool()
            .ok_or_else(|| BsonError::type_mismatch("Boolean", value.type_name()))
    }

    /// Loose boolean; a missing element is `false`
    pub fn get_truthy(&self, key: &str) -> bool {
        self.get(key).map(Bson::as_truthy).unwrap_or(false)
    }

    pub fn get_document(&self, key: &str) -> Result<&Document> {
        let value = self.require(key)?;
        value
            .as_document()
            .ok_or_else(|| BsonError::type_mismatch("Document", value.type_name()))
    }

    pub fn get_array(&self, key: &str) -> Result<&Vec<Bson>> {
        let value = self.require(key)?;
        value
            .as_array()
            .ok_or_else(|| BsonError::type_mismatch("Array", value.type_name()))
    }

    pub fn get_object_id(&self, key: &str) -> Result<ObjectId> {
        let value = self.require(key)?;
        value
            .as_object_id()
            .ok_or_else(|| BsonError::type_mismatch("ObjectId", value.type_name()))
    }

    pub fn get_datetime(&self, key: &str) -> Result<DateTime> {
        let value = self.require(key)?;
        value
            .as_datetime()
            .ok_or_else(|| BsonError::type_mismatch("DateTime", value.type_name()))
    }

    pub fn get_binary(&self, key: &str) -> Result<&Binary> {
        let value = self.require(key)?;
        value
            .as_binary()
            .ok_or_else(|| BsonError::type_mismatch("Binary", value.type_name()))
    }

    /// Encode to wire bytes
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        crate::codec::to_vec(self)
    }

    /// Decode from wire bytes; the slice must hold exactly one document
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        crate::codec::from_slice(bytes)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, " \"{}\": {}", k, v)?;
        }
        if !self.entries.is_empty() {
            f.write_str(" ")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<Bson>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = std::vec::IntoIter<(String, Bson)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Bson);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, Bson)>,
        fn(&'a (String, Bson)) -> (&'a String, &'a Bson),
    >;

    fn into_iter(self) -> Self::IntoIter {
        fn split(entry: &(String, Bson)) -> (&String, &Bson) {
            (&entry.0, &entry.1)
        }
        self.entries.iter().map(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_insert_preserves_order() {
        let mut d = Document::new();
        d.insert("b", 1);
        d.insert("a", 2);
        d.insert("b", 3);
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(d.get_i32("b").unwrap(), 3);
    }

    #[test]
    fn test_push_allows_repeats() {
        let mut d = Document::new();
        d.push("x", 1);
        d.push("x", 2);
        assert_eq!(d.len(), 2);
        assert_eq!(d.get_i32("x").unwrap(), 1);
    }

    #[test]
    fn test_insert_first() {
        let mut d = doc! { "a": 1, "_id": 5 };
        d.insert_first("_id", 7);
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["_id", "a"]);
        assert_eq!(d.get_i32("_id").unwrap(), 7);
    }

    #[test]
    fn test_typed_getters() {
        let d = doc! { "s": "x", "n": 2_i64, "ok": 1.0 };
        assert_eq!(d.get_str("s").unwrap(), "x");
        assert_eq!(d.get_i64("n").unwrap(), 2);
        assert!(d.get_truthy("ok"));
        assert!(!d.get_truthy("missing"));
        assert!(matches!(d.get_i32("s"), Err(BsonError::TypeMismatch { .. })));
        assert!(matches!(d.get_str("nope"), Err(BsonError::FieldNotFound(_))));
    }

    #[test]
    fn test_remove() {
        let mut d = doc! { "a": 1, "b": 2 };
        assert_eq!(d.remove("a"), Some(Bson::Int32(1)));
        assert_eq!(d.remove("a"), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_display() {
        let d = doc! { "a": 1, "b": "x" };
        assert_eq!(d.to_string(), "{ \"a\": 1, \"b\": \"x\" }");
        assert_eq!(Document::new().to_string(), "{}");
    }
}
