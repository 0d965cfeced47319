use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// A dynamically typed document value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    Document(Document),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Array(_) => "array",
            Value::Document(_) => "document",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Ordering between values of the same family. Ints and floats compare
    /// numerically; anything else across families is incomparable.
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used by sorting: values are grouped by family first.
    pub fn sort_compare(&self, other: &Value) -> Ordering {
        self.partial_compare(other)
            .unwrap_or_else(|| sort_rank(self).cmp(&sort_rank(other)))
    }

    /// Equality used by query predicates, numeric across int/float.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.partial_compare(b) == Some(Ordering::Equal)
            }
            (a, b) => a == b,
        }
    }
}

fn sort_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Int(_) | Value::Float(_) => 1,
        Value::String(_) => 2,
        Value::Document(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
        Value::DateTime(_) => 6,
    }
}

macro_rules! impl_from_value {
    ($($t:ty => |$v:ident| $e:expr),+ $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from($v: $t) -> Self {
                    $e
                }
            }
        )+
    };
}

impl_from_value! {
    bool => |v| Value::Bool(v),
    i32 => |v| Value::Int(v as i64),
    i64 => |v| Value::Int(v),
    u32 => |v| Value::Int(v as i64),
    f64 => |v| Value::Float(v),
    String => |v| Value::String(v),
    &str => |v| Value::String(v.to_string()),
    DateTime<Utc> => |v| Value::DateTime(v),
    Document => |v| Value::Document(v),
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An ordered mapping of field names to values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Looks up a dot-separated path. Numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Document(doc) => doc.fields.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at a dot-separated path, creating intermediate
    /// documents. Fails when an intermediate segment holds a scalar.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<(), String> {
        match path.split_once('.') {
            None => {
                self.fields.insert(path.to_string(), value);
                Ok(())
            }
            Some((head, rest)) => {
                let slot = self
                    .fields
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Document(Document::new()));
                match slot {
                    Value::Document(doc) => doc.set_path(rest, value),
                    Value::Null => {
                        let mut doc = Document::new();
                        doc.set_path(rest, value)?;
                        *slot = Value::Document(doc);
                        Ok(())
                    }
                    other => Err(format!(
                        "cannot create field `{rest}` inside {} value `{head}`",
                        other.type_name()
                    )),
                }
            }
        }
    }

    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.fields.remove(path),
            Some((head, rest)) => match self.fields.get_mut(head)? {
                Value::Document(doc) => doc.remove_path(rest),
                _ => None,
            },
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::DateTime(v) => v.serialize(serializer),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Document(doc) => doc.serialize(serializer),
        }
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Builds a [`Document`] from `key => value` pairs.
///
/// ```ignore
/// let patch = doc! { "location" => "A4", "stats" => doc! { "lanes" => 4 } };
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut doc = $crate::Document::new();
        $(
            doc.insert($key, $value);
        )+
        doc
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_access_descends_documents_and_arrays() {
        let doc = doc! {
            "a" => doc! { "b" => 1 },
            "list" => vec![doc! { "x" => "first" }],
        };
        assert_eq!(doc.get_path("a.b"), Some(&Value::Int(1)));
        assert_eq!(
            doc.get_path("list.0.x"),
            Some(&Value::String("first".into()))
        );
        assert_eq!(doc.get_path("a.c"), None);
        assert_eq!(doc.get_path("a.b.c"), None);
    }

    #[test]
    fn set_path_keeps_siblings() {
        let mut doc = doc! { "a" => doc! { "b" => 1, "c" => 2 } };
        doc.set_path("a.b", Value::Int(5)).unwrap();
        doc.set_path("x.y.z", Value::Bool(true)).unwrap();
        assert_eq!(doc.get_path("a.b"), Some(&Value::Int(5)));
        assert_eq!(doc.get_path("a.c"), Some(&Value::Int(2)));
        assert_eq!(doc.get_path("x.y.z"), Some(&Value::Bool(true)));
    }

    #[test]
    fn set_path_refuses_to_descend_into_scalars() {
        let mut doc = doc! { "a" => 1 };
        assert!(doc.set_path("a.b", Value::Int(2)).is_err());
    }

    #[test]
    fn numeric_comparison_spans_int_and_float() {
        assert!(Value::Int(2).loose_eq(&Value::Float(2.0)));
        assert_eq!(
            Value::Int(1).partial_compare(&Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).partial_compare(&Value::from("1")), None);
        assert_eq!(Value::Null.sort_compare(&Value::Int(0)), Ordering::Less);
    }
}
