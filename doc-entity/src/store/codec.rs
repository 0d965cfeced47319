use std::collections::BTreeMap;

use chrono::DateTime;
use prost::Message;

use super::{IndexOptions, IndexSpec};
use crate::{Document, Error, SortOrder, Value};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentProto {
    #[prost(btree_map = "string, message", tag = "1")]
    pub fields: BTreeMap<String, ValueProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListProto {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<ValueProto>,
}

/// An absent kind encodes null.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueProto {
    #[prost(oneof = "value_proto::Kind", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub kind: Option<value_proto::Kind>,
}

pub mod value_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(bool, tag = "1")]
        Bool(bool),
        #[prost(int64, tag = "2")]
        Int(i64),
        #[prost(double, tag = "3")]
        Float(f64),
        #[prost(string, tag = "4")]
        String(::prost::alloc::string::String),
        #[prost(int64, tag = "5")]
        DateTimeMillis(i64),
        #[prost(message, tag = "6")]
        Array(super::ListProto),
        #[prost(message, tag = "7")]
        Document(super::DocumentProto),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexKeyProto {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub descending: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexProto {
    #[prost(message, repeated, tag = "1")]
    pub keys: Vec<IndexKeyProto>,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub unique: bool,
}

fn value_to_proto(value: &Value) -> ValueProto {
    use value_proto::Kind;
    let kind = match value {
        Value::Null => None,
        Value::Bool(b) => Some(Kind::Bool(*b)),
        Value::Int(i) => Some(Kind::Int(*i)),
        Value::Float(f) => Some(Kind::Float(*f)),
        Value::String(s) => Some(Kind::String(s.clone())),
        Value::DateTime(at) => Some(Kind::DateTimeMillis(at.timestamp_millis())),
        Value::Array(items) => Some(Kind::Array(ListProto {
            values: items.iter().map(value_to_proto).collect(),
        })),
        Value::Document(doc) => Some(Kind::Document(document_to_proto(doc))),
    };
    ValueProto { kind }
}

fn value_from_proto(proto: ValueProto) -> Result<Value, Error> {
    use value_proto::Kind;
    Ok(match proto.kind {
        None => Value::Null,
        Some(Kind::Bool(b)) => Value::Bool(b),
        Some(Kind::Int(i)) => Value::Int(i),
        Some(Kind::Float(f)) => Value::Float(f),
        Some(Kind::String(s)) => Value::String(s),
        Some(Kind::DateTimeMillis(millis)) => Value::DateTime(
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| Error::Store(format!("timestamp {millis} out of range")))?,
        ),
        Some(Kind::Array(list)) => Value::Array(
            list.values
                .into_iter()
                .map(value_from_proto)
                .collect::<Result<_, _>>()?,
        ),
        Some(Kind::Document(doc)) => Value::Document(document_from_proto(doc)?),
    })
}

fn document_to_proto(doc: &Document) -> DocumentProto {
    DocumentProto {
        fields: doc
            .iter()
            .map(|(key, value)| (key.clone(), value_to_proto(value)))
            .collect(),
    }
}

fn document_from_proto(proto: DocumentProto) -> Result<Document, Error> {
    let mut doc = Document::new();
    for (key, value) in proto.fields {
        doc.insert(key, value_from_proto(value)?);
    }
    Ok(doc)
}

pub(crate) fn encode_document(doc: &Document) -> Vec<u8> {
    document_to_proto(doc).encode_to_vec()
}

pub(crate) fn decode_document(data: &[u8]) -> Result<Document, Error> {
    document_from_proto(DocumentProto::decode(data).map_err(Error::DeserializationError)?)
}

/// Deterministic bytes for a tuple of values.
pub(crate) fn encode_values(values: &[Value]) -> Vec<u8> {
    ListProto {
        values: values.iter().map(value_to_proto).collect(),
    }
    .encode_to_vec()
}

pub(crate) fn encode_index(index: &IndexSpec) -> Vec<u8> {
    IndexProto {
        keys: index
            .keys
            .iter()
            .map(|(path, order)| IndexKeyProto {
                path: path.clone(),
                descending: *order == SortOrder::Descending,
            })
            .collect(),
        name: index.name(),
        unique: index.options.unique,
    }
    .encode_to_vec()
}

pub(crate) fn decode_index(data: &[u8]) -> Result<IndexSpec, Error> {
    let proto = IndexProto::decode(data).map_err(Error::DeserializationError)?;
    Ok(IndexSpec {
        keys: proto
            .keys
            .into_iter()
            .map(|key| {
                let order = if key.descending {
                    SortOrder::Descending
                } else {
                    SortOrder::Ascending
                };
                (key.path, order)
            })
            .collect(),
        options: IndexOptions {
            name: Some(proto.name),
            unique: proto.unique,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn nested_values_survive_encoding() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let doc = doc! {
            "_id" => "k",
            "createdOn" => at,
            "location" => doc! { "lat" => 1.5, "tags" => vec!["a", "b"] },
            "missing" => Value::Null,
            "count" => 3,
        };
        assert_eq!(decode_document(&encode_document(&doc)).unwrap(), doc);
    }

    #[test]
    fn garbage_is_a_deserialization_error() {
        assert!(matches!(
            decode_document(&[0xff, 0xff, 0xff]),
            Err(Error::DeserializationError(_))
        ));
    }

    #[test]
    fn value_tuples_encode_deterministically() {
        let nested = || Value::Document(doc! { "b" => 2, "a" => 1 });
        let left = encode_values(&[Value::from("u1"), nested()]);
        assert_eq!(left, encode_values(&[Value::from("u1"), nested()]));
        assert_ne!(left, encode_values(&[Value::from("u2"), nested()]));
        assert_ne!(
            encode_values(&[Value::Int(1)]),
            encode_values(&[Value::Float(1.0)])
        );
    }

    #[test]
    fn index_names_are_persisted() {
        let index = IndexSpec::new(vec![("uid".to_string(), SortOrder::Descending)]).unique();
        let decoded = decode_index(&encode_index(&index)).unwrap();
        assert_eq!(decoded.name(), "uid_-1");
        assert_eq!(decoded.keys, index.keys);
        assert!(decoded.options.unique);
    }
}
