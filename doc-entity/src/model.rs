use chrono::{DateTime, Utc};

use crate::{Document, Error, FieldType, Schema, Value};

/// A struct that can be stored as a document. Usually derived with
/// `#[derive(Model)]`.
pub trait Model: Sized + Send + Sync + 'static {
    fn schema() -> Schema;

    fn to_document(&self) -> Document;

    /// Builds the model from a document. Fields the model does not declare
    /// are ignored.
    fn from_document(doc: &Document) -> Result<Self, Error>;
}

/// A model bound to a named collection.
pub trait Collection: Model {
    fn collection_name() -> &'static str;
}

/// A type usable as a model field.
pub trait Field: Sized {
    const REQUIRED: bool = true;

    fn field_type() -> FieldType;

    /// `None` omits the field from the document.
    fn to_value(&self) -> Option<Value>;

    /// `value` is `None` when the field is absent.
    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error>;
}

fn required<'a>(value: Option<&'a Value>, path: &str) -> Result<&'a Value, Error> {
    match value {
        None | Some(Value::Null) => Err(Error::decode(path, "missing required field")),
        Some(value) => Ok(value),
    }
}

fn mismatch(path: &str, expected: &str, found: &Value) -> Error {
    Error::decode(path, format!("expected {expected}, found {}", found.type_name()))
}

impl Field for String {
    fn field_type() -> FieldType {
        FieldType::String
    }

    fn to_value(&self) -> Option<Value> {
        Some(Value::String(self.clone()))
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        match required(value, path)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(mismatch(path, "string", other)),
        }
    }
}

impl Field for bool {
    fn field_type() -> FieldType {
        FieldType::Bool
    }

    fn to_value(&self) -> Option<Value> {
        Some(Value::Bool(*self))
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        match required(value, path)? {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(path, "bool", other)),
        }
    }
}

macro_rules! impl_int_field {
    ($($t:ty),+) => {
        $(
            impl Field for $t {
                fn field_type() -> FieldType {
                    FieldType::Int
                }

                fn to_value(&self) -> Option<Value> {
                    Some(Value::Int(*self as i64))
                }

                fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
                    match required(value, path)? {
                        Value::Int(v) => <$t>::try_from(*v)
                            .map_err(|_| Error::decode(path, format!("{v} out of range"))),
                        other => Err(mismatch(path, "int", other)),
                    }
                }
            }
        )+
    };
}

impl_int_field!(i32, i64, u32);

impl Field for f64 {
    fn field_type() -> FieldType {
        FieldType::Float
    }

    fn to_value(&self) -> Option<Value> {
        Some(Value::Float(*self))
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        let value = required(value, path)?;
        value.as_f64().ok_or_else(|| mismatch(path, "number", value))
    }
}

impl Field for DateTime<Utc> {
    fn field_type() -> FieldType {
        FieldType::DateTime
    }

    fn to_value(&self) -> Option<Value> {
        Some(Value::DateTime(*self))
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        match required(value, path)? {
            Value::DateTime(at) => Ok(*at),
            other => Err(mismatch(path, "datetime", other)),
        }
    }
}

impl Field for Document {
    fn field_type() -> FieldType {
        FieldType::Any
    }

    fn to_value(&self) -> Option<Value> {
        Some(Value::Document(self.clone()))
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        match required(value, path)? {
            Value::Document(doc) => Ok(doc.clone()),
            other => Err(mismatch(path, "document", other)),
        }
    }
}

impl<T: Field> Field for Option<T> {
    const REQUIRED: bool = false;

    fn field_type() -> FieldType {
        T::field_type()
    }

    fn to_value(&self) -> Option<Value> {
        self.as_ref().and_then(|value| value.to_value())
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        match value {
            None | Some(Value::Null) => Ok(None),
            value => T::from_value(value, path).map(Some),
        }
    }
}

impl<T: Field> Field for Vec<T> {
    fn field_type() -> FieldType {
        FieldType::Array(Box::new(T::field_type()))
    }

    fn to_value(&self) -> Option<Value> {
        Some(Value::Array(
            self.iter()
                .map(|item| item.to_value().unwrap_or(Value::Null))
                .collect(),
        ))
    }

    fn from_value(value: Option<&Value>, path: &str) -> Result<Self, Error> {
        match required(value, path)? {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| T::from_value(Some(item), &format!("{path}.{i}")))
                .collect(),
            other => Err(mismatch(path, "array", other)),
        }
    }
}

/// Declares an enum stored as one of a fixed set of strings.
///
/// ```ignore
/// string_enum! {
///     pub enum PassType {
///         Single => "single",
///         SevenDay => "7day",
///     }
/// }
/// ```
#[macro_export]
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            pub const VARIANTS: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} `{}`", stringify!($name), other)),
                }
            }
        }

        impl $crate::serde::Serialize for $name {
            fn serialize<S: $crate::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl From<$name> for $crate::Value {
            fn from(value: $name) -> Self {
                $crate::Value::String(value.as_str().to_string())
            }
        }

        impl $crate::Field for $name {
            fn field_type() -> $crate::FieldType {
                $crate::FieldType::Enum($name::VARIANTS)
            }

            fn to_value(&self) -> Option<$crate::Value> {
                Some($crate::Value::String(self.as_str().to_string()))
            }

            fn from_value(
                value: Option<&$crate::Value>,
                path: &str,
            ) -> Result<Self, $crate::Error> {
                let text = <String as $crate::Field>::from_value(value, path)?;
                text.parse().map_err(|message: String| $crate::Error::Decode {
                    path: path.to_string(),
                    message,
                })
            }
        }
    };
}
