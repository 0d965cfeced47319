use std::fmt;

use crate::{CREATED_ON_FIELD, Document, KEY_FIELD, Value};

/// Success/failure contract consumed by the repositories.
///
/// Both methods return the cleaned document (unknown fields dropped) on
/// success. `validate_partial` type-checks only the fields present.
pub trait SchemaValidator: Send + Sync {
    fn validate_full(&self, doc: &Document) -> Result<Document, ValidationErrors>;

    fn validate_partial(&self, doc: &Document) -> Result<Document, ValidationErrors>;

    /// Type of the field addressed by a dot path, `None` when the path does
    /// not exist. Validators without path knowledge accept everything.
    fn field_type(&self, _path: &str) -> Option<FieldType> {
        Some(FieldType::Any)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Int,
    /// Accepts ints as well.
    Float,
    Bool,
    DateTime,
    Enum(&'static [&'static str]),
    Array(Box<FieldType>),
    Object(Schema),
    Any,
}

impl FieldType {
    /// Whether a leaf value can be stored in a field of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Int, Value::Int(_)) => true,
            (FieldType::Float, Value::Int(_) | Value::Float(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::DateTime, Value::DateTime(_)) => true,
            (FieldType::Enum(variants), Value::String(s)) => variants.contains(&s.as_str()),
            (FieldType::Array(inner), Value::Array(items)) => {
                items.iter().all(|item| inner.accepts(item))
            }
            (FieldType::Object(schema), Value::Document(doc)) => {
                schema.check(doc, "", Mode::Full).is_ok()
            }
            _ => false,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float | FieldType::Any)
    }

    fn describe(&self) -> String {
        match self {
            FieldType::String => "string".into(),
            FieldType::Int => "int".into(),
            FieldType::Float => "number".into(),
            FieldType::Bool => "bool".into(),
            FieldType::DateTime => "datetime".into(),
            FieldType::Enum(variants) => format!("one of {variants:?}"),
            FieldType::Array(inner) => format!("array of {}", inner.describe()),
            FieldType::Object(_) => "document".into(),
            FieldType::Any => "any".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: &'static str, ty: FieldType, required: bool) -> Self {
        Self { name, ty, required }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Full,
    Partial,
}

/// Declarative schema, generated by `#[derive(Model)]` or written by hand.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn check(&self, doc: &Document, prefix: &str, mode: Mode) -> Result<Document, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let mut cleaned = Document::new();

        for spec in &self.fields {
            let path = join(prefix, spec.name);
            match doc.get(spec.name) {
                None | Some(Value::Null) if mode == Mode::Partial && !spec.required => {
                    if let Some(value) = doc.get(spec.name) {
                        cleaned.insert(spec.name, value.clone());
                    }
                }
                None if mode == Mode::Partial => {}
                None | Some(Value::Null) => {
                    if spec.required {
                        errors.push(path, "required field is missing");
                    }
                }
                Some(value) => match check_value(&spec.ty, value, &path, mode) {
                    Ok(value) => {
                        cleaned.insert(spec.name, value);
                    }
                    Err(e) => errors.extend(e),
                },
            }
        }

        if errors.is_empty() {
            Ok(cleaned)
        } else {
            Err(errors)
        }
    }

    fn resolve(&self, segments: &[&str]) -> Option<FieldType> {
        let (head, rest) = segments.split_first()?;
        let spec = self.field(head)?;
        resolve_within(&spec.ty, rest)
    }
}

fn resolve_within(ty: &FieldType, rest: &[&str]) -> Option<FieldType> {
    if rest.is_empty() {
        return Some(ty.clone());
    }
    match ty {
        FieldType::Any => Some(FieldType::Any),
        FieldType::Object(schema) => schema.resolve(rest),
        FieldType::Array(inner) => {
            if rest[0].parse::<usize>().is_ok() {
                resolve_within(inner, &rest[1..])
            } else {
                // `items.name` addresses the field of every element
                resolve_within(inner, rest)
            }
        }
        _ => None,
    }
}

fn check_value(ty: &FieldType, value: &Value, path: &str, mode: Mode) -> Result<Value, ValidationErrors> {
    match (ty, value) {
        (FieldType::Object(schema), Value::Document(doc)) => {
            schema.check(doc, path, mode).map(Value::Document)
        }
        (FieldType::Array(inner), Value::Array(items)) => {
            let mut errors = ValidationErrors::default();
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match check_value(inner, item, &format!("{path}.{i}"), mode) {
                    Ok(v) => out.push(v),
                    Err(e) => errors.extend(e),
                }
            }
            if errors.is_empty() {
                Ok(Value::Array(out))
            } else {
                Err(errors)
            }
        }
        (ty, value) if ty.accepts(value) => Ok(value.clone()),
        (ty, value) => {
            let mut errors = ValidationErrors::default();
            errors.push(
                path,
                format!("expected {}, found {}", ty.describe(), value.type_name()),
            );
            Err(errors)
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// The key and creation timestamp are managed by the repository layer and are
/// accepted by every schema.
fn check_meta(doc: &Document, cleaned: &mut Document, errors: &mut ValidationErrors) {
    match doc.get(KEY_FIELD) {
        None => {}
        Some(Value::String(key)) => {
            cleaned.insert(KEY_FIELD, key.clone());
        }
        Some(other) => errors.push(KEY_FIELD, format!("expected string, found {}", other.type_name())),
    }
    match doc.get(CREATED_ON_FIELD) {
        None => {}
        Some(Value::DateTime(at)) => {
            cleaned.insert(CREATED_ON_FIELD, *at);
        }
        Some(other) => errors.push(
            CREATED_ON_FIELD,
            format!("expected datetime, found {}", other.type_name()),
        ),
    }
}

impl SchemaValidator for Schema {
    fn validate_full(&self, doc: &Document) -> Result<Document, ValidationErrors> {
        let mut meta_errors = ValidationErrors::default();
        let mut meta = Document::new();
        check_meta(doc, &mut meta, &mut meta_errors);

        let result = self.check(doc, "", Mode::Full);
        merge_meta(result, meta, meta_errors)
    }

    fn validate_partial(&self, doc: &Document) -> Result<Document, ValidationErrors> {
        let mut meta_errors = ValidationErrors::default();
        let mut meta = Document::new();
        check_meta(doc, &mut meta, &mut meta_errors);

        let result = self.check(doc, "", Mode::Partial);
        merge_meta(result, meta, meta_errors)
    }

    fn field_type(&self, path: &str) -> Option<FieldType> {
        match path {
            KEY_FIELD => Some(FieldType::String),
            CREATED_ON_FIELD => Some(FieldType::DateTime),
            _ => {
                let segments: Vec<&str> = path.split('.').collect();
                self.resolve(&segments)
            }
        }
    }
}

fn merge_meta(
    result: Result<Document, ValidationErrors>,
    meta: Document,
    mut meta_errors: ValidationErrors,
) -> Result<Document, ValidationErrors> {
    match result {
        Ok(mut cleaned) if meta_errors.is_empty() => {
            for (k, v) in meta {
                cleaned.insert(k, v);
            }
            Ok(cleaned)
        }
        Ok(_) => Err(meta_errors),
        Err(errors) => {
            meta_errors.extend(errors);
            Err(meta_errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::default();
        errors.push(path, message);
        errors
    }

    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn booth_schema() -> Schema {
        Schema::new(vec![
            FieldSpec::new("location", FieldType::String, true),
            FieldSpec::new("totalCollection", FieldType::Float, true),
            FieldSpec::new("lanes", FieldType::Array(Box::new(FieldType::Int)), false),
            FieldSpec::new(
                "stats",
                FieldType::Object(Schema::new(vec![
                    FieldSpec::new("open", FieldType::Bool, true),
                    FieldSpec::new("peak", FieldType::Int, false),
                ])),
                false,
            ),
        ])
    }

    #[test]
    fn full_validation_requires_required_fields() {
        let err = booth_schema()
            .validate_full(&doc! { "location" => "north" })
            .unwrap_err();
        assert_eq!(err.errors().len(), 1);
        assert_eq!(err.errors()[0].path, "totalCollection");
    }

    #[test]
    fn full_validation_strips_unknown_fields_and_keeps_meta() {
        let now = chrono::Utc::now();
        let cleaned = booth_schema()
            .validate_full(&doc! {
                "location" => "north",
                "totalCollection" => 10,
                "junk" => true,
                "_id" => "k1",
                "createdOn" => now,
            })
            .unwrap();
        assert!(!cleaned.contains_key("junk"));
        assert_eq!(cleaned.get("_id"), Some(&Value::from("k1")));
        assert_eq!(cleaned.get("createdOn"), Some(&Value::DateTime(now)));
    }

    #[test]
    fn partial_validation_only_checks_present_fields() {
        let schema = booth_schema();
        assert!(schema.validate_partial(&doc! { "stats" => doc! { "peak" => 3 } }).is_ok());
        let err = schema
            .validate_partial(&doc! { "stats" => doc! { "peak" => "high" } })
            .unwrap_err();
        assert_eq!(err.errors()[0].path, "stats.peak");
    }

    #[test]
    fn array_elements_are_type_checked() {
        let err = booth_schema()
            .validate_partial(&doc! { "lanes" => vec![Value::Int(1), Value::from("two")] })
            .unwrap_err();
        assert_eq!(err.errors()[0].path, "lanes.1");
    }

    #[test]
    fn meta_fields_must_have_the_right_type() {
        let err = booth_schema()
            .validate_partial(&doc! { "createdOn" => "yesterday" })
            .unwrap_err();
        assert_eq!(err.errors()[0].path, "createdOn");
    }

    #[test]
    fn paths_resolve_through_nested_schemas() {
        let schema = booth_schema();
        assert_eq!(schema.field_type("stats.open"), Some(FieldType::Bool));
        assert_eq!(schema.field_type("lanes.0"), Some(FieldType::Int));
        assert_eq!(schema.field_type("createdOn"), Some(FieldType::DateTime));
        assert_eq!(schema.field_type("stats.missing"), None);
        assert_eq!(schema.field_type("location.inner"), None);
    }
}
