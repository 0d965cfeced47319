use std::cmp::Ordering;
use std::fmt;

use crate::{Document, Error, FieldType, KEY_FIELD, SchemaValidator, Value};

/// A dot-separated path to a document field, e.g. `stats.peak`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Checks the path syntax and that the schema knows the field.
    pub fn validate(&self, schema: &dyn SchemaValidator) -> Result<FieldType, Error> {
        let well_formed = !self.0.is_empty()
            && self.segments().all(|s| {
                !s.is_empty() && !s.starts_with('$') && !s.chars().any(char::is_whitespace)
            });
        if !well_formed {
            return Err(Error::InvalidPath(self.0.clone()));
        }
        schema
            .field_type(&self.0)
            .ok_or_else(|| Error::InvalidPath(self.0.clone()))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
}

/// Query predicate over field paths.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches every document.
    #[default]
    All,
    Cmp {
        path: FieldPath,
        op: CmpOp,
        value: Value,
    },
    In {
        path: FieldPath,
        values: Vec<Value>,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    fn cmp(path: impl Into<FieldPath>, op: CmpOp, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::cmp(path, CmpOp::Eq, value)
    }

    pub fn ne(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::cmp(path, CmpOp::Ne, value)
    }

    pub fn lt(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::cmp(path, CmpOp::Lt, value)
    }

    pub fn gt(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::cmp(path, CmpOp::Gt, value)
    }

    pub fn lte(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::cmp(path, CmpOp::Lte, value)
    }

    pub fn gte(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::cmp(path, CmpOp::Gte, value)
    }

    pub fn is_in<V: Into<Value>>(path: impl Into<FieldPath>, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            path: path.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn by_key(key: impl Into<String>) -> Self {
        Self::eq(KEY_FIELD, key.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, g) => Filter::And(vec![f, g]),
        }
    }

    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Rejects unknown paths and operator misuse before the filter reaches
    /// a store.
    pub fn validate(&self, schema: &dyn SchemaValidator) -> Result<(), Error> {
        match self {
            Filter::All => Ok(()),
            Filter::Cmp { path, op, value } => {
                let ty = path.validate(schema)?;
                check_operand(path, &ty, *op, value)
            }
            Filter::In { path, values } => {
                let ty = path.validate(schema)?;
                values
                    .iter()
                    .try_for_each(|value| check_operand(path, &ty, CmpOp::Eq, value))
            }
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().try_for_each(|f| f.validate(schema))
            }
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Cmp { path, op, value } => {
                let field = doc.get_path(path.as_str());
                match op {
                    CmpOp::Eq => field_equals(field, value),
                    CmpOp::Ne => !field_equals(field, value),
                    CmpOp::Lt => field_compares(field, value, |o| o == Ordering::Less),
                    CmpOp::Gt => field_compares(field, value, |o| o == Ordering::Greater),
                    CmpOp::Lte => field_compares(field, value, |o| o != Ordering::Greater),
                    CmpOp::Gte => field_compares(field, value, |o| o != Ordering::Less),
                }
            }
            Filter::In { path, values } => {
                let field = doc.get_path(path.as_str());
                values.iter().any(|value| field_equals(field, value))
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }

    /// The document key this filter pins down, when it requires one.
    pub(crate) fn key_lookup(&self) -> Option<&str> {
        match self {
            Filter::Cmp {
                path,
                op: CmpOp::Eq,
                value: Value::String(key),
            } if path.as_str() == KEY_FIELD => Some(key.as_str()),
            Filter::And(filters) => filters.iter().find_map(Filter::key_lookup),
            _ => None,
        }
    }

    /// Equality conditions that seed a document inserted by an upsert.
    pub(crate) fn equality_fields(&self) -> Vec<(&FieldPath, &Value)> {
        match self {
            Filter::Cmp {
                path,
                op: CmpOp::Eq,
                value,
            } => vec![(path, value)],
            Filter::And(filters) => filters.iter().flat_map(Filter::equality_fields).collect(),
            _ => Vec::new(),
        }
    }
}

fn check_operand(path: &FieldPath, ty: &FieldType, op: CmpOp, value: &Value) -> Result<(), Error> {
    let misuse = |reason: &str| Err(Error::InvalidPath(format!("{path}: {reason}")));
    match op {
        CmpOp::Lt | CmpOp::Gt | CmpOp::Lte | CmpOp::Gte => {
            if matches!(value, Value::Null | Value::Bool(_) | Value::Array(_) | Value::Document(_)) {
                return misuse("range operators need a number, string or datetime");
            }
        }
        CmpOp::Eq | CmpOp::Ne => {}
    }
    if value.is_null() {
        return Ok(());
    }
    let accepted = match ty {
        // an element of an array field may be compared directly
        FieldType::Array(inner) => inner.accepts(value) || ty.accepts(value),
        ty => ty.accepts(value),
    };
    if accepted {
        Ok(())
    } else {
        misuse(format!("value of type {} does not fit the field", value.type_name()).as_str())
    }
}

fn field_equals(field: Option<&Value>, value: &Value) -> bool {
    match field {
        None => value.is_null(),
        Some(Value::Array(items)) if !matches!(value, Value::Array(_)) => {
            items.iter().any(|item| item.loose_eq(value))
        }
        Some(field) => field.loose_eq(value),
    }
}

fn field_compares(field: Option<&Value>, value: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match field {
        None => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| item.partial_compare(value).is_some_and(&accept)),
        Some(field) => field.partial_compare(value).is_some_and(accept),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Ordered list of sort keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sort(Vec<(FieldPath, SortOrder)>);

impl Sort {
    pub fn asc(path: impl Into<FieldPath>) -> Self {
        Self(vec![(path.into(), SortOrder::Ascending)])
    }

    pub fn desc(path: impl Into<FieldPath>) -> Self {
        Self(vec![(path.into(), SortOrder::Descending)])
    }

    pub fn then(mut self, path: impl Into<FieldPath>, order: SortOrder) -> Self {
        self.0.push((path.into(), order));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[(FieldPath, SortOrder)] {
        &self.0
    }

    pub fn validate(&self, schema: &dyn SchemaValidator) -> Result<(), Error> {
        self.0.iter().try_for_each(|(path, _)| path.validate(schema).map(|_| ()))
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (path, order) in &self.0 {
            let left = a.get_path(path.as_str()).unwrap_or(&Value::Null);
            let right = b.get_path(path.as_str()).unwrap_or(&Value::Null);
            let ordering = match order {
                SortOrder::Ascending => left.sort_compare(right),
                SortOrder::Descending => right.sort_compare(left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Inclusion or exclusion of field paths in query results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection(Vec<(FieldPath, bool)>);

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, path: impl Into<FieldPath>) -> Self {
        self.0.push((path.into(), true));
        self
    }

    pub fn exclude(mut self, path: impl Into<FieldPath>) -> Self {
        self.0.push((path.into(), false));
        self
    }

    fn is_inclusive(&self) -> bool {
        self.0
            .iter()
            .any(|(path, include)| *include && path.as_str() != KEY_FIELD)
    }

    /// Mixing inclusions and exclusions is rejected, except for excluding the
    /// key from an inclusive projection.
    pub fn validate(&self, schema: &dyn SchemaValidator) -> Result<(), Error> {
        for (path, _) in &self.0 {
            path.validate(schema)?;
        }
        let inclusive = self.is_inclusive();
        let mixed = self
            .0
            .iter()
            .any(|(path, include)| !*include && inclusive && path.as_str() != KEY_FIELD);
        if mixed {
            return Err(Error::InvalidPath(
                "projection cannot mix included and excluded fields".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply(&self, doc: &Document) -> Result<Document, Error> {
        if self.0.is_empty() {
            return Ok(doc.clone());
        }
        let excluded = |path: &str| self.0.iter().any(|(p, include)| !include && p.as_str() == path);
        if self.is_inclusive() {
            let mut out = Document::new();
            if !excluded(KEY_FIELD) {
                if let Some(key) = doc.get(KEY_FIELD) {
                    out.insert(KEY_FIELD, key.clone());
                }
            }
            for (path, _) in self.0.iter().filter(|(_, include)| *include) {
                if let Some(value) = doc.get_path(path.as_str()) {
                    out.set_path(path.as_str(), value.clone())
                        .map_err(Error::InvalidPath)?;
                }
            }
            Ok(out)
        } else {
            let mut out = doc.clone();
            for (path, _) in &self.0 {
                out.remove_path(path.as_str());
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldSpec, Schema, doc};

    fn schema() -> Schema {
        Schema::new(vec![
            FieldSpec::new("x", FieldType::Int, false),
            FieldSpec::new("y", FieldType::Int, false),
            FieldSpec::new("z", FieldType::Int, false),
            FieldSpec::new("name", FieldType::String, false),
            FieldSpec::new("tags", FieldType::Array(Box::new(FieldType::String)), false),
            FieldSpec::new(
                "stats",
                FieldType::Object(Schema::new(vec![FieldSpec::new("peak", FieldType::Int, false)])),
                false,
            ),
        ])
    }

    #[test]
    fn comparison_operators() {
        let doc = doc! { "x" => 5, "name" => "gate", "stats" => doc! { "peak" => 9 } };
        assert!(Filter::eq("x", 5).matches(&doc));
        assert!(Filter::ne("x", 4).matches(&doc));
        assert!(Filter::lt("x", 6).matches(&doc));
        assert!(Filter::gte("x", 5).matches(&doc));
        assert!(!Filter::gt("x", 5).matches(&doc));
        assert!(Filter::lte("stats.peak", 9).matches(&doc));
        assert!(Filter::is_in("name", ["a", "gate"]).matches(&doc));
        assert!(!Filter::lt("missing", 3).matches(&doc));
    }

    #[test]
    fn equality_reaches_into_arrays() {
        let doc = doc! { "tags" => vec!["a", "b"] };
        assert!(Filter::eq("tags", "b").matches(&doc));
        assert!(!Filter::eq("tags", "c").matches(&doc));
    }

    #[test]
    fn and_with_or_clause() {
        let filter = Filter::eq("z", 3).and(Filter::any_of([Filter::eq("x", 1), Filter::eq("y", 2)]));
        assert!(filter.matches(&doc! { "z" => 3, "x" => 1 }));
        assert!(filter.matches(&doc! { "z" => 3, "y" => 2 }));
        assert!(!filter.matches(&doc! { "z" => 3, "x" => 2, "y" => 1 }));
        assert!(!filter.matches(&doc! { "z" => 4, "x" => 1 }));
    }

    #[test]
    fn unknown_paths_and_misused_operators_are_rejected() {
        let schema = schema();
        assert!(Filter::eq("stats.peak", 1).validate(&schema).is_ok());
        assert!(Filter::eq("tags", "a").validate(&schema).is_ok());
        assert!(Filter::eq("_id", "k").validate(&schema).is_ok());
        assert!(matches!(
            Filter::eq("nope", 1).validate(&schema),
            Err(Error::InvalidPath(_))
        ));
        assert!(Filter::eq("$where", 1).validate(&schema).is_err());
        assert!(Filter::gt("x", true).validate(&schema).is_err());
        assert!(Filter::eq("x", "five").validate(&schema).is_err());
    }

    #[test]
    fn projection_modes() {
        let doc = doc! { "_id" => "k", "x" => 1, "stats" => doc! { "peak" => 2 } };
        let inc = Projection::new().include("stats.peak");
        assert_eq!(inc.apply(&doc).unwrap(), doc! { "_id" => "k", "stats" => doc! { "peak" => 2 } });
        let exc = Projection::new().exclude("stats");
        assert_eq!(exc.apply(&doc).unwrap(), doc! { "_id" => "k", "x" => 1 });
        let no_key = Projection::new().include("x").exclude("_id");
        assert_eq!(no_key.apply(&doc).unwrap(), doc! { "x" => 1 });
    }

    #[test]
    fn key_lookup_finds_pinned_keys() {
        assert_eq!(Filter::by_key("k").key_lookup(), Some("k"));
        assert_eq!(Filter::eq("x", 1).and(Filter::by_key("k")).key_lookup(), Some("k"));
        assert_eq!(Filter::any_of([Filter::by_key("k")]).key_lookup(), None);
        assert_eq!(Filter::ne("_id", "k").key_lookup(), None);
    }

    #[test]
    fn projection_mixing_is_rejected() {
        let schema = schema();
        assert!(Projection::new().include("x").exclude("y").validate(&schema).is_err());
        assert!(Projection::new().include("x").exclude("_id").validate(&schema).is_ok());
    }

    #[test]
    fn sort_orders_by_keys_in_turn() {
        let a = doc! { "x" => 1, "y" => 2 };
        let b = doc! { "x" => 1, "y" => 3 };
        let sort = Sort::asc("x").then("y", SortOrder::Descending);
        assert_eq!(sort.compare(&a, &b), Ordering::Greater);
        assert_eq!(Sort::desc("x").compare(&a, &b), Ordering::Equal);
    }
}
