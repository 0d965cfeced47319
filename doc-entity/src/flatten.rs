use crate::{Document, Error, Value, schema::ValidationErrors};

/// Nesting depth beyond which [`flatten`] gives up.
pub const MAX_FLATTEN_DEPTH: usize = 32;

/// Flattens a nested partial document into dot-joined paths so that a
/// field-level update touches only the named leaves.
///
/// Arrays and date-times are leaves. An empty nested document contributes no
/// keys.
pub fn flatten(doc: &Document) -> Result<Document, Error> {
    let mut flat = Document::new();
    flatten_into(doc, "", 0, &mut flat)?;
    Ok(flat)
}

fn flatten_into(doc: &Document, prefix: &str, depth: usize, out: &mut Document) -> Result<(), Error> {
    if depth >= MAX_FLATTEN_DEPTH {
        return Err(Error::Validation(ValidationErrors::single(
            prefix.trim_end_matches('.'),
            format!("document nested deeper than {MAX_FLATTEN_DEPTH} levels"),
        )));
    }
    for (key, value) in doc.iter() {
        match value {
            Value::Document(inner) => {
                flatten_into(inner, &format!("{prefix}{key}."), depth + 1, out)?;
            }
            leaf => {
                out.insert(format!("{prefix}{key}"), leaf.clone());
            }
        }
    }
    Ok(())
}
