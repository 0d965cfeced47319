//! Typed document repositories over an injected document store.

extern crate self as doc_entity;

mod config;
mod context;
mod db;
mod document_handle;
mod error;
mod filter;
mod flatten;
mod model;
mod repository;
mod response;
mod schema;
pub mod store;
mod utils;
mod value;

pub use config::{Backend, StoreConfig};
pub use context::RequestContext;
pub use db::DB;
pub use doc_entity_derive::Model;
pub use document_handle::DocumentHandle;
pub use error::{Error, ErrorKind};
pub use filter::{CmpOp, FieldPath, Filter, Projection, Sort, SortOrder};
pub use flatten::{MAX_FLATTEN_DEPTH, flatten};
pub use model::{Collection, Field, Model};
pub use repository::{CollectionRepository, FilterAndSort, Page, Record};
pub use response::{ApiResponse, IntoApiResponse};
pub use schema::{FieldError, FieldSpec, FieldType, Schema, SchemaValidator, ValidationErrors};
pub use store::{DocumentStore, IndexSpec, StoreSession, UpdateOutcome};
pub use value::{Document, Value};

pub use http;
#[doc(hidden)]
pub use serde;

/// Field holding the document key.
pub const KEY_FIELD: &str = "_id";

/// Field holding the creation timestamp.
pub const CREATED_ON_FIELD: &str = "createdOn";

/// Outcome of every repository operation.
pub type RepoResult<T> = Result<T, Error>;
