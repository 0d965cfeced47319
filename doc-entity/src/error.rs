use crate::schema::ValidationErrors;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("batch aborted at item {index}: {errors}")]
    BatchAbort {
        index: usize,
        errors: ValidationErrors,
    },
    #[error("Invalid field path: {0}")]
    InvalidPath(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("DoesNotExist")]
    DoesNotExist,
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("TiKV error: {0}")]
    TikvError(#[from] tikv_client::Error),
    #[error("Prost error: {0}")]
    SerializationError(#[from] prost::EncodeError),
    #[error("Prost error: {0}")]
    DeserializationError(#[from] prost::DecodeError),
    #[error("Decode error at `{path}`: {message}")]
    Decode { path: String, message: String },
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("session has already ended")]
    SessionEnded,
    #[error("nested transactions are not supported")]
    NestedTransaction,
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of [`Error`], used by callers that only care about
/// the failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Store,
    BatchAbort,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidPath(_) | Error::InvalidKey(_) => {
                ErrorKind::Validation
            }
            Error::BatchAbort { .. } => ErrorKind::BatchAbort,
            Error::DoesNotExist => ErrorKind::NotFound,
            _ => ErrorKind::Store,
        }
    }

    /// Short message safe to hand back to a client. Driver detail stays in
    /// the logs.
    pub fn client_message(&self) -> String {
        match self {
            Error::Validation(_) => "validation failed".to_string(),
            Error::BatchAbort { index, .. } => format!("validation failed for item {index}"),
            Error::InvalidPath(path) => format!("invalid field path: {path}"),
            Error::InvalidKey(_) => "invalid key".to_string(),
            Error::DoesNotExist => "DoesNotExist".to_string(),
            Error::DuplicateKey(_) => "document already exists".to_string(),
            Error::WriteConflict(_) => "document changed concurrently, retry".to_string(),
            Error::NestedTransaction => "nested transactions are not supported".to_string(),
            Error::TransactionAborted(_) => "transaction aborted".to_string(),
            _ => "store error".to_string(),
        }
    }

    pub(crate) fn decode(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Decode {
            path: path.into(),
            message: message.into(),
        }
    }
}
