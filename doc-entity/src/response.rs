use http::StatusCode;
use log::error;
use serde::{Serialize, Serializer};

use crate::Error;

pub const SUCCESS_MESSAGE: &str = "Successful Request";

/// Transport-neutral response envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    #[serde(serialize_with = "serialize_status")]
    pub status: StatusCode,
    pub message: String,
    pub body: serde_json::Value,
}

fn serialize_status<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}

/// Translates a repository result into an [`ApiResponse`].
pub trait IntoApiResponse {
    /// Failures map to `500 Internal Server Error`.
    fn api_response(self) -> ApiResponse
    where
        Self: Sized,
    {
        self.api_response_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Failures map to `failure`.
    fn api_response_or(self, failure: StatusCode) -> ApiResponse;
}

impl<T: Serialize> IntoApiResponse for Result<T, Error> {
    fn api_response_or(self, failure: StatusCode) -> ApiResponse {
        match self {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(body) => ApiResponse {
                    status: StatusCode::OK,
                    message: SUCCESS_MESSAGE.to_string(),
                    body,
                },
                Err(err) => {
                    error!("response serialization failed: {err}");
                    ApiResponse {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                        message: "response serialization failed".to_string(),
                        body: serde_json::Value::Null,
                    }
                }
            },
            Err(err) => ApiResponse {
                status: failure,
                message: err.client_message(),
                body: serde_json::Value::Null,
            },
        }
    }
}
