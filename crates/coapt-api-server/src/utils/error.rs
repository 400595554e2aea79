use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::services::context::SearchContext;
use crate::services::conversation::ConversationError;
use crate::services::share::ShareError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    /// A chat turn failed after validation.
    #[error("Chat failed: {details}")]
    ChatFailed {
        details: String,
        partial_context: Option<SearchContext>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_context: Option<SearchContext>,
}

impl ErrorResponse {
    fn plain(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            partial_context: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, ErrorResponse::plain(msg))
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, ErrorResponse::plain(msg))
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::plain(msg))
            }
            ApiError::LlmError(msg) => {
                tracing::error!("LLM error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, ErrorResponse::plain(msg))
            }
            ApiError::ChatFailed {
                details,
                partial_context,
            } => {
                tracing::error!("Chat failed: {}", details);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "Failed to process chat message".to_string(),
                        details: Some(details),
                        partial_context,
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<ConversationError> for ApiError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::Validation(msg) => ApiError::BadRequest(msg),
            ConversationError::Upstream {
                message,
                partial_context,
            } => ApiError::ChatFailed {
                details: message,
                partial_context,
            },
        }
    }
}

impl From<ShareError> for ApiError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::NotFound => ApiError::NotFound(err.to_string()),
            ShareError::PropertyNotShared => ApiError::BadRequest(err.to_string()),
            ShareError::IdSpaceExhausted(_) => ApiError::InternalError(err.to_string()),
        }
    }
}
