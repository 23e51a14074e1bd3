use std::time::Duration;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Failure reported by the extraction toolchain boundary.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("yt-dlp is not installed or not on PATH. Install yt-dlp and restart the server.")]
    NotInstalled,
    #[error("could not run yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("yt-dlp did not finish within {} seconds", .0.as_secs())]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(String),
    #[error("could not read yt-dlp metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
    #[error("yt-dlp did not report where the downloaded file was written")]
    MissingOutputPath,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    pub fn file_not_found() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Downloaded file not found.".to_string(),
            code: Some("FILE_NOT_FOUND"),
        }
    }
}

impl From<ExtractionError> for ApiError {
    fn from(error: ExtractionError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
            code: Some("EXTRACTION_FAILED"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
