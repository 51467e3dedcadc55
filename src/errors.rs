use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failure taxonomy shared by the dispatcher, the worker and the read path.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid transform: {0}")]
    InvalidSpec(String),
    #[error("unsupported format `{0}`")]
    UnsupportedFormat(String),
    #[error("invalid watermark source: {0}")]
    InvalidWatermarkSource(String),
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("pipeline failure: {0}")]
    PipelineFailure(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec(reason.into())
    }

    /// Only transient failures are worth another attempt at the I/O boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::InvalidWatermarkSource(_) => "invalid_watermark_source",
            Self::TransientIo(_) => "transient_io",
            Self::PipelineFailure(_) => "pipeline_failure",
            Self::Backend(_) => "backend",
        }
    }
}

impl From<sqlx::Error> for MediaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::TransientIo(err.to_string())
            }
            sqlx::Error::Database(ref db_err)
                if db_err.message().to_ascii_lowercase().contains("locked")
                    || db_err.message().to_ascii_lowercase().contains("busy") =>
            {
                Self::TransientIo(err.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<io::Error> for MediaError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::TransientIo(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for MediaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::TransientIo(err.to_string())
        } else {
            Self::InvalidWatermarkSource(err.to_string())
        }
    }
}

impl From<image::ImageError> for MediaError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(unsupported) => {
                Self::UnsupportedFormat(unsupported.to_string())
            }
            image::ImageError::IoError(io_err) => Self::from(io_err),
            other => Self::PipelineFailure(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MediaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {err}"))
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<MediaError> for AppError {
    fn from(err: MediaError) -> Self {
        let status = match &err {
            MediaError::NotFound(_) => StatusCode::NOT_FOUND,
            MediaError::InvalidSpec(_)
            | MediaError::UnsupportedFormat(_)
            | MediaError::InvalidWatermarkSource(_) => StatusCode::BAD_REQUEST,
            MediaError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            MediaError::PipelineFailure(_) | MediaError::Backend(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

/// Well-formed JSON of the wrong shape is a bad transform; other body
/// rejections keep their status but answer with the JSON error body.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(err) => MediaError::invalid_spec(err.body_text()).into(),
            other => AppError::new(other.status(), other.body_text()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
