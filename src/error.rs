//! Error types for relaygate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for relaygate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The step of an outbound call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    /// Building the upstream URL.
    Url,
    /// Applying request headers.
    Headers,
    /// Provider-specific body translation.
    Transform,
    /// Sending the request through the transport.
    Execute,
}

impl std::fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            DispatchStage::Url => "get request url",
            DispatchStage::Headers => "setup request header",
            DispatchStage::Transform => "transform request body",
            DispatchStage::Execute => "do request",
        };
        f.write_str(stage)
    }
}

/// Main error type for relaygate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid channel: {0}")]
    Validation(String),

    #[error("Channel {id} not found")]
    NotFound { id: i64 },

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("No available channel for model '{model}' in group '{group}'")]
    Exhausted { model: String, group: String },

    #[error("{stage} failed: {source}")]
    Dispatch {
        stage: DispatchStage,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Wrap this error with the dispatch stage it occurred in.
    pub fn at(self, stage: DispatchStage) -> Self {
        Error::Dispatch {
            stage,
            source: Box::new(self),
        }
    }

    /// Upstream HTTP status carried by this error, looking through stage wrappers.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            Error::Transport(e) => e.status().map(|s| s.as_u16()),
            Error::Dispatch { source, .. } => source.upstream_status(),
            _ => None,
        }
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Dispatch { .. } => StatusCode::BAD_GATEWAY,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "relaygate_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_keeps_upstream_status() {
        let err = Error::Upstream {
            status: 429,
            message: "rate limited".to_string(),
        }
        .at(DispatchStage::Execute);

        assert_eq!(err.upstream_status(), Some(429));
        assert_eq!(
            err.to_string(),
            "do request failed: Upstream returned 429: rate limited"
        );
    }

    #[test]
    fn test_exhausted_maps_to_503() {
        let err = Error::Exhausted {
            model: "gpt-4o".to_string(),
            group: "default".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
