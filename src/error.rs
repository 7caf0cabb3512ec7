use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the ingestion/evaluation API on a non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub r#type: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub attr: serde_json::Value,
}

impl Display for ApiErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "type: {}, code: {}, detail: {}, attr: {:?}",
            self.r#type, self.code, self.detail, self.attr
        )
    }
}

/// Crate-wide error type. Internal evaluation paths (inconclusive match,
/// server-required, missing dependency) are *not* represented here: those are
/// expected control flow, not failures, and are modeled as dedicated result
/// types inside the `flags` module.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API returned error status {0}: {1}")]
    Api(u16, ApiErrorBody),

    #[error("event queue is full, event was dropped")]
    QueueFull,
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        Error::Config(e.to_string())
    }
}
