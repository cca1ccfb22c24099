//! Payload validation for dispatched requests.
//!
//! Only `application/octet-stream` bodies are checked: they must be present
//! and no larger than the configured limit. Other content types pass through.

use axum::http::StatusCode;
use serde_json::json;
use thiserror::Error;

/// Why a payload was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadRejection {
    #[error("Missing payload")]
    Missing,

    #[error("Payload too large")]
    TooLarge { max_size: usize, actual_size: usize },
}

impl PayloadRejection {
    /// HTTP status for the rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            PayloadRejection::Missing => StatusCode::BAD_REQUEST,
            PayloadRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// JSON body for the rejection.
    pub fn body(&self) -> serde_json::Value {
        match self {
            PayloadRejection::Missing => json!({"error": self.to_string()}),
            PayloadRejection::TooLarge {
                max_size,
                actual_size,
            } => json!({
                "error": self.to_string(),
                "maxSize": max_size,
                "actualSize": actual_size,
            }),
        }
    }
}

/// Whether `content_type` names an opaque binary payload.
pub fn is_octet_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case("application/octet-stream"))
        .unwrap_or(false)
}

/// Refuse an oversized body from its declared length, before reading it.
pub fn check_declared(
    content_type: Option<&str>,
    declared: Option<usize>,
    max_size: usize,
) -> Result<(), PayloadRejection> {
    match declared {
        Some(actual_size) if is_octet_stream(content_type) && actual_size > max_size => {
            Err(PayloadRejection::TooLarge {
                max_size,
                actual_size,
            })
        }
        _ => Ok(()),
    }
}

/// Validate a received body.
pub fn validate(
    content_type: Option<&str>,
    body: &[u8],
    max_size: usize,
) -> Result<(), PayloadRejection> {
    if !is_octet_stream(content_type) {
        return Ok(());
    }
    if body.is_empty() {
        return Err(PayloadRejection::Missing);
    }
    if body.len() > max_size {
        return Err(PayloadRejection::TooLarge {
            max_size,
            actual_size: body.len(),
        });
    }
    Ok(())
}
