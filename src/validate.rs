//! Validation of `POST /ask` payloads.
//!
//! Rules run in order and the first failure wins: JSON content type, exact
//! payload shape, length cap, non-empty after sanitizing.

use axum::http::{header, HeaderMap};
use serde::Deserialize;

use crate::prompt::sanitize;

/// Upper bound on question length, in characters.
pub const MAX_QUESTION_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AskRequest {
    pub question: String,
}

/// A question that passed validation, already sanitized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question(String);

impl Question {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Content-Type must be application/json")]
    ContentType,
    #[error("Invalid request format")]
    Format,
    #[error("Question too long (max 1000 characters)")]
    TooLong,
    #[error("Question cannot be empty")]
    Empty,
}

pub fn validate_request(headers: &HeaderMap, body: &[u8]) -> Result<Question, ValidationError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(ValidationError::ContentType);
    }

    let req: AskRequest = serde_json::from_slice(body).map_err(|_| ValidationError::Format)?;
    validate_question(&req.question)
}

pub fn validate_question(raw: &str) -> Result<Question, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_QUESTION_CHARS {
        return Err(ValidationError::TooLong);
    }
    let cleaned = sanitize(trimmed);
    if cleaned.is_empty() {
        return Err(ValidationError::Empty);
    }
    Ok(Question(cleaned))
}
