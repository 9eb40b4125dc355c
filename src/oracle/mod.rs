//! Client for the streaming generate endpoint.
//!
//! Every upstream failure (connect, non-200 status, broken stream, empty
//! answer, timeout, cancellation) turns into [`FALLBACK_ANSWER`]. Only
//! failures to construct the request surface as [`OracleError`].

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::prompt::{build_prompt, sanitize};
use crate::validate::MAX_QUESTION_CHARS;

pub mod ndjson;

pub const FALLBACK_ANSWER: &str = "The spirits cannot answer at this time. Try again later.";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    Connect,
    Status(u16),
    Read,
    Empty,
    Timeout,
    Cancelled,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::Connect => "connect",
            FallbackReason::Status(_) => "status",
            FallbackReason::Read => "read",
            FallbackReason::Empty => "empty",
            FallbackReason::Timeout => "timeout",
            FallbackReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceOutcome {
    Answer(String),
    Fallback(FallbackReason),
}

impl InferenceOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, InferenceOutcome::Fallback(_))
    }

    /// Text shown to the user; the fixed fallback sentence for failures.
    pub fn answer(&self) -> &str {
        match self {
            InferenceOutcome::Answer(text) => text,
            InferenceOutcome::Fallback(_) => FALLBACK_ANSWER,
        }
    }

    pub fn into_answer(self) -> String {
        match self {
            InferenceOutcome::Answer(text) => text,
            InferenceOutcome::Fallback(_) => FALLBACK_ANSWER.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("question too long ({0} characters)")]
    QuestionTooLong(usize),
    #[error("failed to encode generate request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to build generate request: {0}")]
    Request(#[source] reqwest::Error),
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

pub struct OracleClient {
    url: String,
    model: String,
    timeout: Duration,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OracleClient {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        max_tokens: u32,
    ) -> Result<Self, OracleError> {
        // Whole-request timeout on the client backs up the per-call deadline.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(OracleError::Client)?;
        Ok(Self {
            url: url.into(),
            model: model.into(),
            timeout,
            max_tokens,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Always yields a displayable answer unless the request itself could
    /// not be built.
    pub async fn generate(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OracleError> {
        Ok(self.generate_outcome(question, cancel).await?.into_answer())
    }

    pub async fn generate_outcome(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<InferenceOutcome, OracleError> {
        let chars = question.chars().count();
        if chars > MAX_QUESTION_CHARS {
            return Err(OracleError::QuestionTooLong(chars));
        }

        let question = sanitize(question);
        let prompt = build_prompt(&question);
        let payload = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            stream: true,
            options: GenerateOptions {
                num_predict: self.max_tokens,
            },
        };
        let body = serde_json::to_vec(&payload)?;
        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(OracleError::Request)?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => InferenceOutcome::Fallback(FallbackReason::Cancelled),
            res = tokio::time::timeout(self.timeout, self.stream_answer(request)) => {
                res.unwrap_or(InferenceOutcome::Fallback(FallbackReason::Timeout))
            }
        };

        if let InferenceOutcome::Fallback(reason) = &outcome {
            let status = match reason {
                FallbackReason::Status(code) => Some(*code),
                _ => None,
            };
            tracing::warn!(
                reason = reason.as_str(),
                status = ?status,
                model = %self.model,
                "generation failed, answering with fallback"
            );
        }
        Ok(outcome)
    }

    async fn stream_answer(&self, request: reqwest::Request) -> InferenceOutcome {
        let resp = match self.client.execute(request).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(error = %err, url = %self.url, "generate request failed");
                let reason = if err.is_timeout() {
                    FallbackReason::Timeout
                } else {
                    FallbackReason::Connect
                };
                return InferenceOutcome::Fallback(reason);
            }
        };

        let status = resp.status();
        if status != StatusCode::OK {
            return InferenceOutcome::Fallback(FallbackReason::Status(status.as_u16()));
        }

        match ndjson::aggregate(resp.bytes_stream()).await {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    InferenceOutcome::Fallback(FallbackReason::Empty)
                } else {
                    InferenceOutcome::Answer(text.to_string())
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "generate stream aborted");
                InferenceOutcome::Fallback(FallbackReason::Read)
            }
        }
    }
}
