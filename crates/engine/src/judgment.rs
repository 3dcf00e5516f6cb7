//! Semantic judgment contract.
//!
//! The engine renders the prompt and maps the answer; everything between
//! (model choice, prompt engineering) belongs to the [`JudgmentService`]
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Answer returned by a judgment backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    /// Categorical answer, e.g. `"yes"` or `"no"`.
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Judgment {
    pub fn new(answer: impl Into<String>, confidence: Option<f64>) -> Self {
        Self {
            answer: answer.into(),
            confidence,
            rationale: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgmentError {
    #[error("Judgment service unavailable: {0}")]
    Unavailable(String),

    #[error("Judgment service returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait JudgmentService: Send + Sync {
    async fn judge(&self, prompt: &str, context: &Value) -> Result<Judgment, JudgmentError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP request timeout for a single judgment.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts `{prompt, context}` to an endpoint that replies with a [`Judgment`].
pub struct HttpJudgmentService {
    client: reqwest::Client,
    url: String,
}

impl HttpJudgmentService {
    pub fn new(url: impl Into<String>) -> Result<Self, JudgmentError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| JudgmentError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JudgmentService for HttpJudgmentService {
    async fn judge(&self, prompt: &str, context: &Value) -> Result<Judgment, JudgmentError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "prompt": prompt, "context": context }))
            .send()
            .await
            .map_err(|e| JudgmentError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JudgmentError::Unavailable(format!("HTTP {}", status.as_u16())));
        }

        response
            .json::<Judgment>()
            .await
            .map_err(|e| JudgmentError::InvalidResponse(e.to_string()))
    }
}
