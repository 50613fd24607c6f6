pub mod parser;
pub mod prompts;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::indicators::TechnicalSnapshot;
use crate::kalman::Prediction;
use crate::types::{EntryVerdict, PositionSnapshot, PositionVerdict, Ticker};

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reasoning deadline of {0:?} exceeded")]
    Deadline(Duration),
    #[error("reasoning reply had no content")]
    EmptyReply,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Adapter to an OpenAI-compatible chat-completions endpoint. Owns prompt
/// dispatch, deadline enforcement and response validation; callers only
/// ever see a clipped verdict.
#[derive(Debug, Clone)]
pub struct ReasoningClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    deadline: Duration,
}

impl ReasoningClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, deadline: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            deadline,
        }
    }

    /// Entry analysis. Transport failures, deadlines and unparseable output
    /// all degrade to a conservative HOLD instead of raising.
    pub async fn analyze_entry(&self, prompt: &str) -> EntryVerdict {
        match self.chat(prompt).await {
            Ok(reply) => parser::parse_entry(&reply),
            Err(e) => {
                warn!(error = %e, "entry analysis failed, holding");
                EntryVerdict::hold(format!("reasoning unavailable: {e}"))
            }
        }
    }

    /// Position management analysis; assembles the side-conditional prompt
    /// and degrades to HOLD like `analyze_entry`.
    pub async fn analyze_position(
        &self,
        position: &PositionSnapshot,
        ticker: &Ticker,
        indicators: &TechnicalSnapshot,
        prediction: &Prediction,
        hours_in_position: f64,
    ) -> PositionVerdict {
        let prompt =
            prompts::position_prompt(position, ticker, indicators, prediction, hours_in_position);
        match self.chat(&prompt).await {
            Ok(reply) => parser::parse_position(&reply),
            Err(e) => {
                warn!(error = %e, "position analysis failed, holding");
                PositionVerdict::hold(format!("reasoning unavailable: {e}"))
            }
        }
    }

    pub async fn health(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match tokio::time::timeout(Duration::from_secs(5), self.http.get(&url).send()).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            _ => false,
        }
    }

    async fn chat(&self, prompt: &str) -> Result<String, ReasoningError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            // Deterministic responses
            temperature: 0.0,
            stream: false,
        };

        let send = async {
            let resp = self
                .http
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?;
            let body: ChatResponse = resp.json().await?;
            Ok::<_, ReasoningError>(body)
        };

        let body = tokio::time::timeout(self.deadline, send)
            .await
            .map_err(|_| ReasoningError::Deadline(self.deadline))??;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ReasoningError::EmptyReply)
    }
}
