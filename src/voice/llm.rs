//! Streaming chat completions against an OpenAI-compatible API
//!
//! The response is Server-Sent Events; each `data:` line carries one delta
//! and the literal `[DONE]` ends the stream.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::gateway::{GenerationError, Generator, TokenStream};
use crate::session::Turn;
use crate::{Error, Result};

const DONE_SENTINEL: &str = "[DONE]";

/// Tokens buffered between the reader task and the turn
const TOKEN_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaContent,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaContent {
    content: Option<String>,
}

/// One parsed SSE line
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    /// Text delta
    Token(String),
    /// End-of-stream sentinel
    Done,
    /// Blank line, comment, non-data field or empty delta
    Skip,
}

/// Parse one SSE line from a chat completions stream
///
/// # Errors
///
/// Returns error if a `data:` payload is not a valid delta
pub fn parse_sse_line(line: &str) -> std::result::Result<SseLine, GenerationError> {
    let line = line.trim_end();
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return Ok(SseLine::Skip);
    };

    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    if payload == DONE_SENTINEL {
        return Ok(SseLine::Done);
    }

    let delta: StreamDelta = serde_json::from_str(payload)
        .map_err(|e| GenerationError::Failed(format!("failed to parse SSE delta: {e}")))?;

    Ok(delta
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty())
        .map_or(SseLine::Skip, SseLine::Token))
}

/// Generator backed by `POST {base_url}/chat/completions`
#[derive(Clone)]
pub struct ChatCompletions {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ChatCompletions {
    /// Create a generator for an OpenAI-compatible endpoint
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(base_url: String, api_key: String, model: String, max_tokens: u32) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("API key required for chat completions".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_tokens,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request<'a>(&'a self, history: &'a [Turn]) -> ChatRequest<'a> {
        let messages = history
            .iter()
            .filter(|t| !t.text.is_empty())
            .map(|t| ChatMessage {
                role: t.role.as_str(),
                content: &t.text,
            })
            .collect();

        ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            stream: true,
        }
    }
}

#[async_trait]
impl Generator for ChatCompletions {
    async fn generate(
        &self,
        history: &[Turn],
        cancel: CancellationToken,
    ) -> std::result::Result<TokenStream, GenerationError> {
        let request = self.build_request(history);
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            "sending streaming chat completion request"
        );

        let send = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::Cancelled),
            response = send => response.map_err(|e| GenerationError::Failed(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat completions error");
            return Err(GenerationError::Failed(format!("HTTP {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(read_sse(response, tx, cancel));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Forward tokens from an SSE body until `[DONE]`, end of body or cancellation
async fn read_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<std::result::Result<String, GenerationError>>,
    cancel: CancellationToken,
) {
    let mut body = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    let mut tokens = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(tokens, "generation cancelled");
                return;
            }
            next = body.next() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx
                    .send(Err(GenerationError::Failed(format!("stream read error: {e}"))))
                    .await;
                return;
            }
            None => break,
        };

        pending.extend_from_slice(&bytes);
        while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=newline).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                Ok(SseLine::Token(token)) => {
                    tokens += 1;
                    if tx.send(Ok(token)).await.is_err() {
                        tracing::debug!("token receiver dropped, stopping");
                        return;
                    }
                }
                Ok(SseLine::Done) => {
                    tracing::debug!(tokens, "generation complete");
                    return;
                }
                Ok(SseLine::Skip) => {}
                Err(e) => tracing::warn!(error = %e, "SSE parse error, skipping line"),
            }
        }
    }

    if let Ok(SseLine::Token(token)) = parse_sse_line(&String::from_utf8_lossy(&pending)) {
        let _ = tx.send(Ok(token)).await;
    }
    tracing::debug!(tokens, "generation stream ended");
}
