//! Client for the LangSmith-hosted agent (LangGraph server API).
//!
//! An invocation is two calls: create a thread, then run the assistant on it
//! with the formatted event as a human message. Runs either block until the
//! final state (`/runs/wait`) or stream `events` over SSE, in which case the
//! chat model's content chunks are concatenated into the reply.
//!
//! Nothing here retries. Linear redelivers failed webhooks on its own schedule.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::config::{AgentConfig, RunMode};

/// Value of the `X-Auth-Scheme` header expected by LangSmith deployments.
pub const AUTH_SCHEME: &str = "langsmith-api-key";

/// Media type of a streamed run response.
const EVENT_STREAM_MIME: &str = "text/event-stream";

/// LangGraph event carrying incremental chat model output.
const CHAT_MODEL_STREAM_EVENT: &str = "on_chat_model_stream";

/// Errors from the agent service.
///
/// The HTTP layer collapses all of these into one "agent invocation failed"
/// response; the variants exist for logging.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transport failure
    #[error("Agent request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// The call did not finish within the configured bound
    #[error("Agent call timed out")]
    Timeout,

    /// Credentials rejected
    #[error("Agent service rejected credentials ({status})")]
    Unauthorized { status: u16 },

    /// Any other non-success status
    #[error("Agent service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("Malformed agent response: {0}")]
    Malformed(String),

    /// The run reported an error mid-stream
    #[error("Agent stream error: {0}")]
    Stream(String),

    /// Client could not be built from configuration
    #[error("Invalid agent client configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Http(e)
        }
    }
}

/// A message in the run input.
#[derive(Debug, Clone, Serialize)]
pub struct InputMessage {
    #[serde(rename = "type")]
    pub role: &'static str,
    pub content: String,
}

/// Correlation metadata attached to a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub webhook_id: String,
    pub event_type: String,
    pub action: String,
    pub timestamp: String,
}

/// Run input: `{messages: [{type: "human", content}], metadata}`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInput {
    pub messages: Vec<InputMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RunMetadata>,
}

impl AgentInput {
    /// Input holding a single human message.
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            messages: vec![InputMessage {
                role: "human",
                content: content.into(),
            }],
            metadata: None,
        }
    }

    /// Attach run metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Text of the first message.
    #[must_use]
    pub fn content(&self) -> &str {
        self.messages.first().map_or("", |m| m.content.as_str())
    }
}

/// Outcome of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Thread created for this invocation
    pub thread_id: String,
    /// Concatenated reply text
    pub text: String,
}

/// Remote agent operations.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Open a new conversation thread and return its ID.
    async fn create_thread(&self) -> Result<String, AgentError>;

    /// Run the agent on `thread_id` and return the reply text.
    async fn run(&self, thread_id: &str, input: &AgentInput) -> Result<String, AgentError>;
}

/// Create a one-shot thread and run the agent on it.
pub async fn relay_event(
    client: &dyn AgentClient,
    input: &AgentInput,
) -> Result<AgentReply, AgentError> {
    let thread_id = client.create_thread().await?;
    debug!(thread_id = %thread_id, "Created agent thread");

    let text = client.run(&thread_id, input).await?;
    Ok(AgentReply { thread_id, text })
}

/// HTTP client for a LangGraph-compatible agent server.
#[derive(Debug, Clone)]
pub struct LangGraphClient {
    client: reqwest::Client,
    api_url: String,
    agent_id: String,
    run_mode: RunMode,
}

impl LangGraphClient {
    /// Build a client from configuration.
    ///
    /// Every request carries the API key, the auth scheme header and the
    /// configured timeout.
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(&config.api_key)
                .map_err(|_| AgentError::Config("API key is not a valid header value".to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("x-auth-scheme"),
            HeaderValue::from_static(AUTH_SCHEME),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            agent_id: config.agent_id.clone(),
            run_mode: config.run_mode,
        })
    }

    /// Same client, different run mode.
    #[must_use]
    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    /// Create a thread.
    #[instrument(skip(self))]
    pub async fn create_thread(&self) -> Result<String, AgentError> {
        let response = self
            .client
            .post(format!("{}/threads", self.api_url))
            .json(&json!({}))
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        body.get("thread_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| AgentError::Malformed("thread response has no thread_id".to_string()))
    }

    /// Run and block until the final state is available.
    #[instrument(skip(self, input))]
    pub async fn run_wait(&self, thread_id: &str, input: &AgentInput) -> Result<String, AgentError> {
        let response = self
            .client
            .post(format!("{}/threads/{thread_id}/runs/wait", self.api_url))
            .json(&json!({
                "assistant_id": self.agent_id,
                "input": input,
            }))
            .send()
            .await?;
        let state: Value = check_status(response).await?.json().await?;

        if let Some(error) = state.get("__error__") {
            return Err(AgentError::Stream(error.to_string()));
        }
        let messages = state
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AgentError::Malformed(format!("run state has no messages array: {state}"))
            })?;
        Ok(last_message_text(messages).unwrap_or_default())
    }

    /// Start a streaming run and return its content chunks.
    ///
    /// The stream is lazy: chunks are decoded as the response body arrives.
    #[instrument(skip(self, input))]
    pub async fn run_stream(
        &self,
        thread_id: &str,
        input: &AgentInput,
    ) -> Result<impl Stream<Item = Result<String, AgentError>> + Send, AgentError> {
        let response = self
            .client
            .post(format!("{}/threads/{thread_id}/runs/stream", self.api_url))
            .json(&json!({
                "assistant_id": self.agent_id,
                "input": input,
                "stream_mode": "events",
            }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM_MIME) {
            return Err(AgentError::Malformed(format!(
                "expected {EVENT_STREAM_MIME} response, got '{content_type}'"
            )));
        }

        Ok(content_chunks(Box::pin(response.bytes_stream())))
    }
}

#[async_trait]
impl AgentClient for LangGraphClient {
    async fn create_thread(&self) -> Result<String, AgentError> {
        LangGraphClient::create_thread(self).await
    }

    async fn run(&self, thread_id: &str, input: &AgentInput) -> Result<String, AgentError> {
        match self.run_mode {
            RunMode::Wait => self.run_wait(thread_id, input).await,
            RunMode::Stream => {
                let chunks = self.run_stream(thread_id, input).await?;
                let text = collect_reply(chunks).await?;
                debug!(chars = text.len(), "Agent stream completed");
                Ok(text)
            }
        }
    }
}

/// Concatenate a chunk stream into the final reply.
pub async fn collect_reply(
    chunks: impl Stream<Item = Result<String, AgentError>>,
) -> Result<String, AgentError> {
    chunks
        .try_fold(String::new(), |mut acc, chunk| async move {
            acc.push_str(&chunk);
            Ok::<_, AgentError>(acc)
        })
        .await
}

/// Map auth failures and other non-success statuses to errors.
async fn check_status(response: Response) -> Result<Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AgentError::Unauthorized {
            status: status.as_u16(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Text of the last message in a run state.
fn last_message_text(messages: &[Value]) -> Option<String> {
    content_text(messages.last()?.get("content")?)
}

/// Message content is either a string or a list of typed blocks.
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => Some(
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect(),
        ),
        _ => None,
    }
}

// =========================================================================
// Server-sent events
// =========================================================================

/// One decoded SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if any
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a blank line completes a frame, so frames and
/// multi-byte characters may be split across network chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Offset below which the buffer holds no frame terminator.
    scanned: usize,
}

impl SseDecoder {
    /// Feed bytes, returning every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .windows(2)
            .position(|w| w == b"\n\n")
        {
            let end = self.scanned + offset;
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if let Some(event) = parse_frame(&String::from_utf8_lossy(&frame[..end])) {
                events.push(event);
            }
        }
        // A terminator may straddle the next push, so keep the last byte in view.
        self.scanned = self.buffer.len().saturating_sub(1);
        events
    }

    /// Flush a trailing frame not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        parse_frame(&String::from_utf8_lossy(&rest))
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;

    for line in frame.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }

    has_data.then_some(event)
}

/// Extract chat model content from a streamed run event.
fn content_from_event(event: &SseEvent) -> Result<Option<String>, AgentError> {
    match event.event.as_deref() {
        Some("error") => return Err(AgentError::Stream(event.data.clone())),
        Some("end") => return Ok(None),
        _ => {}
    }

    let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
        trace!(data = %event.data, "Skipping non-JSON stream frame");
        return Ok(None);
    };

    if payload.get("event").and_then(Value::as_str) != Some(CHAT_MODEL_STREAM_EVENT) {
        return Ok(None);
    }

    Ok(payload
        .pointer("/data/chunk/content")
        .and_then(content_text)
        .filter(|text| !text.is_empty()))
}

struct ChunkState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    frames: usize,
    done: bool,
}

impl<S> ChunkState<S> {
    fn absorb(&mut self, events: impl IntoIterator<Item = SseEvent>) -> Result<(), AgentError> {
        for event in events {
            self.frames += 1;
            if let Some(chunk) = content_from_event(&event)? {
                self.pending.push_back(chunk);
            }
        }
        Ok(())
    }
}

/// Turn a raw SSE byte stream into the chat model's content chunks.
pub fn content_chunks<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, AgentError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<AgentError>,
{
    let state = ChunkState {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        frames: 0,
        done: false,
    };
    futures::stream::try_unfold(state, next_chunk)
}

async fn next_chunk<S, B, E>(
    mut state: ChunkState<S>,
) -> Result<Option<(String, ChunkState<S>)>, AgentError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<AgentError>,
{
    loop {
        if let Some(chunk) = state.pending.pop_front() {
            return Ok(Some((chunk, state)));
        }
        if state.done {
            return Ok(None);
        }
        match state.bytes.next().await {
            Some(Ok(bytes)) => {
                let events = state.decoder.push(bytes.as_ref());
                state.absorb(events)?;
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                state.done = true;
                let trailing = state.decoder.finish();
                state.absorb(trailing)?;
                if state.frames == 0 {
                    return Err(AgentError::Malformed(
                        "stream ended without any events".to_string(),
                    ));
                }
            }
        }
    }
}
