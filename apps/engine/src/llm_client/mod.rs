//! Generation client — the single point of entry for all text-generation
//! calls in the engine.
//!
//! ARCHITECTURAL RULE: No other module may talk to the generation backend
//! directly. Agents receive the client through `AgentDeps` and every call is
//! metered there.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::EngineError;

const API_VERSION_HEADER: &str = "2023-06-01";
/// Default model for agents that do not override it in their descriptor.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_RETRIES: u32 = 3;

// Billing rates in cents per million tokens. Kept here so cost lands on the
// outcome even when the backend omits it.
const INPUT_COST_CENTS_PER_MTOK: u64 = 300;
const OUTPUT_COST_CENTS_PER_MTOK: u64 = 1500;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// Token counts for one generation call. Always present on outcomes, zero
/// when unknown, so callers can sum without branching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One generation call, fully specified by the caller.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub identity: Uuid,
    pub correlation_id: Option<Uuid>,
}

impl GenerationRequest {
    pub fn new(model: &str, prompt: String, identity: Uuid) -> Self {
        Self {
            model: model.to_string(),
            system: None,
            prompt,
            max_tokens: 4096,
            temperature: 0.2,
            identity,
            correlation_id: None,
        }
    }

    pub fn with_system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Terminal result of a generation call, streaming or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_cents: u32,
    pub cached: bool,
}

/// A finite, cancellable sequence of text chunks plus the terminal summary.
/// Dropping the stream aborts the underlying call at the next chunk.
pub struct GenerationStream {
    chunks: mpsc::Receiver<String>,
    completion: oneshot::Receiver<Result<Generation, EngineError>>,
}

impl GenerationStream {
    pub fn new(
        chunks: mpsc::Receiver<String>,
        completion: oneshot::Receiver<Result<Generation, EngineError>>,
    ) -> Self {
        Self { chunks, completion }
    }

    /// Next incremental text chunk; `None` once the stream is exhausted.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Drains any remaining chunks and resolves to the final result.
    pub async fn finish(mut self) -> Result<Generation, EngineError> {
        while self.chunks.recv().await.is_some() {}
        self.completion
            .await
            .map_err(|_| EngineError::Api("generation stream ended without a result".to_string()))?
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Client trait
// ────────────────────────────────────────────────────────────────────────────

/// The generation backend seam. Implement to swap backends without touching
/// agent code; `AgentDeps` carries this as `Arc<dyn GenerationClient>`.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError>;

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationStream, EngineError>;
}

/// Calls the backend and deserializes the text response as JSON.
/// The prompt must instruct the model to return valid JSON.
pub async fn generate_json<T: DeserializeOwned>(
    client: &dyn GenerationClient,
    request: GenerationRequest,
) -> Result<(T, Generation), EngineError> {
    let generation = client.generate(request).await?;
    let text = strip_json_fences(&generation.content);
    let parsed = serde_json::from_str(text)
        .map_err(|e| EngineError::Api(format!("generation returned unparseable JSON: {e}")))?;
    Ok((parsed, generation))
}

pub fn compute_cost_cents(usage: TokenUsage) -> u32 {
    let raw = u64::from(usage.input_tokens) * INPUT_COST_CENTS_PER_MTOK
        + u64::from(usage.output_tokens) * OUTPUT_COST_CENTS_PER_MTOK;
    // Round up: a billed call never costs zero.
    (raw.div_ceil(1_000_000)) as u32
}

// ────────────────────────────────────────────────────────────────────────────
// HTTP client
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: String,
}

/// HTTP implementation of `GenerationClient`.
/// Retries on 429 and 5xx with exponential backoff; other non-success
/// statuses fail immediately with the parsed upstream message.
#[derive(Clone)]
pub struct HttpGenerationClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpGenerationClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .expect("Failed to build HTTP client"),
            base_url,
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    async fn call_once(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, EngineError> {
        let body = WireRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.as_deref(),
            messages: vec![WireMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream,
        };

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION_HEADER)
            .header("content-type", "application/json");
        if let Some(correlation) = request.correlation_id {
            builder = builder.header("x-correlation-id", correlation.to_string());
        }

        Ok(builder.json(&body).send().await?)
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        let mut last_error: Option<EngineError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "generation attempt {} failed, retrying after {}ms",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self.call_once(&request, false).await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("generation backend returned {}: {}", status, body);
                last_error = Some(if status.as_u16() == 429 {
                    EngineError::RateLimited(body)
                } else {
                    EngineError::Api(format!("status {status}: {body}"))
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<WireError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(EngineError::Api(format!("status {status}: {message}")));
            }

            let wire: WireResponse = response
                .json()
                .await
                .map_err(|e| EngineError::Api(format!("malformed generation response: {e}")))?;

            let content = wire
                .content
                .iter()
                .find(|b| b.block_type == "text")
                .and_then(|b| b.text.clone())
                .ok_or_else(|| EngineError::Api("generation returned empty content".to_string()))?;

            let usage = TokenUsage {
                input_tokens: wire.usage.input_tokens,
                output_tokens: wire.usage.output_tokens,
            };

            debug!(
                "generation call succeeded: input_tokens={}, output_tokens={}",
                usage.input_tokens, usage.output_tokens
            );

            return Ok(Generation {
                content,
                model: wire.model,
                cost_cents: compute_cost_cents(usage),
                usage,
                cached: false,
            });
        }

        Err(last_error
            .unwrap_or_else(|| EngineError::RateLimited(format!("after {MAX_RETRIES} retries"))))
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationStream, EngineError> {
        let response = self.call_once(&request, true).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!("status {status}: {body}")));
        }

        let (chunk_tx, chunk_rx) = mpsc::channel::<String>(32);
        let (done_tx, done_rx) = oneshot::channel();
        let model = request.model.clone();

        tokio::spawn(async move {
            let result = drive_sse(response, &chunk_tx, model).await;
            let _ = done_tx.send(result);
        });

        Ok(GenerationStream::new(chunk_rx, done_rx))
    }
}

/// Consumes the SSE body line by line, forwarding text deltas and
/// accumulating usage into the terminal `Generation`.
async fn drive_sse(
    response: reqwest::Response,
    chunk_tx: &mpsc::Sender<String>,
    model: String,
) -> Result<Generation, EngineError> {
    #[derive(Deserialize)]
    struct SseEvent {
        #[serde(rename = "type")]
        event_type: String,
        #[serde(default)]
        delta: Option<SseDelta>,
        #[serde(default)]
        message: Option<SseMessage>,
        #[serde(default)]
        usage: Option<WireUsage>,
    }
    #[derive(Deserialize)]
    struct SseDelta {
        #[serde(default)]
        text: Option<String>,
    }
    #[derive(Deserialize)]
    struct SseMessage {
        #[serde(default)]
        usage: Option<WireUsage>,
    }

    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    let mut content = String::new();
    let mut usage = TokenUsage::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| EngineError::Api(format!("stream read failed: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Process complete SSE lines; a partial line stays in the buffer.
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end().to_string();
            buffer.drain(..=newline);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<SseEvent>(data) else {
                continue;
            };

            match event.event_type.as_str() {
                "message_start" => {
                    if let Some(u) = event.message.and_then(|m| m.usage) {
                        usage.input_tokens = u.input_tokens;
                    }
                }
                "content_block_delta" => {
                    if let Some(text) = event.delta.and_then(|d| d.text) {
                        content.push_str(&text);
                        // Receiver dropped means the caller cancelled.
                        if chunk_tx.send(text).await.is_err() {
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
                "message_delta" => {
                    if let Some(u) = event.usage {
                        usage.output_tokens = u.output_tokens;
                    }
                }
                "message_stop" => {
                    return Ok(Generation {
                        content,
                        model,
                        cost_cents: compute_cost_cents(usage),
                        usage,
                        cached: false,
                    });
                }
                _ => {}
            }
        }
    }

    // Stream ended without message_stop; return what was accumulated.
    Ok(Generation {
        content,
        model,
        cost_cents: compute_cost_cents(usage),
        usage,
        cached: false,
    })
}

/// Strips ```json ... ``` or ``` ... ``` code fences from generation output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Test support
// ────────────────────────────────────────────────────────────────────────────

/// Canned-response client used by inline tests across the crate.
/// Responses are consumed front to back; an exhausted queue fails the call.
pub mod testing {
    use super::*;

    pub struct StaticGenerationClient {
        responses: Mutex<VecDeque<Result<String, EngineError>>>,
        calls: AtomicUsize,
        cost_cents: u32,
    }

    impl StaticGenerationClient {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                cost_cents: 2,
            }
        }

        pub fn with_cost(mut self, cost_cents: u32) -> Self {
            self.cost_cents = cost_cents;
            self
        }

        pub fn push_text(&self, text: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(text.to_string()));
        }

        pub fn push_error(&self, error: EngineError) {
            self.responses.lock().unwrap().push_back(Err(error));
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Default for StaticGenerationClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl GenerationClient for StaticGenerationClient {
        async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => Ok(Generation {
                    content,
                    model: request.model,
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 20,
                    },
                    cost_cents: self.cost_cents,
                    cached: false,
                }),
                Some(Err(e)) => Err(e),
                None => Err(EngineError::Api("no canned response queued".to_string())),
            }
        }

        async fn generate_stream(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationStream, EngineError> {
            let generation = self.generate(request).await?;
            let (chunk_tx, chunk_rx) = mpsc::channel(8);
            let (done_tx, done_rx) = oneshot::channel();

            // Split the canned content into two chunks to exercise consumers.
            let content = generation.content.clone();
            let mid = content.len() / 2;
            let midpoint = content
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= mid)
                .last()
                .unwrap_or(0);
            let (head, tail) = content.split_at(midpoint);
            if !head.is_empty() {
                let _ = chunk_tx.send(head.to_string()).await;
            }
            if !tail.is_empty() {
                let _ = chunk_tx.send(tail.to_string()).await;
            }
            drop(chunk_tx);
            let _ = done_tx.send(Ok(generation));
            Ok(GenerationStream::new(chunk_rx, done_rx))
        }
    }
}
