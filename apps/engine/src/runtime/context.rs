//! Execution context and per-execution cost metering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::llm_client::TokenUsage;
use crate::telemetry::{LogCollector, SpanHandle, TraceCollector};

/// Everything a logical operation carries through the engine: caller
/// identity, correlation, cancellation, tracing, and free-form metadata.
///
/// Created once per logical operation and passed by reference; the engine
/// never mutates a context after construction.
#[derive(Clone)]
pub struct ExecutionContext {
    pub identity: Uuid,
    pub correlation_id: Uuid,
    pub cancel: CancellationToken,
    pub tracer: Arc<dyn TraceCollector>,
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(identity: Uuid) -> Self {
        Self {
            identity,
            correlation_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            tracer: Arc::new(LogCollector),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TraceCollector>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Opens a root span under this operation's correlation id.
    pub fn span(&self, name: &str) -> SpanHandle {
        SpanHandle::root(Arc::clone(&self.tracer), name, self.correlation_id)
    }
}

/// Accumulates cost and token usage across the generation and tool calls of
/// one agent execution. Atomics because calls within one execution may run
/// application-parallel.
#[derive(Default)]
pub struct CostMeter {
    cost_cents: AtomicU32,
    input_tokens: AtomicU32,
    output_tokens: AtomicU32,
}

impl CostMeter {
    pub fn add(&self, cost_cents: u32, usage: TokenUsage) {
        self.cost_cents.fetch_add(cost_cents, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u32, TokenUsage) {
        (
            self.cost_cents.load(Ordering::Relaxed),
            TokenUsage {
                input_tokens: self.input_tokens.load(Ordering::Relaxed),
                output_tokens: self.output_tokens.load(Ordering::Relaxed),
            },
        )
    }
}
