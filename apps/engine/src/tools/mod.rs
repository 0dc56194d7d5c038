//! Tool invocation — named capabilities wrapped with tracing and error
//! translation.
//!
//! A tool-reported failure and a returned error are treated identically:
//! both become `ToolFailed` and abort the enclosing step unless the agent
//! handles the error itself. An unknown tool id is a programming error
//! (`InvalidInput`), kept distinct from a runtime tool failure.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::errors::EngineError;
use crate::runtime::context::ExecutionContext;
use crate::telemetry::SpanHandle;

/// Result envelope for one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome<T> {
    pub success: bool,
    pub payload: Option<T>,
    pub error: Option<String>,
    pub cache_hit: bool,
    pub duration: Duration,
}

impl<T> ToolOutcome<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            cache_hit: false,
            duration: Duration::ZERO,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(message.to_string()),
            cache_hit: false,
            duration: Duration::ZERO,
        }
    }

    pub fn cached(mut self) -> Self {
        self.cache_hit = true;
        self
    }
}

/// A named reusable capability with a declared input/output contract.
/// The engine is agnostic to tool internals.
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;

    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutcome<Value>, EngineError>;
}

/// Id-based tool lookup built once at startup and dependency-injected.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), EngineError> {
        let id = tool.id().to_string();
        if id.trim().is_empty() {
            return Err(EngineError::InvalidInput("tool id is empty".to_string()));
        }
        if self.tools.contains_key(&id) {
            return Err(EngineError::InvalidInput(format!(
                "tool id '{id}' registered twice"
            )));
        }
        self.tools.insert(id, tool);
        Ok(())
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Invokes a tool under a child span of `parent`.
    ///
    /// Returns `Ok` only for a successful outcome; a failed outcome is
    /// folded into `ToolFailed` so callers cannot silently ignore it.
    pub async fn invoke(
        &self,
        tool_id: &str,
        input: Value,
        ctx: &ExecutionContext,
        parent: &SpanHandle,
    ) -> Result<ToolOutcome<Value>, EngineError> {
        let tool = self.tools.get(tool_id).ok_or_else(|| {
            EngineError::InvalidInput(format!("unknown tool id '{tool_id}'"))
        })?;

        let span = parent.child(&format!("tool:{tool_id}"));
        let started = Instant::now();

        let result = tool.execute(input, ctx).await;
        let duration = started.elapsed();

        match result {
            Ok(mut outcome) if outcome.success => {
                outcome.duration = duration;
                debug!(tool = tool_id, cache_hit = outcome.cache_hit, "tool call succeeded");
                let mut metadata = BTreeMap::new();
                metadata.insert("cache_hit".to_string(), outcome.cache_hit.to_string());
                span.end(true, 0, metadata);
                Ok(outcome)
            }
            Ok(outcome) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "tool reported failure without a message".to_string());
                span.end(false, 0, BTreeMap::new());
                Err(EngineError::ToolFailed {
                    tool_id: tool_id.to_string(),
                    message,
                })
            }
            Err(e) => {
                span.end(false, 0, BTreeMap::new());
                Err(EngineError::ToolFailed {
                    tool_id: tool_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}
