//! Agent runtime — the lifecycle wrapper every concrete agent is built on.
//!
//! Flow: budget gate → task body (generation/tool calls, metered) →
//! validation → uniform outcome. Errors never escape this module as `Err`;
//! every execution resolves to an `AgentOutcome` carrying a taxonomy kind,
//! duration, cost, and usage.

pub mod context;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::budget::{BudgetGuard, UsageRecord};
use crate::errors::{EngineError, ErrorKind};
use crate::llm_client::{
    strip_json_fences, Generation, GenerationClient, GenerationRequest, TokenUsage,
};
use crate::runtime::context::{CostMeter, ExecutionContext};
use crate::telemetry::SpanHandle;
use crate::tools::{ToolOutcome, ToolRegistry};

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// Immutable per-agent-type configuration.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub default_model: &'static str,
    pub max_retries: u32,
    pub timeout: Duration,
    pub priority: u8,
}

/// Error half of an outcome: taxonomy kind plus the categorized message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The only object that crosses an agent boundary. Cost and usage are always
/// present (zero when unknown) so aggregation never branches.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome<T> {
    pub success: bool,
    pub payload: Option<T>,
    pub error: Option<OutcomeError>,
    pub duration: Duration,
    pub cost_cents: u32,
    pub usage: TokenUsage,
    pub trace_id: Uuid,
}

impl<T> AgentOutcome<T> {
    pub fn succeeded(
        payload: T,
        duration: Duration,
        cost_cents: u32,
        usage: TokenUsage,
        trace_id: Uuid,
    ) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            duration,
            cost_cents,
            usage,
            trace_id,
        }
    }

    pub fn failed(
        kind: ErrorKind,
        message: String,
        duration: Duration,
        cost_cents: u32,
        usage: TokenUsage,
        trace_id: Uuid,
    ) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(OutcomeError { kind, message }),
            duration,
            cost_cents,
            usage,
            trace_id,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Converts the payload type, preserving every other field. A conversion
    /// failure becomes a failed outcome with the error's resolved kind.
    pub fn map_payload<U>(
        self,
        f: impl FnOnce(T) -> Result<U, EngineError>,
    ) -> AgentOutcome<U> {
        let AgentOutcome {
            success,
            payload,
            error,
            duration,
            cost_cents,
            usage,
            trace_id,
        } = self;

        match payload.map(f) {
            Some(Ok(converted)) => AgentOutcome {
                success,
                payload: Some(converted),
                error,
                duration,
                cost_cents,
                usage,
                trace_id,
            },
            Some(Err(e)) => AgentOutcome::failed(
                e.resolved_kind(),
                e.to_string(),
                duration,
                cost_cents,
                usage,
                trace_id,
            ),
            None => AgentOutcome {
                success,
                payload: None,
                error,
                duration,
                cost_cents,
                usage,
                trace_id,
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Phase machine
// ────────────────────────────────────────────────────────────────────────────

/// Execution phases, forward-only. `Planning` is the budget gate;
/// `Validating` runs the task's post-condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    Planning,
    Executing,
    Validating,
    Completed,
    Failed,
}

impl AgentPhase {
    pub fn may_advance_to(self, next: AgentPhase) -> bool {
        use AgentPhase::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Validating)
                | (Executing, Failed)
                | (Validating, Completed)
                | (Validating, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
        )
    }
}

struct PhaseTracker {
    phase: AgentPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: AgentPhase::Idle,
        }
    }

    fn advance(&mut self, next: AgentPhase) {
        debug_assert!(
            self.phase.may_advance_to(next),
            "illegal phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Task seam
// ────────────────────────────────────────────────────────────────────────────

/// Collaborators handed to a task body for one execution. Generation and
/// tool calls made through these helpers are metered and traced; a body that
/// bypasses them loses cost accounting, so don't.
pub struct AgentDeps {
    llm: Arc<dyn GenerationClient>,
    tools: Arc<ToolRegistry>,
    meter: CostMeter,
    span: SpanHandle,
    model: String,
    identity: Uuid,
    correlation_id: Uuid,
}

impl AgentDeps {
    /// A request prefilled with the agent's default model and the caller's
    /// identity/correlation.
    pub fn request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest::new(&self.model, prompt, self.identity)
            .with_correlation(self.correlation_id)
    }

    /// One metered generation call under a child span.
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        let span = self.span.child("generate");
        let result = self.llm.generate(request).await;
        match &result {
            Ok(generation) => {
                self.meter.add(generation.cost_cents, generation.usage);
                span.end(true, generation.cost_cents, Default::default());
            }
            Err(_) => span.end(false, 0, Default::default()),
        }
        result
    }

    /// Metered generation call parsed as JSON. The billed call is metered
    /// even when the payload fails to parse.
    pub async fn generate_json<T: DeserializeOwned>(
        &self,
        request: GenerationRequest,
    ) -> Result<(T, Generation), EngineError> {
        let generation = self.generate(request).await?;
        let text = strip_json_fences(&generation.content);
        let parsed = serde_json::from_str(text)
            .map_err(|e| EngineError::Api(format!("generation returned unparseable JSON: {e}")))?;
        Ok((parsed, generation))
    }

    pub fn meter(&self) -> &CostMeter {
        &self.meter
    }

    /// Tool call under a child span of this execution's span.
    pub async fn invoke_tool(
        &self,
        tool_id: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutcome<Value>, EngineError> {
        self.tools.invoke(tool_id, input, ctx, &self.span).await
    }
}

/// The behavior a concrete agent supplies. Everything else (budget gating,
/// retries, timeout, cancellation, validation, tracing, cost accounting)
/// belongs to the runtime.
#[async_trait]
pub trait AgentTask: Send + Sync {
    type Input: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send;

    fn descriptor(&self) -> &AgentDescriptor;

    async fn execute(
        &self,
        input: &Self::Input,
        deps: &AgentDeps,
        ctx: &ExecutionContext,
    ) -> Result<Self::Output, EngineError>;

    /// Optional post-condition. A failure here yields `ValidationFailed`
    /// even though the computation itself succeeded.
    fn validate(&self, _output: &Self::Output) -> Result<(), EngineError> {
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Runtime
// ────────────────────────────────────────────────────────────────────────────

/// Executes agent tasks under the lifecycle contract.
#[derive(Clone)]
pub struct AgentRuntime {
    budget: BudgetGuard,
    llm: Arc<dyn GenerationClient>,
    tools: Arc<ToolRegistry>,
}

impl AgentRuntime {
    pub fn new(
        budget: BudgetGuard,
        llm: Arc<dyn GenerationClient>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self { budget, llm, tools }
    }

    pub async fn run<T: AgentTask>(
        &self,
        task: &T,
        input: &T::Input,
        ctx: &ExecutionContext,
    ) -> AgentOutcome<T::Output> {
        let descriptor = task.descriptor();
        let started = Instant::now();
        let span = ctx.span(&format!("agent:{}", descriptor.id));
        let trace_id = span.id();
        let mut phase = PhaseTracker::new();

        // Planning: gate on budget before any billed work.
        phase.advance(AgentPhase::Planning);
        match self.budget.check(ctx.identity).await {
            Ok(decision) if !decision.allowed => {
                phase.advance(AgentPhase::Failed);
                let message = decision
                    .message
                    .unwrap_or_else(|| "Monthly usage limit reached.".to_string());
                let outcome = AgentOutcome::failed(
                    ErrorKind::BudgetExceeded,
                    message,
                    started.elapsed(),
                    0,
                    TokenUsage::default(),
                    trace_id,
                );
                span.end(false, 0, Default::default());
                return outcome;
            }
            Err(e) => {
                phase.advance(AgentPhase::Failed);
                let outcome = AgentOutcome::failed(
                    e.resolved_kind(),
                    e.to_string(),
                    started.elapsed(),
                    0,
                    TokenUsage::default(),
                    trace_id,
                );
                span.end(false, 0, Default::default());
                return outcome;
            }
            Ok(decision) => {
                if let Some(message) = decision.message {
                    debug!(agent = descriptor.id, "budget note: {message}");
                }
            }
        }

        phase.advance(AgentPhase::Executing);
        let deps = AgentDeps {
            llm: Arc::clone(&self.llm),
            tools: Arc::clone(&self.tools),
            meter: CostMeter::default(),
            span: span.clone(),
            model: descriptor.default_model.to_string(),
            identity: ctx.identity,
            correlation_id: ctx.correlation_id,
        };

        let result = self
            .execute_with_policy(task, input, &deps, ctx, descriptor)
            .await;

        let (cost_cents, usage) = deps.meter.snapshot();

        let outcome = match result {
            Ok(output) => {
                phase.advance(AgentPhase::Validating);
                match task.validate(&output) {
                    Ok(()) => {
                        phase.advance(AgentPhase::Completed);
                        AgentOutcome::succeeded(
                            output,
                            started.elapsed(),
                            cost_cents,
                            usage,
                            trace_id,
                        )
                    }
                    Err(e) => {
                        phase.advance(AgentPhase::Failed);
                        AgentOutcome::failed(
                            ErrorKind::ValidationFailed,
                            e.to_string(),
                            started.elapsed(),
                            cost_cents,
                            usage,
                            trace_id,
                        )
                    }
                }
            }
            Err(e) => {
                phase.advance(AgentPhase::Failed);
                AgentOutcome::failed(
                    e.resolved_kind(),
                    e.to_string(),
                    started.elapsed(),
                    cost_cents,
                    usage,
                    trace_id,
                )
            }
        };

        // Consumption is consumption: billed failures are recorded too.
        if cost_cents > 0 || usage != TokenUsage::default() {
            self.budget.record(UsageRecord {
                identity: ctx.identity,
                correlation_id: ctx.correlation_id,
                agent_id: descriptor.id.to_string(),
                model: descriptor.default_model.to_string(),
                cost_cents,
                usage,
                occurred_at: Utc::now(),
            });
        }

        let mut span_metadata = ctx.metadata.clone();
        if let Some(error) = &outcome.error {
            span_metadata.insert("error_kind".to_string(), format!("{:?}", error.kind));
        }
        span.end(outcome.success, cost_cents, span_metadata);
        outcome
    }

    /// Task body under timeout, cancellation, and the retry policy.
    /// The descriptor timeout bounds the whole execution including retries;
    /// cancellation wins over everything and is never retried.
    async fn execute_with_policy<T: AgentTask>(
        &self,
        task: &T,
        input: &T::Input,
        deps: &AgentDeps,
        ctx: &ExecutionContext,
        descriptor: &AgentDescriptor,
    ) -> Result<T::Output, EngineError> {
        let attempts = descriptor.max_retries + 1;

        let body = async {
            let mut last_error: Option<EngineError> = None;
            for attempt in 1..=attempts {
                if attempt > 1 {
                    let delay = Duration::from_millis(500 * (1 << (attempt - 2)));
                    warn!(
                        agent = descriptor.id,
                        attempt, "retrying after {}ms", delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }

                match task.execute(input, deps, ctx).await {
                    Ok(output) => return Ok(output),
                    Err(e) => {
                        if e.kind() == ErrorKind::Cancelled || ctx.cancel.is_cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                        if e.resolved_kind().is_retryable() && attempt < attempts {
                            last_error = Some(e);
                            continue;
                        }
                        return Err(e);
                    }
                }
            }
            Err(last_error
                .unwrap_or_else(|| EngineError::Unknown("no attempts executed".to_string())))
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(descriptor.timeout, body) => match result {
                Ok(inner) => inner,
                Err(_) => Err(EngineError::Timeout(descriptor.timeout)),
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Erased dispatch
// ────────────────────────────────────────────────────────────────────────────

/// Type-erased agent for id-based registry dispatch: JSON in, JSON out.
#[async_trait]
pub trait ErasedAgent: Send + Sync {
    fn id(&self) -> &'static str;
    fn descriptor(&self) -> &AgentDescriptor;

    async fn run_value(
        &self,
        runtime: &AgentRuntime,
        input: Value,
        ctx: &ExecutionContext,
    ) -> AgentOutcome<Value>;
}

/// Wraps a typed task for the registry. Input that fails to deserialize is
/// `InvalidInput` without a billed attempt.
pub struct Registered<T>(pub T);

#[async_trait]
impl<T: AgentTask + 'static> ErasedAgent for Registered<T> {
    fn id(&self) -> &'static str {
        self.0.descriptor().id
    }

    fn descriptor(&self) -> &AgentDescriptor {
        self.0.descriptor()
    }

    async fn run_value(
        &self,
        runtime: &AgentRuntime,
        input: Value,
        ctx: &ExecutionContext,
    ) -> AgentOutcome<Value> {
        let parsed: T::Input = match serde_json::from_value(input) {
            Ok(parsed) => parsed,
            Err(e) => {
                return AgentOutcome::failed(
                    ErrorKind::InvalidInput,
                    format!("agent '{}' rejected input: {e}", self.id()),
                    Duration::ZERO,
                    0,
                    TokenUsage::default(),
                    ctx.correlation_id,
                )
            }
        };

        runtime.run(&self.0, &parsed, ctx).await.map_payload(|out| {
            serde_json::to_value(out)
                .map_err(|e| EngineError::Unknown(format!("unserializable agent output: {e}")))
        })
    }
}
