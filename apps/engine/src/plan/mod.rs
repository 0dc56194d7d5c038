//! Plan executor — runs a dependency graph of agent steps with optional and
//! conditional semantics.
//!
//! Scheduling is level-order: each round executes every ready step
//! concurrently, then recomputes readiness. Rounds are strictly sequential;
//! parallelism inside a round never changes which steps become ready next.
//! A required step failing, or its run predicate evaluating false, aborts
//! the plan before any further round starts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::errors::EngineError;
use crate::llm_client::TokenUsage;
use crate::runtime::context::ExecutionContext;
use crate::runtime::{AgentOutcome, AgentRuntime};

// ────────────────────────────────────────────────────────────────────────────
// Plan data model
// ────────────────────────────────────────────────────────────────────────────

/// Accumulated plan state a predicate or input mapping can address:
/// `"input.<field>"` reaches into the initial input, `"<stepId>.<field>"`
/// into a completed step's output. A bare source name yields the whole
/// value. A skipped optional step, or an absent field, resolves to JSON
/// null: a permitted empty value, never an error.
pub struct PlanContext {
    initial: Value,
    outputs: HashMap<String, Option<Value>>,
}

impl PlanContext {
    fn new(initial: Value) -> Self {
        Self {
            initial,
            outputs: HashMap::new(),
        }
    }

    fn record(&mut self, step_id: &str, output: Option<Value>) {
        self.outputs.insert(step_id.to_string(), output);
    }

    pub fn lookup(&self, reference: &str) -> Value {
        let (source, path) = match reference.split_once('.') {
            Some((source, path)) => (source, Some(path)),
            None => (reference, None),
        };

        let base = if source == "input" {
            Some(&self.initial)
        } else {
            self.outputs.get(source).and_then(|o| o.as_ref())
        };

        let Some(mut value) = base else {
            return Value::Null;
        };
        let Some(path) = path else {
            return value.clone();
        };

        for segment in path.split('.') {
            match value.get(segment) {
                Some(inner) => value = inner,
                None => return Value::Null,
            }
        }
        value.clone()
    }
}

/// Run predicate evaluated against the accumulated plan context.
pub type StepPredicate = Arc<dyn Fn(&PlanContext) -> bool + Send + Sync>;

pub struct OrchestrationStep {
    pub id: String,
    pub agent_id: String,
    /// Agent input fields, each resolved from the plan context. An empty
    /// mapping passes the initial input through whole.
    pub input: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub optional: bool,
    pub predicate: Option<StepPredicate>,
}

impl OrchestrationStep {
    pub fn new(id: &str, agent_id: &str) -> Self {
        Self {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            input: BTreeMap::new(),
            depends_on: Vec::new(),
            optional: false,
            predicate: None,
        }
    }

    pub fn with_input(mut self, field: &str, reference: &str) -> Self {
        self.input.insert(field.to_string(), reference.to_string());
        self
    }

    pub fn after(mut self, step_id: &str) -> Self {
        self.depends_on.push(step_id.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn when(
        mut self,
        predicate: impl Fn(&PlanContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

impl fmt::Debug for OrchestrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationStep")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("depends_on", &self.depends_on)
            .field("optional", &self.optional)
            .field("conditional", &self.predicate.is_some())
            .finish()
    }
}

pub struct OrchestrationPlan {
    pub id: String,
    /// Declarative only; execution order comes from `depends_on`.
    pub steps: Vec<OrchestrationStep>,
    pub timeout: Duration,
}

impl OrchestrationPlan {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            steps: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_step(mut self, step: OrchestrationStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
pub struct OrchestrationResult {
    pub plan_id: String,
    /// True iff no required step failed.
    pub success: bool,
    pub step_outcomes: HashMap<String, AgentOutcome<Value>>,
    /// Optional steps whose predicate evaluated false.
    pub skipped: Vec<String>,
    pub total_cost_cents: u32,
    pub total_usage: TokenUsage,
    pub duration: Duration,
    pub trace_id: Uuid,
}

// ────────────────────────────────────────────────────────────────────────────
// Executor
// ────────────────────────────────────────────────────────────────────────────

pub struct PlanExecutor {
    runtime: AgentRuntime,
    registry: Arc<AgentRegistry>,
}

impl PlanExecutor {
    pub fn new(runtime: AgentRuntime, registry: Arc<AgentRegistry>) -> Self {
        Self { runtime, registry }
    }

    /// Runs a plan to completion, abort, timeout, or cancellation.
    ///
    /// Configuration errors (duplicate step ids, dangling prerequisites,
    /// unknown agent ids) surface as `Err` before any step runs; step
    /// failures are recorded inside the `OrchestrationResult`.
    pub async fn execute(
        &self,
        plan: &OrchestrationPlan,
        initial: Value,
        ctx: &ExecutionContext,
    ) -> Result<OrchestrationResult, EngineError> {
        self.validate(plan)?;

        let span = ctx.span(&format!("plan:{}", plan.id));
        let trace_id = span.id();
        let started = Instant::now();

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled),
            inner = tokio::time::timeout(
                plan.timeout,
                self.run_rounds(plan, initial, ctx, trace_id),
            ) => match inner {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(plan.timeout)),
            },
        };

        match result {
            Ok(mut result) => {
                result.duration = started.elapsed();
                span.end(result.success, result.total_cost_cents, Default::default());
                Ok(result)
            }
            Err(e) => {
                span.end(false, 0, Default::default());
                Err(e)
            }
        }
    }

    fn validate(&self, plan: &OrchestrationPlan) -> Result<(), EngineError> {
        let mut ids = HashSet::new();
        for step in &plan.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "plan '{}' declares step '{}' twice",
                    plan.id, step.id
                )));
            }
            if !self.registry.contains(&step.agent_id) {
                return Err(EngineError::InvalidInput(format!(
                    "step '{}' references unknown agent '{}'",
                    step.id, step.agent_id
                )));
            }
        }
        for step in &plan.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::InvalidInput(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run_rounds(
        &self,
        plan: &OrchestrationPlan,
        initial: Value,
        ctx: &ExecutionContext,
        trace_id: Uuid,
    ) -> Result<OrchestrationResult, EngineError> {
        let mut context = PlanContext::new(initial);
        let mut completed: HashSet<String> = HashSet::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut step_outcomes: HashMap<String, AgentOutcome<Value>> = HashMap::new();
        let mut aborted = false;

        while completed.len() < plan.steps.len() && !aborted {
            let mut ready: Vec<&OrchestrationStep> = plan
                .steps
                .iter()
                .filter(|s| {
                    !completed.contains(&s.id)
                        && s.depends_on.iter().all(|d| completed.contains(d))
                })
                .collect();
            // Higher-priority agents dispatch first within a round; stable,
            // so declaration order breaks ties.
            ready.sort_by_key(|s| {
                std::cmp::Reverse(
                    self.registry
                        .get(&s.agent_id)
                        .map(|a| a.descriptor().priority)
                        .unwrap_or(0),
                )
            });

            if ready.is_empty() {
                let stuck: Vec<&str> = plan
                    .steps
                    .iter()
                    .filter(|s| !completed.contains(&s.id))
                    .map(|s| s.id.as_str())
                    .collect();
                return Err(EngineError::InvalidInput(format!(
                    "plan '{}' has a circular dependency among steps: {}",
                    plan.id,
                    stuck.join(", ")
                )));
            }

            // Predicates before execution: a false predicate on a required
            // step aborts the plan before anything in this round runs.
            let mut to_run: Vec<&OrchestrationStep> = Vec::new();
            for step in ready {
                let should_run = step
                    .predicate
                    .as_ref()
                    .map(|predicate| predicate(&context))
                    .unwrap_or(true);

                if should_run {
                    to_run.push(step);
                } else if step.optional {
                    debug!(plan = %plan.id, step = %step.id, "optional step skipped by predicate");
                    completed.insert(step.id.clone());
                    context.record(&step.id, None);
                    skipped.push(step.id.clone());
                } else {
                    warn!(plan = %plan.id, step = %step.id, "required step predicate false, aborting plan");
                    step_outcomes.insert(
                        step.id.clone(),
                        AgentOutcome::failed(
                            crate::errors::ErrorKind::ValidationFailed,
                            format!("run predicate evaluated false for required step '{}'", step.id),
                            Duration::ZERO,
                            0,
                            TokenUsage::default(),
                            trace_id,
                        ),
                    );
                    aborted = true;
                    break;
                }
            }

            if aborted {
                break;
            }

            // Inputs are resolved against the context as it stood when the
            // round started; outcomes land only after the whole round.
            let prepared: Vec<_> = to_run
                .iter()
                .map(|step| {
                    let agent = self
                        .registry
                        .get(&step.agent_id)
                        .expect("agent presence validated before execution");
                    (*step, agent, resolve_input(step, &context))
                })
                .collect();

            let runtime = &self.runtime;
            let round = prepared.into_iter().map(|(step, agent, input)| async move {
                let outcome = agent.run_value(runtime, input, ctx).await;
                (step, outcome)
            });

            for (step, outcome) in join_all(round).await {
                completed.insert(step.id.clone());
                if outcome.success {
                    context.record(&step.id, outcome.payload.clone());
                } else {
                    context.record(&step.id, None);
                    if step.optional {
                        warn!(
                            plan = %plan.id,
                            step = %step.id,
                            "optional step failed, continuing"
                        );
                    } else {
                        aborted = true;
                    }
                }
                step_outcomes.insert(step.id.clone(), outcome);
            }
        }

        let total_cost_cents = step_outcomes.values().map(|o| o.cost_cents).sum();
        let mut total_usage = TokenUsage::default();
        for outcome in step_outcomes.values() {
            total_usage.add(outcome.usage);
        }

        Ok(OrchestrationResult {
            plan_id: plan.id.clone(),
            success: !aborted,
            step_outcomes,
            skipped,
            total_cost_cents,
            total_usage,
            duration: Duration::ZERO, // stamped by execute()
            trace_id,
        })
    }
}

/// Builds a step's agent input from its declared mapping. An empty mapping
/// passes the initial input through unchanged.
fn resolve_input(step: &OrchestrationStep, context: &PlanContext) -> Value {
    if step.input.is_empty() {
        return context.lookup("input");
    }
    let mut object = serde_json::Map::new();
    for (field, reference) in &step.input {
        object.insert(field.clone(), context.lookup(reference));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetGuard, BudgetStore, InMemoryBudgetStore};
    use crate::errors::ErrorKind;
    use crate::llm_client::testing::StaticGenerationClient;
    use crate::runtime::{AgentDeps, AgentDescriptor, AgentTask, Registered};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use serde_json::json;

    /// Echoes its input under "received"; fails when the descriptor says so.
    struct StubTask {
        descriptor: AgentDescriptor,
        fail: bool,
    }

    fn stub_descriptor(id: &'static str) -> AgentDescriptor {
        AgentDescriptor {
            id,
            name: "Stub",
            default_model: "test-model",
            max_retries: 0,
            timeout: Duration::from_secs(5),
            priority: 5,
        }
    }

    #[async_trait]
    impl AgentTask for StubTask {
        type Input = Value;
        type Output = Value;

        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn execute(
            &self,
            input: &Value,
            _deps: &AgentDeps,
            _ctx: &ExecutionContext,
        ) -> Result<Value, EngineError> {
            if self.fail {
                return Err(EngineError::Unknown("stub induced failure".to_string()));
            }
            Ok(json!({ "agent": self.descriptor.id, "received": input }))
        }
    }

    fn executor() -> PlanExecutor {
        let store = Arc::new(InMemoryBudgetStore::new());
        let runtime = AgentRuntime::new(
            BudgetGuard::new(store as Arc<dyn BudgetStore>),
            Arc::new(StaticGenerationClient::new()),
            Arc::new(ToolRegistry::new()),
        );

        let mut registry = AgentRegistry::new();
        registry
            .register(Arc::new(Registered(StubTask {
                descriptor: stub_descriptor("ok"),
                fail: false,
            })))
            .unwrap();
        registry
            .register(Arc::new(Registered(StubTask {
                descriptor: stub_descriptor("failing"),
                fail: true,
            })))
            .unwrap();

        PlanExecutor::new(runtime, Arc::new(registry))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_acyclic_chain_completes_every_step() {
        let plan = OrchestrationPlan::new("chain")
            .with_step(OrchestrationStep::new("a", "ok"))
            .with_step(OrchestrationStep::new("b", "ok").after("a"))
            .with_step(OrchestrationStep::new("c", "ok").after("b"));

        let result = executor()
            .execute(&plan, json!({"seed": 1}), &ctx())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.step_outcomes.len(), 3);
        assert!(result.step_outcomes.values().all(|o| o.success));
        assert!(result.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_required_failure_aborts_before_downstream_steps() {
        let plan = OrchestrationPlan::new("abort")
            .with_step(OrchestrationStep::new("a", "ok"))
            .with_step(OrchestrationStep::new("b", "failing").after("a"))
            .with_step(OrchestrationStep::new("c", "ok").after("b"));

        let result = executor().execute(&plan, json!({}), &ctx()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.step_outcomes.len(), 2, "c must never execute");
        assert!(result.step_outcomes["a"].success);
        assert!(!result.step_outcomes["b"].success);
        assert!(!result.step_outcomes.contains_key("c"));
    }

    #[tokio::test]
    async fn test_optional_failure_continues() {
        let plan = OrchestrationPlan::new("tolerant")
            .with_step(OrchestrationStep::new("a", "failing").optional())
            .with_step(OrchestrationStep::new("b", "ok").after("a"));

        let result = executor().execute(&plan, json!({}), &ctx()).await.unwrap();

        assert!(result.success);
        assert!(!result.step_outcomes["a"].success);
        assert!(result.step_outcomes["b"].success);
    }

    #[tokio::test]
    async fn test_cycle_is_a_circular_dependency_error() {
        let plan = OrchestrationPlan::new("cycle")
            .with_step(OrchestrationStep::new("a", "ok").after("b"))
            .with_step(OrchestrationStep::new("b", "ok").after("a"));

        let err = executor().execute(&plan, json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("circular"));
    }

    #[tokio::test]
    async fn test_dangling_prerequisite_is_a_configuration_error() {
        let plan = OrchestrationPlan::new("dangling")
            .with_step(OrchestrationStep::new("a", "ok").after("ghost"));

        let err = executor().execute(&plan, json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_a_configuration_error() {
        let plan =
            OrchestrationPlan::new("ghost-agent").with_step(OrchestrationStep::new("a", "nope"));

        let err = executor().execute(&plan, json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_skipped_optional_output_resolves_to_null() {
        let plan = OrchestrationPlan::new("skip")
            .with_step(OrchestrationStep::new("a", "ok"))
            .with_step(
                OrchestrationStep::new("b", "ok")
                    .after("a")
                    .optional()
                    .when(|_| false),
            )
            .with_step(
                OrchestrationStep::new("c", "ok")
                    .after("b")
                    .with_input("from_b", "b.agent")
                    .with_input("seed", "input.seed"),
            );

        let result = executor()
            .execute(&plan, json!({"seed": 7}), &ctx())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.skipped, vec!["b".to_string()]);
        let c_input = &result.step_outcomes["c"].payload.as_ref().unwrap()["received"];
        assert_eq!(c_input["from_b"], Value::Null);
        assert_eq!(c_input["seed"], json!(7));
    }

    #[tokio::test]
    async fn test_required_predicate_false_aborts_plan() {
        let plan = OrchestrationPlan::new("gate")
            .with_step(OrchestrationStep::new("a", "ok"))
            .with_step(
                OrchestrationStep::new("b", "ok")
                    .after("a")
                    .when(|context| context.lookup("input.go") == json!(true)),
            )
            .with_step(OrchestrationStep::new("c", "ok").after("b"));

        let result = executor()
            .execute(&plan, json!({"go": false}), &ctx())
            .await
            .unwrap();

        assert!(!result.success);
        assert!(!result.step_outcomes.contains_key("c"));
        assert_eq!(
            result.step_outcomes["b"].error_kind(),
            Some(ErrorKind::ValidationFailed)
        );
    }

    #[tokio::test]
    async fn test_independent_steps_share_a_round() {
        let plan = OrchestrationPlan::new("fanout")
            .with_step(OrchestrationStep::new("left", "ok"))
            .with_step(OrchestrationStep::new("right", "ok"))
            .with_step(
                OrchestrationStep::new("join", "ok")
                    .after("left")
                    .after("right")
                    .with_input("l", "left.agent")
                    .with_input("r", "right.agent"),
            );

        let result = executor().execute(&plan, json!({}), &ctx()).await.unwrap();
        assert!(result.success);
        let join_input = &result.step_outcomes["join"].payload.as_ref().unwrap()["received"];
        assert_eq!(join_input["l"], json!("ok"));
        assert_eq!(join_input["r"], json!("ok"));
    }

    #[tokio::test]
    async fn test_duplicate_step_id_rejected() {
        let plan = OrchestrationPlan::new("dup")
            .with_step(OrchestrationStep::new("a", "ok"))
            .with_step(OrchestrationStep::new("a", "ok"));

        let err = executor().execute(&plan, json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_cancelled_context_surfaces_as_cancelled() {
        let plan =
            OrchestrationPlan::new("cancel").with_step(OrchestrationStep::new("a", "ok"));
        let ctx = ctx();
        ctx.cancel.cancel();

        let err = executor().execute(&plan, json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
