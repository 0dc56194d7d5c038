//! Lodestone — an orchestration engine for bounded agent tasks over an
//! external text-generation service.
//!
//! The reusable control layer lives here: the budget-gated agent runtime,
//! the tool invoker, a dependency-graph plan executor, and a
//! bounded-concurrency batch matcher. The algorithmic core is the pure
//! compatibility scorer in [`matching`]; the concrete agents in [`agents`]
//! wrap it and the generation backend behind the uniform
//! [`runtime::AgentOutcome`] envelope.

pub mod agents;
pub mod batch;
pub mod budget;
pub mod config;
pub mod db;
pub mod errors;
pub mod llm_client;
pub mod matching;
pub mod plan;
pub mod pool;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod tools;

pub use crate::agents::AgentRegistry;
pub use crate::batch::{BatchConfig, BatchMatcher, BatchResult};
pub use crate::budget::{BudgetDecision, BudgetGuard, BudgetStore};
pub use crate::config::Config;
pub use crate::errors::{EngineError, ErrorKind};
pub use crate::llm_client::{Generation, GenerationClient, GenerationRequest, TokenUsage};
pub use crate::matching::{score_compatibility, CandidateProfile, ScoreWeights, TargetProfile};
pub use crate::plan::{OrchestrationPlan, OrchestrationResult, OrchestrationStep, PlanExecutor};
pub use crate::runtime::context::ExecutionContext;
pub use crate::runtime::{AgentDescriptor, AgentOutcome, AgentRuntime, AgentTask};
pub use crate::state::EngineState;
pub use crate::tools::{Tool, ToolOutcome, ToolRegistry};
