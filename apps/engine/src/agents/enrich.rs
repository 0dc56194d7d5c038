//! Record enrichment agent — augments a candidate profile with an external
//! lookup (through the tool invoker) and a normalization generation call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::prompts::{ENRICH_PROMPT_TEMPLATE, ENRICH_SYSTEM};
use crate::errors::EngineError;
use crate::llm_client::DEFAULT_MODEL;
use crate::matching::CandidateProfile;
use crate::runtime::context::ExecutionContext;
use crate::runtime::{AgentDeps, AgentDescriptor, AgentTask};

/// Tool id the enrichment step depends on. Wire an implementation into the
/// tool registry or executions of this agent fail with `InvalidInput`.
pub const PROFILE_LOOKUP_TOOL: &str = "profile_lookup";

static DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    id: "enrich",
    name: "Record Enrichment",
    default_model: DEFAULT_MODEL,
    max_retries: 1,
    timeout: Duration::from_secs(60),
    priority: 3,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichInput {
    pub candidate: CandidateProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub candidate: CandidateProfile,
    pub highlights: Vec<String>,
    /// Raw lookup payload, kept for callers that want the unnormalized view.
    pub public_profile: Value,
    pub lookup_cache_hit: bool,
}

#[derive(Debug, Deserialize)]
struct EnrichmentWire {
    highlights: Vec<String>,
}

pub struct EnrichAgent;

#[async_trait]
impl AgentTask for EnrichAgent {
    type Input = EnrichInput;
    type Output = EnrichedRecord;

    fn descriptor(&self) -> &AgentDescriptor {
        &DESCRIPTOR
    }

    async fn execute(
        &self,
        input: &EnrichInput,
        deps: &AgentDeps,
        ctx: &ExecutionContext,
    ) -> Result<EnrichedRecord, EngineError> {
        // The lookup is essential: a tool failure aborts this step.
        let lookup = deps
            .invoke_tool(
                PROFILE_LOOKUP_TOOL,
                json!({ "candidate_id": input.candidate.candidate_id }),
                ctx,
            )
            .await?;
        let public_profile = lookup.payload.unwrap_or(Value::Null);

        let candidate_json = serde_json::to_string(&input.candidate)
            .map_err(|e| EngineError::Unknown(format!("unserializable candidate: {e}")))?;
        let lookup_json = serde_json::to_string(&public_profile)
            .map_err(|e| EngineError::Unknown(format!("unserializable lookup: {e}")))?;

        let prompt = ENRICH_PROMPT_TEMPLATE
            .replace("{candidate_json}", &candidate_json)
            .replace("{lookup_json}", &lookup_json);

        let request = deps.request(prompt).with_system(ENRICH_SYSTEM);
        let (wire, _generation): (EnrichmentWire, _) = deps.generate_json(request).await?;

        Ok(EnrichedRecord {
            candidate: input.candidate.clone(),
            highlights: wire.highlights,
            public_profile,
            lookup_cache_hit: lookup.cache_hit,
        })
    }

    fn validate(&self, output: &EnrichedRecord) -> Result<(), EngineError> {
        if output.highlights.is_empty() {
            return Err(EngineError::ValidationFailed(
                "enrichment produced no highlights".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetGuard, BudgetStore, InMemoryBudgetStore};
    use crate::errors::ErrorKind;
    use crate::llm_client::testing::StaticGenerationClient;
    use crate::matching::fixtures;
    use crate::runtime::AgentRuntime;
    use crate::tools::{Tool, ToolOutcome, ToolRegistry};
    use std::sync::Arc;
    use uuid::Uuid;

    struct LookupTool {
        fail: bool,
    }

    #[async_trait]
    impl Tool for LookupTool {
        fn id(&self) -> &str {
            PROFILE_LOOKUP_TOOL
        }
        fn description(&self) -> &str {
            "looks up a candidate's public profile"
        }
        async fn execute(
            &self,
            _input: Value,
            _ctx: &ExecutionContext,
        ) -> Result<ToolOutcome<Value>, EngineError> {
            if self.fail {
                Ok(ToolOutcome::fail("profile service unreachable"))
            } else {
                Ok(ToolOutcome::ok(json!({"repos": 12, "stars": 2048})).cached())
            }
        }
    }

    fn runtime(llm: Arc<StaticGenerationClient>, lookup_fails: bool) -> AgentRuntime {
        let store = Arc::new(InMemoryBudgetStore::new());
        let mut tools = ToolRegistry::new();
        tools
            .register(Arc::new(LookupTool { fail: lookup_fails }))
            .unwrap();
        AgentRuntime::new(
            BudgetGuard::new(store as Arc<dyn BudgetStore>),
            llm,
            Arc::new(tools),
        )
    }

    fn input() -> EnrichInput {
        EnrichInput {
            candidate: fixtures::candidate(),
        }
    }

    #[tokio::test]
    async fn test_enrichment_combines_tool_and_generation() {
        let llm = Arc::new(StaticGenerationClient::new());
        llm.push_text(r#"{"highlights": ["Maintains a 2k-star crate"]}"#);
        let runtime = runtime(Arc::clone(&llm), false);
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let outcome = runtime.run(&EnrichAgent, &input(), &ctx).await;
        assert!(outcome.success);
        let record = outcome.payload.unwrap();
        assert_eq!(record.highlights.len(), 1);
        assert_eq!(record.public_profile["stars"], 2048);
        assert!(record.lookup_cache_hit);
    }

    #[tokio::test]
    async fn test_tool_failure_aborts_the_step() {
        let llm = Arc::new(StaticGenerationClient::new());
        llm.push_text(r#"{"highlights": ["never reached"]}"#);
        let runtime = runtime(Arc::clone(&llm), true);
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let outcome = runtime.run(&EnrichAgent, &input(), &ctx).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ToolFailed));
        assert_eq!(llm.call_count(), 0, "generation must not run after tool failure");
    }

    #[tokio::test]
    async fn test_empty_highlights_fail_validation() {
        let llm = Arc::new(StaticGenerationClient::new());
        llm.push_text(r#"{"highlights": []}"#);
        let runtime = runtime(Arc::clone(&llm), false);
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let outcome = runtime.run(&EnrichAgent, &input(), &ctx).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationFailed));
    }
}
