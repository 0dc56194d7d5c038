//! Document tailoring agent — produces a tailored candidate document for a
//! target role via a JSON-validated generation call.
//!
//! Every bullet must cite a source key derived from the candidate profile;
//! a response with uncited bullets is retried before giving up. Bullets are
//! facts with provenance, or they are not emitted at all.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agents::prompts::{TAILOR_PROMPT_TEMPLATE, TAILOR_SYSTEM};
use crate::errors::EngineError;
use crate::llm_client::DEFAULT_MODEL;
use crate::matching::{CandidateProfile, TargetProfile};
use crate::runtime::context::ExecutionContext;
use crate::runtime::{AgentDeps, AgentDescriptor, AgentTask};

/// Extra generation attempts when bullets come back with invalid sources.
const MAX_TAILOR_RETRIES: u32 = 2;

static DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    id: "tailor",
    name: "Document Tailoring",
    default_model: DEFAULT_MODEL,
    max_retries: 1,
    timeout: Duration::from_secs(90),
    priority: 4,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailorInput {
    pub target: TargetProfile,
    pub candidate: CandidateProfile,
    /// Optional tone directive ("direct", "warm", ...). Defaults to neutral.
    #[serde(default)]
    pub tone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailoredBullet {
    pub text: String,
    /// Source key ("position:0", "skill:rust", "education:0") proving the
    /// bullet is grounded in the profile.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailoredSection {
    pub title: String,
    pub bullets: Vec<TailoredBullet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailoredDocument {
    pub summary: String,
    pub sections: Vec<TailoredSection>,
}

/// Source keys the generation call may cite for this candidate.
fn valid_sources(candidate: &CandidateProfile) -> HashSet<String> {
    let mut sources = HashSet::new();
    for (i, _) in candidate.positions.iter().enumerate() {
        sources.insert(format!("position:{i}"));
    }
    for (i, _) in candidate.education.iter().enumerate() {
        sources.insert(format!("education:{i}"));
    }
    for skill in &candidate.skills {
        sources.insert(format!("skill:{}", skill.trim().to_lowercase()));
    }
    sources
}

pub struct TailorAgent;

#[async_trait]
impl AgentTask for TailorAgent {
    type Input = TailorInput;
    type Output = TailoredDocument;

    fn descriptor(&self) -> &AgentDescriptor {
        &DESCRIPTOR
    }

    async fn execute(
        &self,
        input: &TailorInput,
        deps: &AgentDeps,
        _ctx: &ExecutionContext,
    ) -> Result<TailoredDocument, EngineError> {
        let sources = valid_sources(&input.candidate);
        if sources.is_empty() {
            return Err(EngineError::InvalidInput(
                "candidate profile has no positions, education, or skills to tailor from"
                    .to_string(),
            ));
        }

        let target_json = serde_json::to_string_pretty(&input.target)
            .map_err(|e| EngineError::Unknown(format!("unserializable target: {e}")))?;
        let candidate_json = serde_json::to_string_pretty(&input.candidate)
            .map_err(|e| EngineError::Unknown(format!("unserializable candidate: {e}")))?;
        let sources_json = serde_json::to_string(&{
            let mut listed: Vec<&String> = sources.iter().collect();
            listed.sort();
            listed
        })
        .map_err(|e| EngineError::Unknown(format!("unserializable sources: {e}")))?;

        let prompt = TAILOR_PROMPT_TEMPLATE
            .replace("{target_json}", &target_json)
            .replace("{candidate_json}", &candidate_json)
            .replace("{sources_json}", &sources_json)
            .replace("{tone}", input.tone.as_deref().unwrap_or("neutral"));

        for attempt in 0..=MAX_TAILOR_RETRIES {
            let request = deps.request(prompt.clone()).with_system(TAILOR_SYSTEM);
            let (document, _generation): (TailoredDocument, _) =
                deps.generate_json(request).await?;

            let invalid_count = document
                .sections
                .iter()
                .flat_map(|s| &s.bullets)
                .filter(|b| !sources.contains(&b.source))
                .count();

            if invalid_count == 0 {
                return Ok(document);
            }

            warn!(
                "tailoring attempt {}/{}: {} bullets cite unknown sources, retrying",
                attempt + 1,
                MAX_TAILOR_RETRIES + 1,
                invalid_count
            );
        }

        Err(EngineError::ValidationFailed(format!(
            "tailored document bullets consistently cited unknown sources after {} attempts",
            MAX_TAILOR_RETRIES + 1
        )))
    }

    fn validate(&self, output: &TailoredDocument) -> Result<(), EngineError> {
        if output.summary.trim().is_empty() {
            return Err(EngineError::ValidationFailed(
                "tailored document has an empty summary".to_string(),
            ));
        }
        if !output.sections.iter().any(|s| !s.bullets.is_empty()) {
            return Err(EngineError::ValidationFailed(
                "tailored document has no bullets".to_string(),
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
    use crate::tools::ToolRegistry;
    use std::sync::Arc;
    use uuid::Uuid;

    fn runtime(llm: Arc<StaticGenerationClient>) -> AgentRuntime {
        let store = Arc::new(InMemoryBudgetStore::new());
        AgentRuntime::new(
            BudgetGuard::new(store as Arc<dyn BudgetStore>),
            llm,
            Arc::new(ToolRegistry::new()),
        )
    }

    fn input() -> TailorInput {
        TailorInput {
            target: fixtures::target(),
            candidate: fixtures::candidate(),
            tone: None,
        }
    }

    fn grounded_document() -> String {
        serde_json::json!({
            "summary": "Senior backend engineer with seven years on Rust platforms.",
            "sections": [{
                "title": "Experience",
                "bullets": [
                    {"text": "Ran the Kubernetes platform", "source": "position:1"},
                    {"text": "Deep Rust expertise", "source": "skill:rust"}
                ]
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_grounded_document_passes() {
        let llm = Arc::new(StaticGenerationClient::new());
        llm.push_text(&grounded_document());
        let runtime = runtime(Arc::clone(&llm));
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let outcome = runtime.run(&TailorAgent, &input(), &ctx).await;
        assert!(outcome.success);
        let document = outcome.payload.unwrap();
        assert_eq!(document.sections[0].bullets.len(), 2);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ungrounded_bullets_are_retried_then_accepted() {
        let llm = Arc::new(StaticGenerationClient::new());
        llm.push_text(
            &serde_json::json!({
                "summary": "s",
                "sections": [{"title": "Experience", "bullets": [
                    {"text": "Invented facts", "source": "position:99"}
                ]}]
            })
            .to_string(),
        );
        llm.push_text(&grounded_document());
        let runtime = runtime(Arc::clone(&llm));
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let outcome = runtime.run(&TailorAgent, &input(), &ctx).await;
        assert!(outcome.success);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_persistently_ungrounded_bullets_fail_validation() {
        let llm = Arc::new(StaticGenerationClient::new());
        let bad = serde_json::json!({
            "summary": "s",
            "sections": [{"title": "Experience", "bullets": [
                {"text": "Invented", "source": "position:99"}
            ]}]
        })
        .to_string();
        for _ in 0..=MAX_TAILOR_RETRIES {
            llm.push_text(&bad);
        }
        let runtime = runtime(Arc::clone(&llm));
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let outcome = runtime.run(&TailorAgent, &input(), &ctx).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationFailed));
        // Billed attempts still show up on the failed outcome.
        assert!(outcome.cost_cents > 0);
    }

    #[tokio::test]
    async fn test_empty_profile_is_invalid_input() {
        let llm = Arc::new(StaticGenerationClient::new());
        let runtime = runtime(Arc::clone(&llm));
        let ctx = ExecutionContext::new(Uuid::new_v4());

        let mut empty = input();
        empty.candidate.skills.clear();
        empty.candidate.positions.clear();
        empty.candidate.education.clear();

        let outcome = runtime.run(&TailorAgent, &empty, &ctx).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidInput));
        assert_eq!(llm.call_count(), 0);
    }
}
