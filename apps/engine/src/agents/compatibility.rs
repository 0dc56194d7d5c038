//! Compatibility scoring agent — the pure scorer wrapped in the runtime
//! lifecycle, plus a best-effort generated explanation.
//!
//! The generation call is a side channel: any failure there falls back to
//! the deterministic reasons list and never fails the scoring outcome.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::agents::prompts::{EXPLANATION_PROMPT_TEMPLATE, EXPLANATION_SYSTEM};
use crate::batch::Scored;
use crate::errors::{EngineError, ErrorKind};
use crate::llm_client::DEFAULT_MODEL;
use crate::matching::{
    score_compatibility, CandidateProfile, CompatibilityReport, ScoreWeights, TargetProfile,
};
use crate::runtime::context::ExecutionContext;
use crate::runtime::{AgentDeps, AgentDescriptor, AgentTask};

static DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    id: "compatibility",
    name: "Compatibility Scoring",
    default_model: DEFAULT_MODEL,
    max_retries: 1,
    timeout: Duration::from_secs(30),
    priority: 5,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityInput {
    pub target: TargetProfile,
    pub candidate: CandidateProfile,
    /// Caller-overridable weights; `None` uses the documented defaults.
    #[serde(default)]
    pub weights: Option<ScoreWeights>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSource {
    Generated,
    Derived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub candidate_id: Uuid,
    pub report: CompatibilityReport,
    pub explanation: String,
    pub explanation_source: ExplanationSource,
}

impl Scored for CompatibilityResult {
    fn score(&self) -> f64 {
        self.report.overall
    }
}

#[derive(Debug, Deserialize)]
struct ExplanationWire {
    explanation: String,
}

pub struct CompatibilityAgent;

impl CompatibilityAgent {
    async fn generate_explanation(
        &self,
        input: &CompatibilityInput,
        report: &CompatibilityReport,
        deps: &AgentDeps,
    ) -> Result<String, EngineError> {
        let target_json = serde_json::to_string(&input.target)
            .map_err(|e| EngineError::Unknown(format!("unserializable target: {e}")))?;
        let report_json = serde_json::to_string(report)
            .map_err(|e| EngineError::Unknown(format!("unserializable report: {e}")))?;

        let prompt = EXPLANATION_PROMPT_TEMPLATE
            .replace("{target_json}", &target_json)
            .replace("{report_json}", &report_json);

        let request = deps.request(prompt).with_system(EXPLANATION_SYSTEM);
        let (wire, _generation): (ExplanationWire, _) = deps.generate_json(request).await?;

        if wire.explanation.trim().is_empty() {
            return Err(EngineError::Api(
                "explanation generation returned empty text".to_string(),
            ));
        }
        Ok(wire.explanation)
    }
}

#[async_trait]
impl AgentTask for CompatibilityAgent {
    type Input = CompatibilityInput;
    type Output = CompatibilityResult;

    fn descriptor(&self) -> &AgentDescriptor {
        &DESCRIPTOR
    }

    async fn execute(
        &self,
        input: &CompatibilityInput,
        deps: &AgentDeps,
        _ctx: &ExecutionContext,
    ) -> Result<CompatibilityResult, EngineError> {
        let weights = input.weights.unwrap_or_default();
        let report = score_compatibility(&input.target, &input.candidate, &weights, Utc::now())?;

        // Best-effort explanation; cancellation is the one error that must
        // not be swallowed here.
        let (explanation, explanation_source) =
            match self.generate_explanation(input, &report, deps).await {
                Ok(text) => (text, ExplanationSource::Generated),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    warn!(
                        candidate = %input.candidate.candidate_id,
                        "explanation generation failed, deriving from sub-scores: {e}"
                    );
                    (report.reasons().join(". "), ExplanationSource::Derived)
                }
            };

        Ok(CompatibilityResult {
            candidate_id: input.candidate.candidate_id,
            report,
            explanation,
            explanation_source,
        })
    }

    fn validate(&self, output: &CompatibilityResult) -> Result<(), EngineError> {
        let overall = output.report.overall;
        if !(0.0..=100.0).contains(&overall) || !overall.is_finite() {
            return Err(EngineError::ValidationFailed(format!(
                "overall score {overall} outside 0-100"
            )));
        }
        Ok(())
    }
}
