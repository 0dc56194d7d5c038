//! Batch matcher — applies one agent across N independent inputs with
//! bounded concurrency and score filtering.
//!
//! Items run in fixed-size chunks (chunk size = max concurrency); within a
//! chunk everything runs concurrently, and the matcher waits for the whole
//! chunk before starting the next. One item's failure is recorded as a
//! no-match and never aborts the batch; its billed cost still counts.
//! Batches above the swarm threshold are offered to an external swarm
//! collaborator first, with a deterministic local fallback — no item is
//! ever silently dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agents::{CompatibilityAgent, CompatibilityInput, CompatibilityResult};
use crate::errors::EngineError;
use crate::llm_client::TokenUsage;
use crate::matching::{CandidateProfile, ScoreWeights, TargetProfile};
use crate::pool::{PoolConfig, ResourcePool};
use crate::runtime::context::ExecutionContext;
use crate::runtime::{AgentRuntime, AgentTask, OutcomeError};

/// Implemented by agent outputs the matcher can rank.
pub trait Scored {
    fn score(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Chunk size; all items within a chunk run concurrently.
    pub max_concurrency: usize,
    /// Results below this score are dropped from the match list.
    pub score_threshold: f64,
    /// Batches strictly larger than this are offered to the swarm first.
    pub swarm_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            score_threshold: 50.0,
            swarm_threshold: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchMatch<T> {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub score: f64,
    pub payload: T,
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub index: usize,
    pub error: OutcomeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSource {
    Local,
    Swarm,
}

#[derive(Debug)]
pub struct BatchResult<T> {
    /// Matches above the threshold, sorted by score descending, stable on
    /// ties.
    pub matches: Vec<BatchMatch<T>>,
    pub failures: Vec<BatchFailure>,
    pub total_cost_cents: u32,
    pub total_usage: TokenUsage,
    pub duration: Duration,
    pub source: BatchSource,
}

// ────────────────────────────────────────────────────────────────────────────
// Swarm collaborator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMatch {
    pub index: usize,
    pub score: f64,
    pub payload: Value,
}

/// External fan-out service for very large batches.
#[async_trait]
pub trait SwarmCollaborator: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn match_batch(
        &self,
        items: &[Value],
        threshold: f64,
    ) -> Result<Vec<SwarmMatch>, EngineError>;
}

/// HTTP swarm client. Connections are leased from a bounded pool with an
/// explicit release; the pool rebuilds clients idle past their TTL.
pub struct HttpSwarmCollaborator {
    endpoint: String,
    pool: ResourcePool<Client>,
}

impl HttpSwarmCollaborator {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            pool: ResourcePool::new(PoolConfig::default(), || {
                Client::builder()
                    .timeout(Duration::from_secs(60))
                    .build()
                    .expect("Failed to build HTTP client")
            }),
        }
    }
}

#[derive(Serialize)]
struct SwarmRequest<'a> {
    items: &'a [Value],
    threshold: f64,
}

#[async_trait]
impl SwarmCollaborator for HttpSwarmCollaborator {
    async fn is_available(&self) -> bool {
        let client = self.pool.acquire().await;
        let healthy = client
            .get(format!("{}/health", self.endpoint))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        client.release().await;
        healthy
    }

    async fn match_batch(
        &self,
        items: &[Value],
        threshold: f64,
    ) -> Result<Vec<SwarmMatch>, EngineError> {
        let client = self.pool.acquire().await;
        let response = client
            .post(format!("{}/match", self.endpoint))
            .json(&SwarmRequest { items, threshold })
            .send()
            .await;

        let result = match response {
            Ok(response) if response.status().is_success() => response
                .json::<Vec<SwarmMatch>>()
                .await
                .map_err(|e| EngineError::Api(format!("malformed swarm response: {e}"))),
            Ok(response) => Err(EngineError::Api(format!(
                "swarm returned status {}",
                response.status()
            ))),
            Err(e) => Err(e.into()),
        };

        client.release().await;
        result
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Matcher
// ────────────────────────────────────────────────────────────────────────────

pub struct BatchMatcher {
    runtime: AgentRuntime,
    config: BatchConfig,
    swarm: Option<Arc<dyn SwarmCollaborator>>,
}

impl BatchMatcher {
    pub fn new(runtime: AgentRuntime, config: BatchConfig) -> Self {
        Self {
            runtime,
            config,
            swarm: None,
        }
    }

    pub fn with_swarm(mut self, swarm: Arc<dyn SwarmCollaborator>) -> Self {
        self.swarm = Some(swarm);
        self
    }

    /// Runs `task` over every item and returns the filtered, ranked matches.
    pub async fn run<T>(
        &self,
        task: &T,
        items: Vec<T::Input>,
        ctx: &ExecutionContext,
    ) -> BatchResult<T::Output>
    where
        T: AgentTask,
        T::Input: Serialize,
        T::Output: Scored + DeserializeOwned,
    {
        let started = Instant::now();

        if items.len() > self.config.swarm_threshold {
            if let Some(mut result) = self.try_swarm::<T>(&items).await {
                result.duration = started.elapsed();
                return result;
            }
        }

        let mut result = self.run_local(task, &items, ctx).await;
        result.duration = started.elapsed();
        result
    }

    /// Swarm hand-off. Any shortfall (unavailable, erroring, empty, or an
    /// unparseable payload) returns `None` so the caller falls back to
    /// local processing with the full item list.
    async fn try_swarm<T>(&self, items: &[T::Input]) -> Option<BatchResult<T::Output>>
    where
        T: AgentTask,
        T::Input: Serialize,
        T::Output: Scored + DeserializeOwned,
    {
        let swarm = self.swarm.as_ref()?;
        if !swarm.is_available().await {
            debug!("swarm unavailable, processing batch locally");
            return None;
        }

        let serialized: Vec<Value> = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()
            .ok()?;

        let raw = match swarm
            .match_batch(&serialized, self.config.score_threshold)
            .await
        {
            Ok(raw) if !raw.is_empty() => raw,
            Ok(_) => {
                debug!("swarm returned no matches, falling back to local processing");
                return None;
            }
            Err(e) => {
                warn!("swarm hand-off failed, falling back to local processing: {e}");
                return None;
            }
        };

        let mut matches = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_value::<T::Output>(entry.payload) {
                Ok(payload) => matches.push(BatchMatch {
                    index: entry.index,
                    score: entry.score,
                    payload,
                }),
                Err(e) => {
                    warn!("unparseable swarm payload, falling back to local processing: {e}");
                    return None;
                }
            }
        }

        matches.retain(|m| m.score >= self.config.score_threshold);
        sort_by_score(&mut matches);

        info!("swarm matched {} of {} items", matches.len(), items.len());
        Some(BatchResult {
            matches,
            failures: Vec::new(),
            total_cost_cents: 0,
            total_usage: TokenUsage::default(),
            duration: Duration::ZERO,
            source: BatchSource::Swarm,
        })
    }

    async fn run_local<T>(
        &self,
        task: &T,
        items: &[T::Input],
        ctx: &ExecutionContext,
    ) -> BatchResult<T::Output>
    where
        T: AgentTask,
        T::Output: Scored,
    {
        let chunk_size = self.config.max_concurrency.max(1);
        let mut matches = Vec::new();
        let mut failures = Vec::new();
        let mut total_cost_cents = 0u32;
        let mut total_usage = TokenUsage::default();

        for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
            let base = chunk_index * chunk_size;
            let runtime = &self.runtime;
            let round = chunk.iter().enumerate().map(|(offset, item)| async move {
                (base + offset, runtime.run(task, item, ctx).await)
            });

            // The whole chunk completes before the next one starts.
            for (index, outcome) in join_all(round).await {
                total_cost_cents += outcome.cost_cents;
                total_usage.add(outcome.usage);

                match (outcome.success, outcome.payload, outcome.error) {
                    (true, Some(payload), _) => {
                        let score = payload.score();
                        if score >= self.config.score_threshold {
                            matches.push(BatchMatch {
                                index,
                                score,
                                payload,
                            });
                        }
                    }
                    (_, _, error) => {
                        // A failed item is a no-match, never a batch abort.
                        failures.push(BatchFailure {
                            index,
                            error: error.unwrap_or(OutcomeError {
                                kind: crate::errors::ErrorKind::Unknown,
                                message: "agent produced neither payload nor error".to_string(),
                            }),
                        });
                    }
                }
            }
        }

        sort_by_score(&mut matches);

        info!(
            "batch matched {} of {} items locally ({} failures)",
            matches.len(),
            items.len(),
            failures.len()
        );
        BatchResult {
            matches,
            failures,
            total_cost_cents,
            total_usage,
            duration: Duration::ZERO,
            source: BatchSource::Local,
        }
    }

    /// Scores many candidates against one target profile, the canonical
    /// fan-out workload.
    pub async fn match_candidates(
        &self,
        target: &TargetProfile,
        candidates: Vec<CandidateProfile>,
        weights: Option<ScoreWeights>,
        ctx: &ExecutionContext,
    ) -> BatchResult<CompatibilityResult> {
        let items: Vec<CompatibilityInput> = candidates
            .into_iter()
            .map(|candidate| CompatibilityInput {
                target: target.clone(),
                candidate,
                weights,
            })
            .collect();
        self.run(&CompatibilityAgent, items, ctx).await
    }
}

/// Descending by score; `sort_by` is stable, so ties keep their original
/// relative order.
fn sort_by_score<T>(matches: &mut [BatchMatch<T>]) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
