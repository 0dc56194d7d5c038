//! Engine state — wires configuration, collaborators, and registries into
//! the executors an embedding application works with.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::batch::{BatchConfig, BatchMatcher, HttpSwarmCollaborator};
use crate::budget::{BudgetGuard, BudgetStore, PgBudgetStore};
use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::{GenerationClient, HttpGenerationClient};
use crate::plan::PlanExecutor;
use crate::runtime::context::ExecutionContext;
use crate::runtime::AgentRuntime;
use crate::tools::ToolRegistry;

/// Fully wired engine. Built once at process start; embedders share it
/// behind an `Arc`.
pub struct EngineState {
    pub config: Config,
    pub llm: Arc<dyn GenerationClient>,
    pub budget: BudgetGuard,
    pub tools: Arc<ToolRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub runtime: AgentRuntime,
    pub planner: PlanExecutor,
    pub matcher: BatchMatcher,
}

impl EngineState {
    /// Production wiring: Postgres budget ledger, HTTP generation backend,
    /// and the default agent set. Register tools before calling.
    pub async fn from_config(config: Config, tools: ToolRegistry) -> Result<Self> {
        let db = create_pool(&config.database_url).await?;
        let store: Arc<dyn BudgetStore> = Arc::new(PgBudgetStore::new(db));

        let llm: Arc<dyn GenerationClient> = Arc::new(HttpGenerationClient::new(
            config.generation_api_url.clone(),
            config.generation_api_key.clone(),
        ));
        info!("generation client initialized");

        Ok(Self::from_parts(config, store, llm, tools))
    }

    /// Wiring seam for tests and embedded use: any budget store and
    /// generation backend.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn BudgetStore>,
        llm: Arc<dyn GenerationClient>,
        tools: ToolRegistry,
    ) -> Self {
        let budget = BudgetGuard::new(store);
        let tools = Arc::new(tools);
        let runtime = AgentRuntime::new(budget.clone(), Arc::clone(&llm), Arc::clone(&tools));

        let agents = Arc::new(AgentRegistry::with_defaults());
        info!("agent registry initialized: {:?}", agents.ids());

        let planner = PlanExecutor::new(runtime.clone(), Arc::clone(&agents));

        let batch_config = BatchConfig {
            max_concurrency: config.max_concurrency,
            score_threshold: config.score_threshold,
            swarm_threshold: config.swarm_threshold,
        };
        let mut matcher = BatchMatcher::new(runtime.clone(), batch_config);
        if let Some(swarm_url) = &config.swarm_api_url {
            info!("swarm collaborator enabled at {swarm_url}");
            matcher = matcher.with_swarm(Arc::new(HttpSwarmCollaborator::new(swarm_url.clone())));
        }

        Self {
            config,
            llm,
            budget,
            tools,
            agents,
            runtime,
            planner,
            matcher,
        }
    }

    /// A fresh context for one logical operation.
    pub fn context(&self, identity: Uuid) -> ExecutionContext {
        ExecutionContext::new(identity)
    }
}
