//! Budget Guard — gates billed work and records actual consumption.
//!
//! The store is externally authoritative: a check is never cached across
//! calls, and a passing check may go stale before the matching usage record
//! lands. The engine tolerates that window by design; it performs no
//! in-process locking around quota.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::llm_client::TokenUsage;

/// Identities with no configured limit get this monthly allowance, in cents.
const DEFAULT_LIMIT_CENTS: i64 = 500;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// Raw ledger state for one identity.
#[derive(Debug, Clone, Copy)]
pub struct BudgetState {
    pub limit_cents: i64,
    pub spent_cents: i64,
}

/// Result of a budget check, produced before every billed operation.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub remaining_cents: i64,
    pub usage_percent: f64,
    pub message: Option<String>,
}

/// Actual consumption of one agent execution, persisted after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub identity: Uuid,
    pub correlation_id: Uuid,
    pub agent_id: String,
    pub model: String,
    pub cost_cents: u32,
    pub usage: TokenUsage,
    pub occurred_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Store trait + implementations
// ────────────────────────────────────────────────────────────────────────────

/// Persistence seam for the budget ledger. The engine's only storage
/// dependency.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn fetch(&self, identity: Uuid) -> Result<BudgetState, EngineError>;
    async fn record(&self, record: &UsageRecord) -> Result<(), EngineError>;
}

/// Postgres-backed ledger. `budget_limits` holds per-identity monthly limits;
/// `budget_ledger` holds one row per billed execution.
pub struct PgBudgetStore {
    pool: PgPool,
}

impl PgBudgetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BudgetStore for PgBudgetStore {
    async fn fetch(&self, identity: Uuid) -> Result<BudgetState, EngineError> {
        let limit_row = sqlx::query("SELECT limit_cents FROM budget_limits WHERE identity = $1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        let limit_cents: i64 = limit_row
            .map(|r| r.get("limit_cents"))
            .unwrap_or(DEFAULT_LIMIT_CENTS);

        let spent_cents: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(cost_cents), 0)::BIGINT
            FROM budget_ledger
            WHERE identity = $1
              AND occurred_at >= date_trunc('month', now())
            "#,
        )
        .bind(identity)
        .fetch_one(&self.pool)
        .await?;

        Ok(BudgetState {
            limit_cents,
            spent_cents,
        })
    }

    async fn record(&self, record: &UsageRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO budget_ledger
                (id, identity, correlation_id, agent_id, model,
                 cost_cents, input_tokens, output_tokens, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.identity)
        .bind(record.correlation_id)
        .bind(&record.agent_id)
        .bind(&record.model)
        .bind(record.cost_cents as i64)
        .bind(record.usage.input_tokens as i64)
        .bind(record.usage.output_tokens as i64)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory ledger for tests and embedded use.
#[derive(Default)]
pub struct InMemoryBudgetStore {
    limits: RwLock<HashMap<Uuid, i64>>,
    records: RwLock<Vec<UsageRecord>>,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_limit(&self, identity: Uuid, limit_cents: i64) {
        self.limits.write().await.insert(identity, limit_cents);
    }

    pub async fn recorded(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn fetch(&self, identity: Uuid) -> Result<BudgetState, EngineError> {
        let limit_cents = self
            .limits
            .read()
            .await
            .get(&identity)
            .copied()
            .unwrap_or(DEFAULT_LIMIT_CENTS);
        let spent_cents = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.identity == identity)
            .map(|r| r.cost_cents as i64)
            .sum();
        Ok(BudgetState {
            limit_cents,
            spent_cents,
        })
    }

    async fn record(&self, record: &UsageRecord) -> Result<(), EngineError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Guard
// ────────────────────────────────────────────────────────────────────────────

/// The gate in front of every billed operation.
#[derive(Clone)]
pub struct BudgetGuard {
    store: Arc<dyn BudgetStore>,
}

impl BudgetGuard {
    pub fn new(store: Arc<dyn BudgetStore>) -> Self {
        Self { store }
    }

    /// Checks remaining quota for an identity. A denial is a decision, not an
    /// error; store failures surface as errors for the harness to categorize.
    pub async fn check(&self, identity: Uuid) -> Result<BudgetDecision, EngineError> {
        let state = self.store.fetch(identity).await?;

        let remaining_cents = (state.limit_cents - state.spent_cents).max(0);
        let usage_percent = if state.limit_cents > 0 {
            (state.spent_cents as f64 / state.limit_cents as f64) * 100.0
        } else {
            100.0
        };
        let allowed = state.spent_cents < state.limit_cents;

        let message = if !allowed {
            Some("Monthly usage limit reached. Please upgrade or wait for the next cycle.".to_string())
        } else if usage_percent >= 80.0 {
            Some(format!("{usage_percent:.0}% of monthly budget used"))
        } else {
            None
        };

        Ok(BudgetDecision {
            allowed,
            remaining_cents,
            usage_percent,
            message,
        })
    }

    /// Persists actual consumption. Fire-and-forget: the write happens on a
    /// spawned task and a failure is logged, never surfaced to the caller.
    pub fn record(&self, record: UsageRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.record(&record).await {
                warn!(
                    identity = %record.identity,
                    agent = %record.agent_id,
                    "failed to record usage: {e}"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage_record(identity: Uuid, cost_cents: u32) -> UsageRecord {
        UsageRecord {
            identity,
            correlation_id: Uuid::new_v4(),
            agent_id: "compatibility".to_string(),
            model: "test-model".to_string(),
            cost_cents,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_check_allows_under_limit() {
        let store = Arc::new(InMemoryBudgetStore::new());
        let identity = Uuid::new_v4();
        store.set_limit(identity, 100).await;

        let guard = BudgetGuard::new(store);
        let decision = guard.check(identity).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_cents, 100);
        assert!(decision.message.is_none());
    }

    #[tokio::test]
    async fn test_check_denies_at_limit() {
        let store = Arc::new(InMemoryBudgetStore::new());
        let identity = Uuid::new_v4();
        store.set_limit(identity, 10).await;
        store.record(&usage_record(identity, 10)).await.unwrap();

        let guard = BudgetGuard::new(store);
        let decision = guard.check(identity).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_cents, 0);
        assert!(decision.message.unwrap().contains("limit reached"));
    }

    #[tokio::test]
    async fn test_check_warns_above_80_percent() {
        let store = Arc::new(InMemoryBudgetStore::new());
        let identity = Uuid::new_v4();
        store.set_limit(identity, 100).await;
        store.record(&usage_record(identity, 85)).await.unwrap();

        let guard = BudgetGuard::new(store);
        let decision = guard.check(identity).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.message.unwrap().contains("85%"));
    }

    #[tokio::test]
    async fn test_zero_limit_denies() {
        let store = Arc::new(InMemoryBudgetStore::new());
        let identity = Uuid::new_v4();
        store.set_limit(identity, 0).await;

        let guard = BudgetGuard::new(store);
        let decision = guard.check(identity).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.usage_percent, 100.0);
    }

    #[tokio::test]
    async fn test_record_is_fire_and_forget() {
        let store = Arc::new(InMemoryBudgetStore::new());
        let identity = Uuid::new_v4();
        let guard = BudgetGuard::new(Arc::clone(&store) as Arc<dyn BudgetStore>);

        guard.record(usage_record(identity, 3));

        // The write lands on a spawned task; yield until it does.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if !store.recorded().await.is_empty() {
                break;
            }
        }
        let recorded = store.recorded().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].cost_cents, 3);
    }

    #[tokio::test]
    async fn test_record_failure_does_not_surface() {
        struct FailingStore;
        #[async_trait]
        impl BudgetStore for FailingStore {
            async fn fetch(&self, _identity: Uuid) -> Result<BudgetState, EngineError> {
                Ok(BudgetState {
                    limit_cents: 100,
                    spent_cents: 0,
                })
            }
            async fn record(&self, _record: &UsageRecord) -> Result<(), EngineError> {
                Err(EngineError::Unknown("ledger write failed".to_string()))
            }
        }

        let guard = BudgetGuard::new(Arc::new(FailingStore));
        // Must not panic or return an error path to the caller.
        guard.record(usage_record(Uuid::new_v4(), 1));
        tokio::task::yield_now().await;
        assert!(guard.check(Uuid::new_v4()).await.unwrap().allowed);
    }
}
