//! Trace collection — hierarchical spans shipped to an external collector.
//!
//! Every agent execution opens one span; generation and tool calls open
//! children. Export is opportunistic: a collector that is absent or failing
//! degrades to a no-op and never blocks the return path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initializes structured logging for binaries and tests embedding the engine.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// A finished span, as shipped to the collector.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub correlation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub cost_cents: u32,
    pub metadata: BTreeMap<String, String>,
}

/// Destination for finished spans. Implementations must swallow their own
/// failures; a broken collector never fails the operation it observed.
pub trait TraceCollector: Send + Sync {
    fn export(&self, record: SpanRecord);
}

/// An open span. `end` consumes the handle and exports the record;
/// a handle that is never ended simply exports nothing.
#[derive(Clone)]
pub struct SpanHandle {
    id: Uuid,
    parent_id: Option<Uuid>,
    name: String,
    correlation_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    collector: Arc<dyn TraceCollector>,
}

impl SpanHandle {
    pub fn root(collector: Arc<dyn TraceCollector>, name: &str, correlation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            name: name.to_string(),
            correlation_id,
            started_at: Utc::now(),
            started: Instant::now(),
            collector,
        }
    }

    /// Opens a child span sharing this span's correlation id.
    pub fn child(&self, name: &str) -> SpanHandle {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            name: name.to_string(),
            correlation_id: self.correlation_id,
            started_at: Utc::now(),
            started: Instant::now(),
            collector: Arc::clone(&self.collector),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ends the span and exports it. Best-effort: export failures are the
    /// collector's problem, never the caller's.
    pub fn end(self, success: bool, cost_cents: u32, metadata: BTreeMap<String, String>) {
        let record = SpanRecord {
            id: self.id,
            parent_id: self.parent_id,
            name: self.name,
            correlation_id: self.correlation_id,
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            success,
            cost_cents,
            metadata,
        };
        self.collector.export(record);
    }
}

/// Collector used when no observability backend is wired. Identical shape,
/// zero work.
pub struct NoopCollector;

impl TraceCollector for NoopCollector {
    fn export(&self, _record: SpanRecord) {}
}

/// Emits spans through the `tracing` subscriber. Default collector for local
/// runs and tests.
pub struct LogCollector;

impl TraceCollector for LogCollector {
    fn export(&self, record: SpanRecord) {
        tracing::debug!(
            span = %record.name,
            correlation = %record.correlation_id,
            duration_ms = record.duration_ms,
            success = record.success,
            cost_cents = record.cost_cents,
            "span ended"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures exported spans for assertions.
    pub struct CapturingCollector {
        pub records: Mutex<Vec<SpanRecord>>,
    }

    impl CapturingCollector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
            })
        }
    }

    impl TraceCollector for CapturingCollector {
        fn export(&self, record: SpanRecord) {
            self.records.lock().unwrap().push(record);
        }
    }
}
