use anyhow::{Context, Result};

/// Engine configuration loaded from environment variables.
/// Required variables fail fast at startup; tuning knobs have defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub generation_api_url: String,
    pub generation_api_key: String,
    /// Optional swarm collaborator endpoint. Absent means large batches are
    /// always processed locally.
    pub swarm_api_url: Option<String>,
    /// Chunk size for the batch matcher; within a chunk all items run
    /// concurrently.
    pub max_concurrency: usize,
    /// Minimum overall score for a batch result to count as a match.
    pub score_threshold: f64,
    /// Batch sizes above this are offered to the swarm collaborator first.
    pub swarm_threshold: usize,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            generation_api_url: require_env("GENERATION_API_URL")?,
            generation_api_key: require_env("GENERATION_API_KEY")?,
            swarm_api_url: std::env::var("SWARM_API_URL").ok(),
            max_concurrency: parse_env("MAX_CONCURRENCY", 5)?,
            score_threshold: parse_env("SCORE_THRESHOLD", 50.0)?,
            swarm_threshold: parse_env("SWARM_THRESHOLD", 100)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value")),
        Err(_) => Ok(default),
    }
}
