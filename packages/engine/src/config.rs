//! Engine configuration from the environment.
//!
//! Parsed once at startup into an owned value and passed explicitly.
//! Unset variables fall back to the documented defaults; malformed values
//! are an error, not a silent fallback.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use conveyor::RetentionPolicy;

use crate::coordinator::QueueName;
use crate::risk::RiskPolicy;

/// Runtime configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker-pool parallelism per queue.
    pub plan_concurrency: usize,
    pub transaction_concurrency: usize,
    pub simulation_concurrency: usize,
    pub notification_concurrency: usize,

    /// Risk thresholds.
    pub risk: RiskPolicy,

    /// How long a pending approval lives before the sweep expires it.
    pub approval_ttl: Duration,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,

    /// Terminal-job retention per queue.
    pub retention: RetentionPolicy,
    /// How often retention is enforced.
    pub retention_interval: Duration,

    /// chain-id → RPC endpoint overrides, for adapter construction.
    pub chain_rpc_overrides: HashMap<i64, String>,

    /// Submissions allowed per caller per window.
    pub submit_rate_limit: usize,
    pub submit_rate_window: Duration,

    /// Broadcast retry budget within one job.
    pub broadcast_attempts: u32,
    /// Exponential backoff base between broadcast attempts.
    pub broadcast_backoff: Duration,
    /// Hard ceiling on receipt polling.
    pub confirm_timeout: Duration,
    /// Interval between receipt polls.
    pub confirm_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plan_concurrency: QueueName::Plan.default_concurrency(),
            transaction_concurrency: QueueName::Transaction.default_concurrency(),
            simulation_concurrency: QueueName::Simulation.default_concurrency(),
            notification_concurrency: QueueName::Notification.default_concurrency(),
            risk: RiskPolicy::default(),
            approval_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            retention: RetentionPolicy::default(),
            retention_interval: Duration::from_secs(5 * 60),
            chain_rpc_overrides: HashMap::new(),
            submit_rate_limit: 30,
            submit_rate_window: Duration::from_secs(60),
            broadcast_attempts: 3,
            broadcast_backoff: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(120),
            confirm_interval: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    /// Load from the environment (after `dotenvy` has populated it from
    /// any `.env` file).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            plan_concurrency: read_var("PLAN_CONCURRENCY", defaults.plan_concurrency)?,
            transaction_concurrency: read_var(
                "TRANSACTION_CONCURRENCY",
                defaults.transaction_concurrency,
            )?,
            simulation_concurrency: read_var(
                "SIMULATION_CONCURRENCY",
                defaults.simulation_concurrency,
            )?,
            notification_concurrency: read_var(
                "NOTIFICATION_CONCURRENCY",
                defaults.notification_concurrency,
            )?,
            risk: RiskPolicy {
                approval_threshold: read_ratio("APPROVAL_THRESHOLD", defaults.risk.approval_threshold)?,
                block_threshold: read_ratio("BLOCK_THRESHOLD", defaults.risk.block_threshold)?,
                max_risk_score: read_ratio("MAX_RISK_SCORE", defaults.risk.max_risk_score)?,
            },
            approval_ttl: Duration::from_secs(
                read_var("APPROVAL_TTL_MINUTES", 60u64)? * 60,
            ),
            sweep_interval: Duration::from_secs(read_var("APPROVAL_SWEEP_SECS", 60u64)?),
            retention: RetentionPolicy {
                keep_completed: read_var("KEEP_COMPLETED", defaults.retention.keep_completed)?,
                keep_failed: read_var("KEEP_FAILED", defaults.retention.keep_failed)?,
            },
            retention_interval: Duration::from_secs(read_var("RETENTION_SWEEP_SECS", 300u64)?),
            chain_rpc_overrides: parse_rpc_overrides(
                &std::env::var("CHAIN_RPC_OVERRIDES").unwrap_or_default(),
            )?,
            submit_rate_limit: read_var("SUBMIT_RATE_LIMIT", defaults.submit_rate_limit)?,
            submit_rate_window: Duration::from_secs(read_var("SUBMIT_RATE_WINDOW_SECS", 60u64)?),
            broadcast_attempts: read_var("BROADCAST_ATTEMPTS", defaults.broadcast_attempts)?,
            broadcast_backoff: Duration::from_millis(read_var("BROADCAST_BACKOFF_MS", 2_000u64)?),
            confirm_timeout: Duration::from_secs(read_var("CONFIRM_TIMEOUT_SECS", 120u64)?),
            confirm_interval: Duration::from_millis(read_var("CONFIRM_INTERVAL_MS", 3_000u64)?),
        })
    }

    /// Parallelism for one queue.
    pub fn concurrency(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::Plan => self.plan_concurrency,
            QueueName::Transaction => self.transaction_concurrency,
            QueueName::Simulation => self.simulation_concurrency,
            QueueName::Notification => self.notification_concurrency,
        }
    }
}

fn read_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn read_ratio(name: &str, default: f64) -> Result<f64> {
    let value: f64 = read_var(name, default)?;
    if !(0.0..=1.0).contains(&value) {
        bail!("{name} must be within [0, 1], got {value}");
    }
    Ok(value)
}

/// Parse `chain_id=url` pairs separated by commas, e.g.
/// `42220=https://forno.celo.org,1=https://eth.example`.
fn parse_rpc_overrides(raw: &str) -> Result<HashMap<i64, String>> {
    let mut overrides = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((chain, url)) = pair.split_once('=') else {
            bail!("malformed CHAIN_RPC_OVERRIDES entry: {pair:?}");
        };
        let chain_id: i64 = chain
            .trim()
            .parse()
            .with_context(|| format!("invalid chain id in CHAIN_RPC_OVERRIDES: {chain:?}"))?;
        overrides.insert(chain_id, url.trim().to_string());
    }
    Ok(overrides)
}
