//! Startup configuration for the orchestration core.
//!
//! [`Config`] is the single object the rest of the crate is constructed from: provider
//! descriptors in fallback order, worker-pool sizing, retry parameters, timeouts, and
//! storage directories. Callers build one at process start and hand it (or an `Arc`
//! around it) to every constructor that needs it — nothing in this crate reaches for a
//! global singleton to find its configuration.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::Config;
//!
//! let config = Config::default()
//!     .with_worker_pool_size(8)
//!     .with_max_attempts(3);
//!
//! assert_eq!(config.worker_pool_size, 8);
//! assert_eq!(config.retry.max_attempts, 3);
//! ```

use crate::core::provider::ProviderDescriptor;
use std::path::PathBuf;
use std::time::Duration;

/// Retry parameters shared by the Provider Dispatcher (local transport retries) and the
/// Task Orchestrator (exponential backoff between attempts).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before a task is marked `FAILED` (§4.7).
    pub max_attempts: u32,
    /// Base backoff duration; attempt `n` waits roughly `base * 2^(n-1)`.
    pub base_backoff: Duration,
    /// Upper bound on backoff regardless of attempt count.
    pub cap_backoff: Duration,
    /// Jitter applied to each backoff as a fraction (`0.2` == ±20%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            cap_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Default deadlines applied at each suspension point (§5).
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Per-provider-call deadline (C1).
    pub provider_call: Duration,
    /// Per-tool-invocation deadline (C4 via C2).
    pub tool_call: Duration,
    /// Per-vector-search deadline (C3).
    pub vector_search: Duration,
    /// Whole-workflow deadline (C5).
    pub workflow: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provider_call: Duration::from_secs(30),
            tool_call: Duration::from_secs(60),
            vector_search: Duration::from_secs(10),
            workflow: Duration::from_secs(300),
        }
    }
}

/// Task Orchestrator scheduling knobs (§4.7): worker-pool size, dispatch queue bound,
/// lease duration, and the retention window for terminal tasks.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent worker tasks (`W`).
    pub worker_pool_size: usize,
    /// Bounded in-memory dispatch queue capacity (`Q`).
    pub queue_capacity: usize,
    /// Time-bounded claim a worker holds on a task before it is reclaimable.
    pub lease_duration: Duration,
    /// How long terminal tasks are kept before `periodic_cleanup` removes them.
    pub retention_window: Duration,
    /// Directory the durable task log is written to.
    pub task_log_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            queue_capacity: 256,
            lease_duration: Duration::from_secs(60),
            retention_window: Duration::from_secs(24 * 3600),
            task_log_dir: PathBuf::from("task_log"),
        }
    }
}

/// The top-level startup configuration object described in §6.
///
/// Intentionally plain data — no file-format parsing dependency is introduced here.
/// A binary embedding this crate is free to populate one from a TOML/JSON file with
/// `serde`; this type only needs `Deserialize` to make that possible.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider descriptors in fallback order (§4.1).
    pub providers: Vec<ProviderDescriptor>,
    /// Worker pool / dispatch queue / lease / retention settings (§4.7).
    pub worker_pool_size: usize,
    pub queue_capacity: usize,
    pub lease_duration: Duration,
    pub retention_window: Duration,
    pub task_log_dir: PathBuf,
    /// Retry parameters shared by C1 and C7.
    pub retry: RetryConfig,
    /// Default deadlines (§5).
    pub timeouts: TimeoutConfig,
    /// Directory the reference `ConversationStore` implementation persists into (§4.6).
    pub conversation_log_dir: PathBuf,
}

impl Config {
    /// Pull the orchestrator-specific subset of fields into an [`OrchestratorConfig`].
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            worker_pool_size: self.worker_pool_size,
            queue_capacity: self.queue_capacity,
            lease_duration: self.lease_duration,
            retention_window: self.retention_window,
            task_log_dir: self.task_log_dir.clone(),
        }
    }

    /// Builder method: override the worker-pool size (`W`).
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Builder method: override the retry max-attempts shared by C1 and C7.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Builder method: append a provider descriptor to the fallback chain.
    pub fn with_provider(mut self, descriptor: ProviderDescriptor) -> Self {
        self.providers.push(descriptor);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            worker_pool_size: OrchestratorConfig::default().worker_pool_size,
            queue_capacity: OrchestratorConfig::default().queue_capacity,
            lease_duration: OrchestratorConfig::default().lease_duration,
            retention_window: OrchestratorConfig::default().retention_window,
            task_log_dir: OrchestratorConfig::default().task_log_dir,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            conversation_log_dir: PathBuf::from("conversations"),
        }
    }
}
