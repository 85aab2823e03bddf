//! Provider Dispatcher (C1): routes a generation request through an ordered list of
//! LLM providers with fallback, per-provider timeouts, and back-off tracking.
//!
//! Concrete vendor backends implement the narrow [`Provider`] trait; the dispatcher
//! never branches on vendor identity, it only ever sees the trait object. See
//! [`crate::core::providers`] for the shipped backends.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::core::provider::{
//!     GenerationParams, Provider, ProviderDescriptor, ProviderDispatcher, ProviderKind,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Stub(&'static str);
//!
//! #[async_trait]
//! impl Provider for Stub {
//!     async fn generate(
//!         &self,
//!         _prompt: &str,
//!         _params: &GenerationParams,
//!     ) -> Result<agentmesh::core::provider::GenerationOutcome, agentmesh::core::provider::ProviderCallError> {
//!         Ok(agentmesh::core::provider::GenerationOutcome {
//!             text: self.0.to_string(),
//!             input_tokens: 10,
//!             output_tokens: 5,
//!         })
//!     }
//! }
//!
//! # async {
//! let dispatcher = ProviderDispatcher::new(vec![(
//!     ProviderDescriptor::new("primary", ProviderKind::OpenAiCompatible, "gpt-4o-mini")
//!         .with_timeout(Duration::from_secs(5)),
//!     Arc::new(Stub("hello")) as Arc<dyn Provider>,
//! )]);
//!
//! let result = dispatcher.generate("hi", &GenerationParams::default()).await.unwrap();
//! assert_eq!(result.text, "hello");
//! assert_eq!(result.provider_used, "primary");
//! # };
//! ```

use async_trait::async_trait;
use log::{error, warn};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Which wire format a [`ProviderDescriptor`] speaks. New vendors add a variant here and
/// a matching [`Provider`] implementation under [`crate::core::providers`]; the
/// dispatcher itself never inspects this field, it is informational and used by
/// whichever code constructs the `(descriptor, backend)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// An OpenAI-compatible chat-completions HTTP endpoint.
    OpenAiCompatible,
    /// A vendor-specific backend identified by name (e.g. `"anthropic-messages"`).
    Custom(String),
}

/// `(kind, model identifier, endpoint URL, credentials handle, timeout, retry budget)` (§3).
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    /// Stable identifier used in traces and logs (e.g. `"openai-primary"`).
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    pub endpoint: Option<String>,
    /// Opaque credentials handle (e.g. an env var name); never logged.
    pub credentials: Option<String>,
    pub timeout: Duration,
    /// Local transport-retry budget `Rᵢ` (§4.1 step 1).
    pub retry_budget: u32,
}

impl ProviderDescriptor {
    /// Construct a descriptor with a 30s timeout and no local retries, matching §5's
    /// default provider-call deadline.
    pub fn new(id: impl Into<String>, kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            model: model.into(),
            endpoint: None,
            credentials: None,
            timeout: Duration::from_secs(30),
            retry_budget: 0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }
}

/// Sampling parameters forwarded to a provider on each call.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// What a [`Provider`] returns on success. Latency is measured by the dispatcher, not
/// the backend, so it is not part of this type.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Failure kinds a [`Provider`] backend may raise. These map onto the `ProviderTransient`
/// / `ProviderAuth` / `ProviderRateLimited` rows of §7's error taxonomy.
#[derive(Debug, Clone)]
pub enum ProviderCallError {
    /// A transport-level failure worth retrying (connection reset, 5xx, timeout).
    Transient(String),
    /// Unrecoverable authentication failure; the dispatcher moves to the next provider
    /// without retrying this one.
    Auth(String),
    /// The provider responded with a rate-limit signal; `retry_after` is the backend's
    /// hint for how long to back off, if it provided one.
    RateLimited { retry_after: Option<Duration> },
}

impl fmt::Display for ProviderCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderCallError::Transient(msg) => write!(f, "transient provider error: {}", msg),
            ProviderCallError::Auth(msg) => write!(f, "provider authentication failed: {}", msg),
            ProviderCallError::RateLimited { retry_after } => {
                write!(f, "provider rate limited, retry_after={:?}", retry_after)
            }
        }
    }
}

impl Error for ProviderCallError {}

/// Narrow trait every vendor backend implements. `Send + Sync` so backends can be
/// shared behind `Arc` across concurrent agent invocations.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Issue one generation attempt. Implementations are responsible for translating
    /// `prompt`/`params` into their wire format and back; the dispatcher applies the
    /// timeout and retry/fallback policy around this call, not the backend.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutcome, ProviderCallError>;
}

/// Returned by [`ProviderDispatcher::generate`] on success: `(text, provider_used,
/// tokens_used, latency)` (§4.1).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub text: String,
    pub provider_used: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
}

/// Per-provider failure recorded when all providers are exhausted.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub reason: String,
}

/// Error surface of the Provider Dispatcher (§7: `ProviderTransient`/`ProviderAuth`/
/// `ProviderRateLimited` all fold into `AllProvidersExhausted` once every provider in
/// the chain has failed).
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Every provider in the chain failed; carries the per-provider failure reasons in
    /// chain order.
    AllProvidersExhausted(Vec<ProviderFailure>),
    /// The dispatcher was constructed with an empty provider list.
    NoProvidersConfigured,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::AllProvidersExhausted(failures) => {
                write!(f, "all providers exhausted: ")?;
                for (i, failure) in failures.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}: {}", failure.provider_id, failure.reason)?;
                }
                Ok(())
            }
            ProviderError::NoProvidersConfigured => write!(f, "no providers configured"),
        }
    }
}

impl Error for ProviderError {}

/// Per-provider ephemeral state: `available | backing-off(until T)` (§4.1).
struct BackoffState {
    until: Instant,
}

/// Routes [`ProviderDispatcher::generate`] calls through an ordered chain of
/// `(descriptor, backend)` pairs, skipping providers still in their back-off window and
/// falling through to the next provider on any recoverable failure.
pub struct ProviderDispatcher {
    chain: Vec<(ProviderDescriptor, std::sync::Arc<dyn Provider>)>,
    backoff: RwLock<HashMap<String, BackoffState>>,
}

impl ProviderDispatcher {
    /// Build a dispatcher from an ordered fallback chain. The order of `chain` is the
    /// fallback order (§4.1): `chain[0]` is tried first.
    pub fn new(chain: Vec<(ProviderDescriptor, std::sync::Arc<dyn Provider>)>) -> Self {
        Self {
            chain,
            backoff: RwLock::new(HashMap::new()),
        }
    }

    fn is_backing_off(&self, provider_id: &str) -> bool {
        let backoff = self.backoff.read().unwrap();
        backoff
            .get(provider_id)
            .map(|state| Instant::now() < state.until)
            .unwrap_or(false)
    }

    fn set_backoff(&self, provider_id: &str, duration: Duration) {
        let mut backoff = self.backoff.write().unwrap();
        backoff.insert(
            provider_id.to_string(),
            BackoffState {
                until: Instant::now() + duration,
            },
        );
    }

    /// Run the §4.1 algorithm: try each provider in order, honoring its timeout and
    /// local retry budget, skipping providers still backing off, and surfacing
    /// `AllProvidersExhausted` only once every provider has been tried.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<DispatchOutcome, ProviderError> {
        if self.chain.is_empty() {
            return Err(ProviderError::NoProvidersConfigured);
        }

        let mut failures = Vec::new();

        for (descriptor, backend) in &self.chain {
            if self.is_backing_off(&descriptor.id) {
                failures.push(ProviderFailure {
                    provider_id: descriptor.id.clone(),
                    reason: "skipped: backing off".to_string(),
                });
                continue;
            }

            let attempts = descriptor.retry_budget + 1;
            let mut last_reason = String::new();
            let mut succeeded = None;
            let started = Instant::now();

            for attempt in 0..attempts {
                let call = tokio::time::timeout(
                    descriptor.timeout,
                    backend.generate(prompt, params),
                )
                .await;

                match call {
                    Err(_elapsed) => {
                        last_reason = format!(
                            "timeout after {:?} (attempt {}/{})",
                            descriptor.timeout,
                            attempt + 1,
                            attempts
                        );
                        warn!("provider {} {}", descriptor.id, last_reason);
                        continue;
                    }
                    Ok(Err(ProviderCallError::Auth(msg))) => {
                        last_reason = format!("auth failure: {}", msg);
                        error!("provider {} {}", descriptor.id, last_reason);
                        break;
                    }
                    Ok(Err(ProviderCallError::RateLimited { retry_after })) => {
                        let backoff = retry_after.unwrap_or(Duration::from_secs(5));
                        self.set_backoff(&descriptor.id, backoff);
                        last_reason = format!("rate limited, backing off {:?}", backoff);
                        warn!("provider {} {}", descriptor.id, last_reason);
                        break;
                    }
                    Ok(Err(ProviderCallError::Transient(msg))) => {
                        last_reason = format!("transient error: {} (attempt {}/{})", msg, attempt + 1, attempts);
                        warn!("provider {} {}", descriptor.id, last_reason);
                        continue;
                    }
                    Ok(Ok(outcome)) => {
                        succeeded = Some(outcome);
                        break;
                    }
                }
            }

            if let Some(outcome) = succeeded {
                return Ok(DispatchOutcome {
                    text: outcome.text,
                    provider_used: descriptor.id.clone(),
                    input_tokens: outcome.input_tokens,
                    output_tokens: outcome.output_tokens,
                    latency: started.elapsed(),
                });
            }

            failures.push(ProviderFailure {
                provider_id: descriptor.id.clone(),
                reason: last_reason,
            });
        }

        Err(ProviderError::AllProvidersExhausted(failures))
    }
}
