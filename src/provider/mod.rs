//! Provider invocation contract
//!
//! What this module provides
//! - The uniform call shape every LLM backend is consumed through:
//!   `Service<ProviderRequest, Response = ProviderResponse, Error = BoxError>`
//! - Request/response models; the payload is opaque beyond model id, token counts and text
//!
//! Exports
//! - Models
//!   - `ProviderRequest { messages, model, params, options }`
//!   - `ProviderResponse { text, usage, finish_reason, provider_id, model }`
//!   - `TokenUsage { prompt_tokens, completion_tokens }` (each nullable)
//! - Services
//!   - `ProviderSvc`: the boxed, cloneable provider service stored in fallback chains
//!   - `ScriptedProvider`: replays a fixed script of results, for tests and simulations
//! - Utils
//!   - `ProviderSlot`: one fallback-chain entry (id, service, retry policy, enabled flag)
//!
//! Implementation strategy
//! - Concrete network clients live outside this crate; they plug in as any Tower service
//! - Failures are reported as `ProviderError` (boxed) and mapped with `error::classify`
//! - An optional per-call timeout is applied with `tower::timeout`, surfacing as `Timeout`

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceBuilder};

use crate::config::{ProviderEntry, RetryPolicy};
use crate::error::{ErrorKind, ProviderError};

/// One chat message of the request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Immutable request handed to every provider in a chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub messages: Vec<Message>,
    pub model: String,
    /// Generation parameters (temperature, max_tokens, ...)
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Per-provider settings such as credentials or a streaming flag
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Single user-message request.
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(model).message("user", prompt)
    }

    pub fn message(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.messages.push(Message {
            role: role.into(),
            content: content.into(),
        });
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// Token accounting for one call. `None` means the provider could not measure it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        }
    }

    pub fn unmeasured() -> Self {
        Self::default()
    }

    /// Sum of both counts, or `None` if either side is unmeasured.
    pub fn total(&self) -> Option<u64> {
        Some(self.prompt_tokens? + self.completion_tokens?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub provider_id: String,
    /// Model actually served, which may differ from the requested one
    pub model: String,
}

/// Boxed provider service as stored in a fallback chain.
pub type ProviderSvc = BoxCloneSyncService<ProviderRequest, ProviderResponse, BoxError>;

/// A fallback-chain entry.
#[derive(Clone)]
pub struct ProviderSlot {
    pub id: String,
    pub service: ProviderSvc,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub repeat: bool,
}

impl fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .field("repeat", &self.repeat)
            .finish_non_exhaustive()
    }
}

impl ProviderSlot {
    pub fn new<S>(id: impl Into<String>, service: S) -> Self
    where
        S: Service<ProviderRequest, Response = ProviderResponse, Error = BoxError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            id: id.into(),
            service: BoxCloneSyncService::new(service),
            retry: RetryPolicy::default(),
            enabled: true,
            repeat: false,
        }
    }

    /// Build a slot from a configured entry and the service the registry resolved for it.
    pub fn from_entry<S>(entry: &ProviderEntry, service: S) -> Self
    where
        S: Service<ProviderRequest, Response = ProviderResponse, Error = BoxError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let mut slot = Self::new(entry.id.clone(), service).retry(entry.retry.clone());
        slot.enabled = entry.enabled;
        slot.repeat = entry.repeat;
        slot
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Bound each individual call; an elapsed call is classified as `Timeout`.
    pub fn call_timeout(mut self, dur: Duration) -> Self {
        let inner = self.service.clone();
        self.service = BoxCloneSyncService::new(ServiceBuilder::new().timeout(dur).service(inner));
        self
    }
}

/// One scripted reaction of a [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply {
        text: String,
        usage: TokenUsage,
        delay: Duration,
    },
    Fail {
        kind: ErrorKind,
        delay: Duration,
    },
}

impl ScriptStep {
    pub fn reply(text: impl Into<String>) -> Self {
        ScriptStep::Reply {
            text: text.into(),
            usage: TokenUsage::new(10, 5),
            delay: Duration::ZERO,
        }
    }

    pub fn fail(kind: ErrorKind) -> Self {
        ScriptStep::Fail {
            kind,
            delay: Duration::ZERO,
        }
    }

    pub fn after(self, d: Duration) -> Self {
        match self {
            ScriptStep::Reply { text, usage, .. } => ScriptStep::Reply {
                text,
                usage,
                delay: d,
            },
            ScriptStep::Fail { kind, .. } => ScriptStep::Fail { kind, delay: d },
        }
    }

    pub fn with_usage(self, usage: TokenUsage) -> Self {
        match self {
            ScriptStep::Reply { text, delay, .. } => ScriptStep::Reply { text, usage, delay },
            other => other,
        }
    }
}

/// Provider that replays a script of replies/failures in order.
///
/// Once the script runs out the last step repeats, so `[fail(Fatal)]` is an always-failing
/// provider and `[reply("x")]` an always-succeeding one.
#[derive(Clone)]
pub struct ScriptedProvider {
    id: String,
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            id: id.into(),
            script: Arc::new(Mutex::new(steps.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, vec![ScriptStep::reply(text)])
    }

    pub fn failing(id: impl Into<String>, kind: ErrorKind) -> Self {
        Self::new(id, vec![ScriptStep::fail(kind)])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of times the provider has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wrap into a chain slot with the provider's own id.
    pub fn slot(&self) -> ProviderSlot {
        ProviderSlot::new(self.id.clone(), self.clone())
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

impl Service<ProviderRequest> for ScriptedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ProviderRequest) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        let id = self.id.clone();
        Box::pin(async move {
            match step {
                Some(ScriptStep::Reply { text, usage, delay }) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(ProviderResponse {
                        text,
                        usage,
                        finish_reason: Some("stop".to_string()),
                        provider_id: id,
                        model: req.model,
                    })
                }
                Some(ScriptStep::Fail { kind, delay }) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Err(Box::new(ProviderError::new(kind, format!("scripted failure from {}", id)))
                        as BoxError)
                }
                None => Err(Box::new(ProviderError::fatal(format!(
                    "provider {} has an empty script",
                    id
                ))) as BoxError),
            }
        })
    }
}
