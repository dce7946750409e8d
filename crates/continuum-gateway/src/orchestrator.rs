//! Request orchestration
//!
//! The single call path shared by the HTTP façade and the wire server:
//! authenticate, authorize, resolve, admit, then stream.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{GatewayConfig, IdentitiesFile, ModelsFile};
use crate::identity::{Identity, IdentityTable};
use crate::rate_limit::{Admission, RateLimiter};
use crate::router::{CompletionStream, ModelRouter};
use crate::types::{CompletionChunk, CompletionRequest};
use crate::{GatewayError, Result};

/// Composes the identity table, rate limiter and router
#[derive(Debug)]
pub struct Orchestrator {
    identities: Arc<IdentityTable>,
    limiter: Arc<RateLimiter>,
    router: Arc<ModelRouter>,
    request_timeout: Duration,
}

impl Orchestrator {
    pub fn new(identities: Arc<IdentityTable>, router: Arc<ModelRouter>) -> Self {
        Self {
            identities,
            limiter: Arc::new(RateLimiter::new()),
            router,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Load the identity and model tables named by the configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let identities = match config.identities_path.as_deref() {
            Some(path) => IdentityTable::from_entries(&IdentitiesFile::from_file(path)?.users)?,
            None => {
                tracing::warn!("No identity table configured; every request will be rejected");
                IdentityTable::default()
            }
        };

        let models = match config.models_path.as_deref() {
            Some(path) => ModelsFile::from_file(path)?.models,
            None => {
                tracing::warn!("No model table configured");
                Vec::new()
            }
        };
        let router = ModelRouter::from_entries(
            &models,
            &config.providers,
            config.limits.retry_unavailable_once,
        )?;

        Ok(Self::new(Arc::new(identities), Arc::new(router))
            .with_request_timeout(Duration::from_secs(config.limits.request_timeout_secs)))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn authenticate(&self, token: &str) -> Result<Arc<Identity>> {
        self.identities.authenticate(token)
    }

    /// Bound models the identity may use, sorted.
    pub fn visible_models(&self, identity: &Identity) -> Vec<String> {
        self.router
            .available_models()
            .into_iter()
            .filter(|model| self.identities.authorize(identity, model))
            .collect()
    }

    /// Run one completion through the gate and into its provider.
    ///
    /// Gate failures are returned before any adapter is invoked. Once a
    /// stream is returned it always ends with exactly one terminal chunk.
    pub async fn complete(&self, token: &str, request: CompletionRequest) -> Result<CompletionStream> {
        let deadline = Instant::now() + self.request_timeout;
        request.validate()?;

        let identity = self.identities.authenticate(token)?;
        if !self.identities.authorize(&identity, &request.model) {
            tracing::warn!(identity = %identity.name, model = %request.model, "Model not permitted");
            return Err(GatewayError::Forbidden(request.model));
        }

        // Resolve before admitting so unknown models never consume quota.
        self.router.resolve(&request.model)?;

        if let admission @ Admission::RateLimited { .. } = self.limiter.admit(&identity) {
            return Err(GatewayError::RateLimited {
                retry_after_secs: admission.retry_after_secs().unwrap_or(1),
            });
        }

        tracing::info!(
            identity = %identity.name,
            model = %request.model,
            provider = self.router.binding(&request.model).unwrap_or("unknown"),
            "Completion admitted"
        );

        // Connecting and the retry attempt count against the same deadline.
        let chunks = match tokio::time::timeout_at(deadline, self.router.route(request)).await {
            Ok(routed) => routed?,
            Err(_) => {
                return Err(GatewayError::ProviderUnavailable(format!(
                    "no response within {:?}",
                    self.request_timeout
                )))
            }
        };
        Ok(with_deadline(chunks, deadline, self.request_timeout))
    }
}

/// End the sequence with an error chunk if it is still running at the deadline.
fn with_deadline(chunks: CompletionStream, deadline: Instant, timeout: Duration) -> CompletionStream {
    let deadline = Box::pin(tokio::time::sleep_until(deadline));

    stream::unfold(Some((chunks, deadline)), move |state| async move {
        let (mut chunks, mut deadline) = state?;
        tokio::select! {
            biased;

            chunk = chunks.next() => chunk.map(|chunk| {
                let next = if chunk.is_terminal() {
                    None
                } else {
                    Some((chunks, deadline))
                };
                (chunk, next)
            }),
            _ = &mut deadline => {
                let err = GatewayError::ProviderStreamFailed(format!(
                    "request exceeded {:?}",
                    timeout
                ));
                tracing::warn!("{}", err);
                Some((CompletionChunk::failed(&err), None))
            }
        }
    })
    .boxed()
}
