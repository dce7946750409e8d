//! Model router
//!
//! Maps each model identifier to the adapter of the provider it is bound to
//! and applies the provider failure policy. Whatever an adapter does, the
//! stream handed back to callers yields plain chunks and ends with exactly
//! one terminal chunk.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ModelEntry, ProviderSettings};
use crate::providers::{build_adapter, ChunkStream, ProviderAdapter, ProviderKind};
use crate::types::{CompletionChunk, CompletionRequest};
use crate::{GatewayError, Result};

/// Normalized chunk sequence as seen by transports. Failures after the
/// exchange started arrive as a terminal error chunk.
pub type CompletionStream = BoxStream<'static, CompletionChunk>;

#[derive(Clone)]
struct Binding {
    provider: String,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Static model binding table
pub struct ModelRouter {
    bindings: HashMap<String, Binding>,
    retry_unavailable_once: bool,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("models", &self.available_models())
            .field("retry_unavailable_once", &self.retry_unavailable_once)
            .finish()
    }
}

impl ModelRouter {
    pub fn new(retry_unavailable_once: bool) -> Self {
        Self {
            bindings: HashMap::new(),
            retry_unavailable_once,
        }
    }

    /// Build the table from configuration. One adapter instance is created per
    /// provider and shared by all models bound to it. Bindings whose provider
    /// is unknown or unusable are skipped with a warning.
    pub fn from_entries(
        entries: &[ModelEntry],
        settings: &ProviderSettings,
        retry_unavailable_once: bool,
    ) -> Result<Self> {
        let mut router = Self::new(retry_unavailable_once);
        let mut adapters: HashMap<ProviderKind, Option<Arc<dyn ProviderAdapter>>> =
            HashMap::new();

        for entry in entries {
            let kind: ProviderKind = match entry.provider.parse() {
                Ok(kind) => kind,
                Err(_) => {
                    tracing::warn!(
                        "Skipping model {}: unsupported provider '{}'",
                        entry.id,
                        entry.provider
                    );
                    continue;
                }
            };

            let adapter = match adapters.get(&kind) {
                Some(adapter) => adapter.clone(),
                None => {
                    let adapter = build_adapter(kind, settings)?;
                    adapters.insert(kind, adapter.clone());
                    adapter
                }
            };

            match adapter {
                Some(adapter) => router.bind(&entry.id, adapter)?,
                None => tracing::warn!("Skipping model {}: {} is not configured", entry.id, kind),
            }
        }

        tracing::info!(
            "Registered {} models across {} providers",
            router.bindings.len(),
            adapters.values().filter(|a| a.is_some()).count()
        );
        Ok(router)
    }

    /// Bind a model identifier to an adapter.
    pub fn bind(&mut self, model: &str, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        if self.bindings.contains_key(model) {
            return Err(GatewayError::InvalidConfig(format!(
                "model '{}' is bound more than once",
                model
            )));
        }
        tracing::debug!("Bound model {} to {}", model, adapter.name());
        self.bindings.insert(
            model.to_string(),
            Binding {
                provider: adapter.name().to_string(),
                adapter,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.bindings
            .get(model)
            .map(|binding| binding.adapter.clone())
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))
    }

    /// Provider name a model is bound to.
    pub fn binding(&self, model: &str) -> Option<&str> {
        self.bindings.get(model).map(|b| b.provider.as_str())
    }

    /// Bound model identifiers, sorted.
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.bindings.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Resolve the model and start streaming from its adapter.
    ///
    /// Errors returned here happened before any output. A provider that is
    /// unavailable on the first attempt is retried once against the same
    /// adapter when the policy allows it.
    pub async fn route(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let adapter = self.resolve(&request.model)?;
        let model = request.model.clone();

        let chunks = match adapter.stream(request.clone()).await {
            Err(GatewayError::ProviderUnavailable(reason)) if self.retry_unavailable_once => {
                tracing::warn!(
                    "{} unavailable for {}, retrying once: {}",
                    adapter.name(),
                    model,
                    reason
                );
                adapter.stream(request).await?
            }
            other => other?,
        };

        Ok(terminated(chunks, model))
    }
}

/// Enforce the single-terminal-chunk contract on an adapter stream.
fn terminated(chunks: ChunkStream, model: String) -> CompletionStream {
    stream::unfold(Some((chunks, model)), |state| async move {
        let (mut chunks, model) = state?;
        match chunks.next().await {
            Some(Ok(chunk)) if chunk.is_terminal() => Some((chunk, None)),
            Some(Ok(chunk)) => Some((chunk, Some((chunks, model)))),
            Some(Err(err)) => {
                let err = match err {
                    GatewayError::ProviderStreamFailed(_) => err,
                    other => GatewayError::ProviderStreamFailed(other.to_string()),
                };
                tracing::warn!("Stream for {} failed: {}", model, err);
                Some((CompletionChunk::failed(&err), None))
            }
            None => {
                let err = GatewayError::ProviderStreamFailed(
                    "stream ended without a terminal chunk".to_string(),
                );
                tracing::warn!("Stream for {} failed: {}", model, err);
                Some((CompletionChunk::failed(&err), None))
            }
        }
    })
    .boxed()
}
