//! Canned adapter for unit tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ChunkStream, ProviderAdapter};
use crate::types::{CompletionChunk, CompletionRequest};
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Chunk(CompletionChunk),
    Fail(String),
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedAdapter {
    steps: Vec<Step>,
    unavailable_calls: usize,
    hang: bool,
    start_delay: Option<Duration>,
    released: Option<Arc<AtomicBool>>,
    calls: AtomicUsize,
}

/// Sets its flag when the stream holding it is dropped.
struct Release(Arc<AtomicBool>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ScriptedAdapter {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Deltas followed by a normal terminal chunk.
    pub(crate) fn replying(deltas: &[&str]) -> Self {
        let mut steps: Vec<Step> = deltas
            .iter()
            .map(|d| Step::Chunk(CompletionChunk::delta(*d)))
            .collect();
        steps.push(Step::Chunk(CompletionChunk::finished(
            crate::types::FinishReason::Stop,
            None,
        )));
        Self::new(steps)
    }

    /// Fail the first `n` calls before any output.
    pub(crate) fn unavailable_for(mut self, n: usize) -> Self {
        self.unavailable_calls = n;
        self
    }

    /// Never finish after the scripted steps.
    pub(crate) fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Wait before answering, as a slow backend would.
    pub(crate) fn starting_after(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Raise `flag` once the returned stream is dropped.
    pub(crate) fn releasing(mut self, flag: Arc<AtomicBool>) -> Self {
        self.released = Some(flag);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, _request: CompletionRequest) -> Result<ChunkStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.unavailable_calls {
            return Err(GatewayError::ProviderUnavailable("scripted outage".to_string()));
        }

        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }

        let items = stream::iter(self.steps.clone().into_iter().map(|step| match step {
            Step::Chunk(chunk) => Ok(chunk),
            Step::Fail(message) => Err(GatewayError::ProviderStreamFailed(message)),
        }));
        let items = if self.hang {
            items.chain(stream::pending()).boxed()
        } else {
            items.boxed()
        };
        match self.released.clone() {
            Some(flag) => {
                let release = Release(flag);
                Ok(items
                    .map(move |item| {
                        let _held = &release;
                        item
                    })
                    .boxed())
            }
            None => Ok(items),
        }
    }
}
