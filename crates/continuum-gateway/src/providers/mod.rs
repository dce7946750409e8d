//! Provider adapters
//!
//! Every backend is wrapped behind [`ProviderAdapter`]: one call that turns a
//! [`CompletionRequest`] into a lazy stream of normalized chunks. Errors
//! returned by [`ProviderAdapter::stream`] itself happen before any output;
//! errors yielded by the stream happen after the exchange has started.
//! Dropping the stream drops the backend response and releases its connection.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::config::ProviderSettings;
use crate::types::{CompletionChunk, CompletionRequest};
use crate::{GatewayError, Result};

pub mod ollama;
pub mod openai;

#[cfg(test)]
pub(crate) mod scripted;

pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// Lazy, cancellable sequence of chunks produced by one adapter call
pub type ChunkStream = BoxStream<'static, Result<CompletionChunk>>;

/// Longest single line accepted from a provider body
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Streaming completion capability shared by every provider
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name, as used in the model binding table
    fn name(&self) -> &str;

    /// Start a completion. The returned stream ends with exactly one terminal chunk
    /// or an error.
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream>;
}

/// Provider variants the gateway knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Ollama,
    OpenAi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "openai" => Ok(ProviderKind::OpenAi),
            other => Err(GatewayError::InvalidConfig(format!(
                "unsupported provider '{}'",
                other
            ))),
        }
    }
}

/// Build the adapter for a provider kind. Returns `Ok(None)` when the provider
/// is known but not usable with the current settings (e.g. no API key).
pub fn build_adapter(
    kind: ProviderKind,
    settings: &ProviderSettings,
) -> Result<Option<Arc<dyn ProviderAdapter>>> {
    match kind {
        ProviderKind::Ollama => Ok(Some(Arc::new(OllamaAdapter::new(&settings.ollama)?))),
        ProviderKind::OpenAi => match settings.openai.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(Some(Arc::new(OpenAiAdapter::new(
                &settings.openai,
                key,
            )?))),
            _ => {
                tracing::warn!(
                    "OpenAI provider configured but {} is not set",
                    settings.openai.api_key_env
                );
                Ok(None)
            }
        },
    }
}

pub(crate) fn http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| GatewayError::InvalidConfig(format!("failed to create HTTP client: {}", e)))
}

/// Send a request, bounding the wait for response headers and mapping
/// non-success statuses. Everything here happens before any output.
pub(crate) async fn send(
    provider: &str,
    builder: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let response = match tokio::time::timeout(timeout, builder.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            return Err(GatewayError::ProviderUnavailable(format!(
                "{}: {}",
                provider, e
            )))
        }
        Err(_) => {
            return Err(GatewayError::ProviderUnavailable(format!(
                "{}: no response within {}s",
                provider,
                timeout.as_secs()
            )))
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::ProviderUnavailable(format!(
            "{} API error {}: {}",
            provider,
            status.as_u16(),
            body.trim()
        )));
    }
    Ok(response)
}

/// Turns one line of a provider body into at most one chunk.
pub(crate) trait LineParser: Send + 'static {
    fn parse_line(&mut self, line: &str) -> Result<Option<CompletionChunk>>;

    /// Called when the body ends. Returns the terminal chunk if the provider
    /// had already signalled completion.
    fn finish(&mut self) -> Option<CompletionChunk>;
}

struct LineState<P> {
    lines: BoxStream<'static, std::io::Result<String>>,
    parser: P,
    idle_timeout: Duration,
}

/// Adapt a line-oriented streaming body (NDJSON or SSE) into a chunk stream.
/// The stream stops right after the terminal chunk.
pub(crate) fn line_stream<P: LineParser>(
    response: reqwest::Response,
    parser: P,
    idle_timeout: Duration,
) -> ChunkStream {
    let bytes = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let lines = FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    )
    .map(|line| line.map_err(std::io::Error::other))
    .boxed();

    let state = LineState {
        lines,
        parser,
        idle_timeout,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            match tokio::time::timeout(state.idle_timeout, state.lines.next()).await {
                Err(_) => {
                    let err = GatewayError::ProviderStreamFailed(format!(
                        "no data for {}s",
                        state.idle_timeout.as_secs()
                    ));
                    return Some((Err(err), None));
                }
                Ok(None) => {
                    let item = state.parser.finish().ok_or_else(|| {
                        GatewayError::ProviderStreamFailed(
                            "connection closed before completion".to_string(),
                        )
                    });
                    return Some((item, None));
                }
                Ok(Some(Err(e))) => {
                    return Some((Err(GatewayError::ProviderStreamFailed(e.to_string())), None));
                }
                Ok(Some(Ok(line))) => match state.parser.parse_line(&line) {
                    Ok(None) => continue,
                    Ok(Some(chunk)) => {
                        let next = if chunk.is_terminal() { None } else { Some(state) };
                        return Some((Ok(chunk), next));
                    }
                    Err(e) => return Some((Err(e), None)),
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert!("anthropic".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
    }

    #[test]
    fn test_openai_without_key_is_skipped() {
        let settings = ProviderSettings::default();
        let adapter = build_adapter(ProviderKind::OpenAi, &settings).unwrap();
        assert!(adapter.is_none());

        let adapter = build_adapter(ProviderKind::Ollama, &settings).unwrap();
        assert_eq!(adapter.unwrap().name(), "ollama");
    }

    #[test]
    fn test_openai_with_key_is_built() {
        let mut settings = ProviderSettings::default();
        settings.openai.api_key = Some("sk-test".to_string());
        let adapter = build_adapter(ProviderKind::OpenAi, &settings).unwrap();
        assert_eq!(adapter.unwrap().name(), "openai");
    }
}
