//! Local inference through Ollama's `/api/chat` endpoint (NDJSON streaming)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{http_client, line_stream, send, ChunkStream, LineParser, ProviderAdapter};
use crate::config::OllamaSettings;
use crate::types::{ChatMessage, CompletionChunk, CompletionRequest, FinishReason, Usage};
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    base_url: String,
    idle_timeout: Duration,
    http_client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(settings: &OllamaSettings) -> Result<Self> {
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            http_client: http_client(Duration::from_secs(settings.connect_timeout_secs))?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: Options<'a>,
}

#[derive(Debug, Default, Serialize)]
struct Options<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

impl<'a> ChatRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        let settings = &request.settings;
        Self {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            options: Options {
                temperature: settings.temperature,
                num_predict: settings.max_tokens,
                top_p: settings.top_p,
                frequency_penalty: settings.frequency_penalty,
                presence_penalty: settings.presence_penalty,
                stop: (!settings.stop.is_empty()).then_some(settings.stop.as_slice()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatRecord {
    #[serde(default)]
    message: Option<RecordMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordMessage {
    #[serde(default)]
    content: String,
}

/// One JSON object per line; the record with `done: true` is terminal.
#[derive(Debug, Default)]
pub(crate) struct NdjsonParser;

impl LineParser for NdjsonParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<CompletionChunk>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let record: ChatRecord = serde_json::from_str(line).map_err(|e| {
            GatewayError::ProviderStreamFailed(format!("malformed ollama record: {}", e))
        })?;

        if let Some(error) = record.error {
            return Err(GatewayError::ProviderStreamFailed(format!("ollama: {}", error)));
        }

        let content = record.message.map(|m| m.content).unwrap_or_default();

        if record.done {
            let reason = record
                .done_reason
                .as_deref()
                .map(FinishReason::from_provider)
                .unwrap_or(FinishReason::Stop);
            let usage = match (record.prompt_eval_count, record.eval_count) {
                (None, None) => None,
                (prompt, completion) => {
                    Some(Usage::new(prompt.unwrap_or(0), completion.unwrap_or(0)))
                }
            };
            return Ok(Some(
                CompletionChunk::finished(reason, usage).with_delta(content),
            ));
        }

        if content.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CompletionChunk::delta(content)))
        }
    }

    fn finish(&mut self) -> Option<CompletionChunk> {
        None
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let body = ChatRequest::from_request(&request);
        let builder = self
            .http_client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);

        tracing::debug!(model = %request.model, "Starting ollama completion");
        let response = send("ollama", builder, self.idle_timeout).await?;
        Ok(line_stream(response, NdjsonParser, self.idle_timeout))
    }
}
