//! Hosted completions through the OpenAI chat completions API
//!
//! Streaming requests are read as server-sent events. Non-streaming requests
//! read one JSON body and yield it as a single terminal chunk.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{http_client, line_stream, send, ChunkStream, LineParser, ProviderAdapter};
use crate::config::OpenAiSettings;
use crate::types::{ChatMessage, CompletionChunk, CompletionRequest, FinishReason, Usage};
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    api_key: String,
    base_url: String,
    idle_timeout: Duration,
    http_client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(settings: &OpenAiSettings, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            http_client: http_client(Duration::from_secs(settings.connect_timeout_secs))?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> ChatCompletionRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        let settings = &request.settings;
        Self {
            model: &request.model,
            messages: &request.messages,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            frequency_penalty: settings.frequency_penalty,
            presence_penalty: settings.presence_penalty,
            stop: (!settings.stop.is_empty()).then_some(settings.stop.as_slice()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<UsageInfo> for Usage {
    fn from(u: UsageInfo) -> Self {
        Usage::new(u.prompt_tokens, u.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Server-sent events. The finish reason and usage arrive on separate events,
/// so the terminal chunk is emitted at `[DONE]` (or at end of body once a
/// finish reason has been seen).
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl SseParser {
    fn terminal(&mut self) -> CompletionChunk {
        CompletionChunk::finished(
            self.finish_reason.take().unwrap_or(FinishReason::Stop),
            self.usage.take(),
        )
    }
}

impl LineParser for SseParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<CompletionChunk>> {
        let line = line.trim_end_matches('\r');
        // Blank separators, comments and non-data fields carry nothing for us.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            return Ok(Some(self.terminal()));
        }

        let event: StreamEvent = serde_json::from_str(data).map_err(|e| {
            GatewayError::ProviderStreamFailed(format!("malformed openai event: {}", e))
        })?;

        if let Some(error) = event.error {
            return Err(GatewayError::ProviderStreamFailed(format!(
                "openai: {}",
                error.message
            )));
        }
        if let Some(usage) = event.usage {
            self.usage = Some(usage.into());
        }

        let Some(choice) = event.choices.into_iter().next() else {
            return Ok(None);
        };
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = Some(FinishReason::from_provider(reason));
        }
        match choice.delta.and_then(|d| d.content) {
            Some(content) if !content.is_empty() => Ok(Some(CompletionChunk::delta(content))),
            _ => Ok(None),
        }
    }

    fn finish(&mut self) -> Option<CompletionChunk> {
        self.finish_reason.is_some().then(|| self.terminal())
    }
}

fn single_chunk(response: ChatCompletionResponse) -> Result<CompletionChunk> {
    let usage = response.usage.map(Usage::from);
    let choice = response.choices.into_iter().next().ok_or_else(|| {
        GatewayError::ProviderStreamFailed("openai response has no choices".to_string())
    })?;
    let reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::from_provider)
        .unwrap_or(FinishReason::Stop);
    Ok(CompletionChunk::finished(reason, usage).with_delta(choice.message.content.unwrap_or_default()))
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let body = ChatCompletionRequest::from_request(&request);
        let builder = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body);

        tracing::debug!(model = %request.model, stream = request.stream, "Starting openai completion");
        let response = send("openai", builder, self.idle_timeout).await?;

        if request.stream {
            return Ok(line_stream(response, SseParser::default(), self.idle_timeout));
        }

        // Still lazy: the body is only read when the caller polls.
        let idle_timeout = self.idle_timeout;
        let chunk = async move {
            let body = tokio::time::timeout(idle_timeout, response.json::<ChatCompletionResponse>())
                .await
                .map_err(|_| {
                    GatewayError::ProviderStreamFailed(format!(
                        "no response body within {}s",
                        idle_timeout.as_secs()
                    ))
                })?
                .map_err(|e| {
                    GatewayError::ProviderStreamFailed(format!("malformed openai response: {}", e))
                })?;
            single_chunk(body)
        };
        Ok(stream::once(chunk).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenerationSettings;

    #[test]
    fn test_streaming_request_body() {
        let request = CompletionRequest::new("gpt-4o", vec![ChatMessage::system("be brief")])
            .with_settings(GenerationSettings {
                presence_penalty: Some(0.5),
                ..Default::default()
            });
        let json = serde_json::to_value(ChatCompletionRequest::from_request(&request)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["presence_penalty"], 0.5);
        assert!(json.get("temperature").is_none());
        assert!(json.get("stop").is_none());
    }

    #[test]
    fn test_non_streaming_request_body() {
        let request =
            CompletionRequest::new("gpt-4o", vec![ChatMessage::user("hi")]).with_stream(false);
        let json = serde_json::to_value(ChatCompletionRequest::from_request(&request)).unwrap();
        assert_eq!(json["stream"], false);
        assert!(json.get("stream_options").is_none());
    }

    #[test]
    fn test_sse_sequence() {
        let mut parser = SseParser::default();
        let lines = [
            ": keep-alive",
            r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
            "",
            r#"data: {"choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
            r#"data:{"choices":[{"index":0,"delta":{"content":" world"},"finish_reason":null}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            "data: [DONE]",
        ];

        let chunks: Vec<CompletionChunk> = lines
            .iter()
            .filter_map(|line| parser.parse_line(line).unwrap())
            .collect();

        assert_eq!(
            chunks,
            vec![
                CompletionChunk::delta("Hello"),
                CompletionChunk::delta(" world"),
                CompletionChunk::finished(FinishReason::Stop, Some(Usage::new(5, 2))),
            ]
        );
    }

    #[test]
    fn test_sse_finish_without_done() {
        let mut parser = SseParser::default();
        assert!(parser.finish().is_none());

        parser
            .parse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#)
            .unwrap();
        let terminal = parser.finish().unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_sse_error_event() {
        let mut parser = SseParser::default();
        let result = parser.parse_line(r#"data: {"error":{"message":"overloaded"}}"#);
        assert!(matches!(result, Err(GatewayError::ProviderStreamFailed(m)) if m.contains("overloaded")));
        assert!(parser.parse_line("data: {oops").is_err());
    }

    #[test]
    fn test_single_chunk_from_response() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Hi!"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#,
        )
        .unwrap();
        let chunk = single_chunk(response).unwrap();
        assert_eq!(chunk.delta, "Hi!");
        assert!(chunk.is_terminal());
        assert_eq!(chunk.usage, Some(Usage::new(3, 1)));
    }
}
