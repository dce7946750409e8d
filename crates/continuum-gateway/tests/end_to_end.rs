//! Full stack: config files, fake Ollama, wire server and HTTP façade

mod common;

use axum::http::StatusCode;
use continuum_gateway::{
    ContinuumClient, FinishReason, Gateway, GatewayConfig, GatewayError,
    Orchestrator, WireServer,
};
use futures::StreamExt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

use common::*;

const IDENTITIES: &str = r#"
[[users]]
token = "alice-token"
name = "alice"
permissions = ["*"]
rate_limit = "2/minute"

[[users]]
token = "bob-token"
name = "bob"
permissions = ["llama3:latest"]
rate_limit = "100/minute"
"#;

const MODELS: &str = r#"{
  "models": [
    { "id": "llama3:latest", "provider": "ollama" },
    { "id": "gpt-4o", "provider": "ollama" }
  ]
}"#;

fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

struct Stack {
    wire: SocketAddr,
    http: SocketAddr,
    _files: (NamedTempFile, NamedTempFile),
}

async fn stack() -> Stack {
    let (ollama, _) = fake_backend(
        "/api/chat",
        StatusCode::OK,
        "application/x-ndjson",
        ollama_body(&["Hello", ", ", "world"]),
    )
    .await;

    let identities = write_temp(".toml", IDENTITIES);
    let models = write_temp(".json", MODELS);

    let mut config = GatewayConfig::default()
        .with_identities_path(identities.path().to_string_lossy().to_string())
        .with_models_path(models.path().to_string_lossy().to_string());
    config.providers = ollama_settings(ollama);

    let orchestrator = Arc::new(Orchestrator::from_config(&config).unwrap());

    let wire_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let wire = wire_listener.local_addr().unwrap();
    let server = WireServer::new(orchestrator.clone(), config.wire.max_frame_size);
    tokio::spawn(async move {
        let _ = server.serve(wire_listener).await;
    });

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = http_listener.local_addr().unwrap();
    let gateway = Gateway::new(config, orchestrator);
    tokio::spawn(async move {
        let _ = gateway.serve(http_listener).await;
    });

    Stack {
        wire,
        http,
        _files: (identities, models),
    }
}

#[tokio::test]
async fn wire_client_streams_a_completion() {
    let stack = stack().await;
    let client = ContinuumClient::connect(stack.wire).await.unwrap();

    let chunks: Vec<_> = client
        .complete("bob-token", request("llama3:latest"))
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    let text: String = chunks.iter().map(|c| c.delta.as_str()).collect();
    assert_eq!(text, "Hello, world");
    assert_eq!(chunks.last().unwrap().finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn two_per_minute_over_the_wire() {
    let stack = stack().await;
    let client = ContinuumClient::connect(stack.wire).await.unwrap();

    for _ in 0..2 {
        let chunks: Vec<_> = client
            .complete("alice-token", request("gpt-4o"))
            .unwrap()
            .collect()
            .await;
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    let mut third = client.complete("alice-token", request("gpt-4o")).unwrap();
    match third.next().await {
        Some(Err(GatewayError::RateLimited { retry_after_secs })) => {
            assert!(retry_after_secs > 0)
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn forbidden_and_unknown_models_over_the_wire() {
    let stack = stack().await;
    let client = ContinuumClient::connect(stack.wire).await.unwrap();

    let mut forbidden = client.complete("bob-token", request("gpt-4o")).unwrap();
    assert!(matches!(
        forbidden.next().await,
        Some(Err(GatewayError::Forbidden(_)))
    ));

    let mut unknown = client
        .complete("alice-token", request("nonexistent-model"))
        .unwrap();
    assert!(matches!(
        unknown.next().await,
        Some(Err(GatewayError::ModelNotFound(_)))
    ));
}

#[tokio::test]
async fn http_facade_streams_sse() {
    let stack = stack().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat/completions", stack.http))
        .bearer_auth("bob-token")
        .json(&serde_json::json!({
            "model": "llama3:latest",
            "messages": [{ "role": "user", "content": "hello" }],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let text = response.text().await.unwrap();
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data.last(), Some(&"[DONE]"));

    let content: String = data[..data.len() - 1]
        .iter()
        .map(|event| serde_json::from_str::<serde_json::Value>(event).unwrap())
        .filter_map(|event| {
            event["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string)
        })
        .collect();
    assert_eq!(content, "Hello, world");
}

#[tokio::test]
async fn http_facade_lists_models_and_rejects_bad_tokens() {
    let stack = stack().await;
    let client = reqwest::Client::new();

    let models: serde_json::Value = client
        .get(format!("http://{}/v1/models", stack.http))
        .bearer_auth("alice-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "llama3:latest"]);

    let rejected = client
        .get(format!("http://{}/v1/models", stack.http))
        .bearer_auth("mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::UNAUTHORIZED);
}
