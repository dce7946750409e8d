//! Shared fixtures: fake provider backends on 127.0.0.1:0

#![allow(dead_code)]

use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use continuum_gateway::config::ProviderSettings;
use continuum_gateway::{ChatMessage, CompletionRequest};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// What a fake backend saw
#[derive(Clone, Default)]
pub struct Recorder {
    pub bodies: Arc<Mutex<Vec<Value>>>,
    pub authorization: Arc<Mutex<Vec<String>>>,
    hits: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Value {
        self.bodies.lock().last().cloned().unwrap_or(Value::Null)
    }
}

pub async fn spawn_http(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A backend answering `path` with a fixed status and body.
pub async fn fake_backend(
    path: &str,
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> (SocketAddr, Recorder) {
    let recorder = Recorder::default();
    let seen = recorder.clone();

    let router = Router::new().route(
        path,
        post(move |headers: HeaderMap, Json(request): Json<Value>| {
            let seen = seen.clone();
            let body = body.clone();
            async move {
                seen.hits.fetch_add(1, Ordering::SeqCst);
                seen.bodies.lock().push(request);
                if let Some(auth) = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                {
                    seen.authorization.lock().push(auth.to_string());
                }
                (status, [(header::CONTENT_TYPE, content_type)], body)
            }
        }),
    );

    (spawn_http(router).await, recorder)
}

/// Ollama NDJSON body: one record per delta, then the `done` record.
pub fn ollama_body(deltas: &[&str]) -> String {
    let mut lines: Vec<String> = deltas
        .iter()
        .map(|d| {
            serde_json::json!({
                "model": "llama3:latest",
                "message": { "role": "assistant", "content": d },
                "done": false,
            })
            .to_string()
        })
        .collect();
    lines.push(
        serde_json::json!({
            "model": "llama3:latest",
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 7,
            "eval_count": deltas.len(),
        })
        .to_string(),
    );
    lines.join("\n") + "\n"
}

/// A raw HTTP/1.1 server that streams the given lines with chunked encoding
/// and then closes the socket without the final chunk.
pub async fn truncated_stream(lines: Vec<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        let mut response = String::from(
            "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        for line in lines {
            let data = format!("{}\n", line);
            response.push_str(&format!("{:x}\r\n{}\r\n", data.len(), data));
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
    });

    addr
}

async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + content_length {
                return;
            }
        }
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn ollama_settings(addr: SocketAddr) -> ProviderSettings {
    let mut settings = ProviderSettings::default();
    settings.ollama.base_url = format!("http://{}", addr);
    settings.ollama.connect_timeout_secs = 2;
    settings.ollama.idle_timeout_secs = 5;
    settings
}

pub fn openai_settings(addr: SocketAddr) -> ProviderSettings {
    let mut settings = ProviderSettings::default();
    settings.openai.base_url = format!("http://{}/v1", addr);
    settings.openai.api_key = Some("sk-test".to_string());
    settings.openai.connect_timeout_secs = 2;
    settings.openai.idle_timeout_secs = 5;
    settings
}

pub fn request(model: &str) -> CompletionRequest {
    CompletionRequest::new(model, vec![ChatMessage::user("hello")])
}
