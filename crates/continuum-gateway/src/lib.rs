//! Continuum Gateway - Authenticated Streaming Front Door for LLM Providers
//!
//! This crate exposes one request/response and streaming contract to
//! clients while fanning requests out to heterogeneous model providers
//! (a local Ollama server, the hosted OpenAI API).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Continuum Gateway                      │
//! ├─────────────────────────────────────────────────────────┤
//! │   ┌──────────────────┐        ┌──────────────────┐      │
//! │   │   HTTP façade    │        │   Wire server    │      │
//! │   │ (OpenAI-shaped)  │        │ (framed TCP)     │      │
//! │   └────────┬─────────┘        └────────┬─────────┘      │
//! │            └─────────────┬─────────────┘                │
//! │                ┌─────────▼──────────┐                   │
//! │                │    Orchestrator    │                   │
//! │                └─────────┬──────────┘                   │
//! │        ┌─────────────────┼──────────────────┐           │
//! │   ┌────▼─────┐     ┌─────▼──────┐     ┌─────▼─────┐     │
//! │   │ Identity │     │    Rate    │     │   Model   │     │
//! │   │  Table   │     │  Limiter   │     │  Router   │     │
//! │   └──────────┘     └────────────┘     └─────┬─────┘     │
//! │                                   ┌─────────┴────────┐  │
//! │                              ┌────▼────┐        ┌────▼───┐
//! │                              │ Ollama  │        │ OpenAI │
//! │                              └─────────┘        └────────┘
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Per-identity gate**: BLAKE3 token digests, fail-closed model
//!   permissions, sliding-window quotas without a global lock
//! - **Provider abstraction**: NDJSON and SSE streams normalized into one
//!   chunk format with a single terminal chunk
//! - **Wire protocol**: length-prefixed, multiplexed frames with
//!   cancellation and an enforced frame ceiling

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod orchestrator;
pub mod protocol;
pub mod providers;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod types;

pub use client::{Completion, ContinuumClient};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use identity::{Identity, IdentityTable, Permissions, Quota};
pub use orchestrator::Orchestrator;
pub use protocol::{ContinuumCodec, Frame, FrameKind, WireMessage};
pub use providers::{ChunkStream, OllamaAdapter, OpenAiAdapter, ProviderAdapter};
pub use rate_limit::{Admission, RateLimiter};
pub use router::{CompletionStream, ModelRouter};
pub use server::WireServer;
pub use types::{ChatMessage, CompletionChunk, CompletionRequest, FinishReason, Role, Usage};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default HTTP façade port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default wire protocol port
pub const DEFAULT_WIRE_PORT: u16 = 8989;
