//! Continuum Gateway Binary
//!
//! Serves the OpenAI-compatible HTTP façade and, when enabled, the Continuum
//! wire protocol.
//!
//! # Usage
//! ```bash
//! continuum-gateway --identities users.toml --models models.toml [--port 8080] [--wire-port 8989] [--verbose]
//! ```

use anyhow::Context;
use clap::Parser;
use continuum_gateway::{Gateway, GatewayConfig, Orchestrator, WireServer};
use std::sync::Arc;

/// Continuum Gateway - Authenticated Streaming Gateway for LLM Providers
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gateway settings file (TOML or JSON)
    #[arg(short, long, env = "CONTINUUM_CONFIG")]
    config: Option<String>,

    /// Identity table file
    #[arg(long, env = "CONTINUUM_IDENTITIES")]
    identities: Option<String>,

    /// Model binding file
    #[arg(long, env = "CONTINUUM_MODELS")]
    models: Option<String>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// HTTP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable the wire protocol server on this port
    #[arg(long)]
    wire_port: Option<u16>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .init();
    }

    let config = load_config(&args)?;
    let orchestrator =
        Arc::new(Orchestrator::from_config(&config).context("failed to load gateway tables")?);

    print_banner(&config);

    let gateway = Gateway::new(config.clone(), orchestrator.clone());
    let http = gateway.start();

    let wire = async {
        if !config.wire.enabled {
            return std::future::pending().await;
        }
        let addr = config.wire_addr()?;
        WireServer::new(orchestrator.clone(), config.wire.max_frame_size)
            .start(addr)
            .await
    };

    tokio::select! {
        result = http => result.context("HTTP gateway failed")?,
        result = wire => result.context("wire server failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down");
            gateway.shutdown();
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path))?,
        None => GatewayConfig::default(),
    };
    config = config.apply_env()?;

    if let Some(path) = &args.identities {
        config = config.with_identities_path(path.clone());
    }
    if let Some(path) = &args.models {
        config = config.with_models_path(path.clone());
    }
    if let Some(host) = &args.host {
        config.wire.host = host.clone();
        config = config.with_host(host.clone());
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(port) = args.wire_port {
        config = config.with_wire_port(port);
    }
    Ok(config)
}

fn print_banner(config: &GatewayConfig) {
    println!();
    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║                                                               ║");
    println!("║              CONTINUUM GATEWAY — LLM FRONT DOOR               ║");
    println!("║                                                               ║");
    println!("║     Authenticated, rate-limited streaming for every model     ║");
    println!("║                                                               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!("📡 HTTP Server");
    println!("   └─ http://{}:{}", config.http.host, config.http.port);
    println!();
    println!("🔗 HTTP Endpoints");
    println!("   ├─ POST /v1/chat/completions — Chat completions (SSE when stream=true)");
    println!("   ├─ GET  /v1/models           — Models visible to the caller");
    println!("   ├─ GET  /health              — Health check");
    println!("   └─ GET  /status              — Caller status and quota");
    println!();
    if config.wire.enabled {
        println!("🧵 Wire Protocol");
        println!("   └─ tcp://{}:{}", config.wire.host, config.wire.port);
        println!();
    }
    println!("─────────────────────────────────────────────────────────────────");
    println!("Press Ctrl+C to stop the gateway");
    println!();
}
