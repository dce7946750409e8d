//! Gateway configuration
//!
//! Three inputs, all loaded once at startup: the gateway settings, the
//! identity table and the model binding table. Files are parsed as TOML when
//! the extension is `.toml` and as JSON otherwise.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::{GatewayError, Result, DEFAULT_HOST, DEFAULT_HTTP_PORT, DEFAULT_WIRE_PORT};

/// Default ceiling for one wire frame's payload (10 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP façade
    pub http: HttpSettings,

    /// Continuum wire protocol server
    pub wire: WireSettings,

    /// Request limits and failure policy
    pub limits: LimitSettings,

    /// Provider connection settings
    pub providers: ProviderSettings,

    /// Identity table file
    pub identities_path: Option<String>,

    /// Model binding table file
    pub models_path: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            wire: WireSettings::default(),
            limits: LimitSettings::default(),
            providers: ProviderSettings::default(),
            identities_path: None,
            models_path: None,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.http.host = host.into();
        self
    }

    /// Set the HTTP port
    pub fn with_port(mut self, port: u16) -> Self {
        self.http.port = port;
        self
    }

    /// Enable the wire server on a port
    pub fn with_wire_port(mut self, port: u16) -> Self {
        self.wire.enabled = true;
        self.wire.port = port;
        self
    }

    pub fn with_identities_path(mut self, path: impl Into<String>) -> Self {
        self.identities_path = Some(path.into());
        self
    }

    pub fn with_models_path(mut self, path: impl Into<String>) -> Self {
        self.models_path = Some(path.into());
        self
    }

    /// HTTP listen address
    pub fn http_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.http.host, self.http.port)
    }

    /// Wire protocol listen address
    pub fn wire_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.wire.host, self.wire.port)
    }

    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        read_file(path)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &str) -> Result<()> {
        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| GatewayError::Serialization(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply the environment overrides the node has always honoured.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            self.providers.ollama.base_url = url;
        }
        if let Ok(key) = std::env::var(&self.providers.openai.api_key_env) {
            if !key.is_empty() {
                self.providers.openai.api_key = Some(key);
            }
        }
        if let Ok(host) = std::env::var("HTTP_HOST") {
            self.http.host = host;
        }
        if let Ok(port) = std::env::var("HTTP_PORT") {
            self.http.port = parse_port("HTTP_PORT", &port)?;
        }
        if let Ok(enabled) = std::env::var("ENABLE_TCP_SERVER") {
            self.wire.enabled = enabled.eq_ignore_ascii_case("true");
        }
        if let Ok(host) = std::env::var("TCP_HOST") {
            self.wire.host = host;
        }
        if let Ok(port) = std::env::var("TCP_PORT") {
            self.wire.port = parse_port("TCP_PORT", &port)?;
        }
        Ok(self)
    }
}

/// HTTP façade settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

/// Wire server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,

    /// Largest payload a peer may declare, in bytes
    pub max_frame_size: u32,
}

impl Default for WireSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_WIRE_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Per-request limits and failure policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// End-to-end ceiling for one exchange
    pub request_timeout_secs: u64,

    /// Retry once against the same provider when it fails before any output
    pub retry_unavailable_once: bool,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            retry_unavailable_once: true,
        }
    }
}

/// Connection settings for every supported provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub ollama: OllamaSettings,
    pub openai: OpenAiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: String,
    pub connect_timeout_secs: u64,

    /// Longest silence tolerated between two streamed records
    pub idle_timeout_secs: u64,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,

    /// Inline key; usually left unset in favour of `api_key_env`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable the key is read from
    pub api_key_env: String,

    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 60,
        }
    }
}

/// One entry of the identity table file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub token: String,
    pub name: String,

    #[serde(default)]
    pub permissions: Vec<String>,

    /// `<count>/<unit>`, e.g. `100/minute`
    #[serde(default)]
    pub rate_limit: Option<String>,
}

/// Identity table file: `{ users = [...] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitiesFile {
    pub users: Vec<IdentityEntry>,
}

impl IdentitiesFile {
    pub fn from_file(path: &str) -> Result<Self> {
        read_file(path)
    }
}

/// One model binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
}

/// Model binding file: `{ models = [...] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsFile {
    pub models: Vec<ModelEntry>,
}

impl ModelsFile {
    pub fn from_file(path: &str) -> Result<Self> {
        read_file(path)
    }
}

fn is_toml(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

fn read_file<T: DeserializeOwned>(path: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::InvalidConfig(format!("cannot read {}: {}", path, e))
    })?;
    if is_toml(path) {
        Ok(toml::from_str(&content)?)
    } else {
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::InvalidConfig(format!("{}: {}", path, e)))
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| GatewayError::InvalidConfig(format!("invalid address {}:{}: {}", host, port, e)))
}

fn parse_port(var: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| GatewayError::InvalidConfig(format!("{} is not a port: {}", var, value)))
}
