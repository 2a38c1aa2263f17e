use crate::reporter::{TelemetryError, TelemetryResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 80;
pub const API_PATH: &str = "/api/packages";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl NetworkCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

/// Where readings are posted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    HostPort {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    FullUrl {
        url: String,
    },
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Endpoint {
    pub fn host_port(host: impl Into<String>, port: u16) -> Self {
        Self::HostPort {
            host: host.into(),
            port,
        }
    }

    pub fn full_url(url: impl Into<String>) -> Self {
        Self::FullUrl { url: url.into() }
    }

    /// Interpret a single address string that may be either a bare host or a
    /// URL with a scheme. The port only applies to bare hosts.
    pub fn from_address(address: &str, port: u16) -> Self {
        if address.starts_with("http://") || address.starts_with("https://") {
            Self::full_url(address)
        } else {
            Self::host_port(address, port)
        }
    }

    pub fn target_url(&self) -> String {
        match self {
            Self::HostPort { host, port } => format!("http://{}:{}{}", host, port, API_PATH),
            Self::FullUrl { url } => format!("{}{}", url.trim_end_matches('/'), API_PATH),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::HostPort { host, port } => {
                if host.trim().is_empty() {
                    return Err("Server host cannot be empty".to_string());
                }
                if host.contains("://") {
                    return Err("Server host must not carry a scheme; use a full URL".to_string());
                }
                if *port == 0 {
                    return Err("Server port must be greater than 0".to_string());
                }
            }
            Self::FullUrl { url } => {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|e| format!("Invalid server URL {}: {}", url, e))?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err("Server URL must start with http:// or https://".to_string());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    pub network: NetworkCredentials,
    pub endpoint: Endpoint,
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "defaults::ensure_timeout_ms")]
    pub ensure_timeout_ms: u64,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// When `ingest` posts a reading parsed from the scale output.
///
/// A reading is dropped when it differs from the previous one by less than
/// every threshold and the last post was under `min_interval_ms` ago.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    #[serde(default = "defaults::weight_threshold")]
    pub weight_threshold: f64,
    #[serde(default = "defaults::volume_threshold")]
    pub volume_threshold: f64,
    #[serde(default = "defaults::fee_threshold")]
    pub fee_threshold: f64,
    #[serde(default = "defaults::min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            weight_threshold: defaults::weight_threshold(),
            volume_threshold: defaults::volume_threshold(),
            fee_threshold: defaults::fee_threshold(),
            min_interval_ms: defaults::min_interval_ms(),
        }
    }
}

impl IngestConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("weight", self.weight_threshold),
            ("volume", self.volume_threshold),
            ("fee", self.fee_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!(
                    "Ingest {} threshold must be a non-negative number",
                    name
                ));
            }
        }
        Ok(())
    }
}

mod defaults {
    pub fn connect_timeout_ms() -> u64 {
        10_000
    }

    pub fn ensure_timeout_ms() -> u64 {
        10_000
    }

    pub fn poll_interval_ms() -> u64 {
        200
    }

    pub fn request_timeout_ms() -> u64 {
        10_000
    }

    pub fn weight_threshold() -> f64 {
        0.05
    }

    pub fn volume_threshold() -> f64 {
        5.0
    }

    pub fn fee_threshold() -> f64 {
        0.5
    }

    pub fn min_interval_ms() -> u64 {
        15_000
    }
}

impl ReporterConfig {
    pub fn new(network: NetworkCredentials, endpoint: Endpoint) -> Self {
        Self {
            network,
            endpoint,
            connect_timeout_ms: defaults::connect_timeout_ms(),
            ensure_timeout_ms: defaults::ensure_timeout_ms(),
            poll_interval_ms: defaults::poll_interval_ms(),
            request_timeout_ms: defaults::request_timeout_ms(),
            api_key: None,
            ingest: IngestConfig::default(),
        }
    }

    pub fn from_toml_str(source: &str) -> TelemetryResult<Self> {
        let config: Self = toml::from_str(source)?;
        config
            .validate()
            .map_err(|message| TelemetryError::InvalidConfig { message })?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> TelemetryResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ensure_timeout(mut self, timeout: Duration) -> Self {
        self.ensure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_ingest(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ensure_timeout(&self) -> Duration {
        Duration::from_millis(self.ensure_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.network.ssid.is_empty() {
            return Err("Network SSID cannot be empty".to_string());
        }

        self.endpoint.validate()?;

        if self.connect_timeout_ms == 0 || self.ensure_timeout_ms == 0 {
            return Err("Association timeouts must be greater than 0".to_string());
        }

        if self.poll_interval_ms == 0 {
            return Err("Poll interval must be greater than 0".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("Request timeout must be greater than 0".to_string());
        }

        self.ingest.validate()?;

        if let Some(api_key) = &self.api_key {
            if api_key.trim().is_empty() {
                return Err("API key cannot be blank when set".to_string());
            }
        }

        Ok(())
    }
}
