//! Configuration for both agents
//!
//! Each agent reads one YAML file. Every field has a default so partial files
//! work; `validate` rejects values the agents cannot run with.

use crate::auth::{AuthGenerator, SecretTable};
use crate::constants::{CONNECT_TIMEOUT, REQUEST_TIMEOUT};
use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// Logging settings shared by both agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub log_theme_path: String,
    /// Whether to log to file
    #[serde(default)]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default)]
    pub log_file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_theme_path: default_log_theme_path(),
            log_to_file: false,
            log_file_path: None,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Time allowed for an upstream response to start, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Traffic counters and the periodic report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between two reports
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_metrics_interval(),
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// TLS settings of the remote agent's CONNECT listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain; self-signed when absent
    #[serde(default)]
    pub cert_path: Option<String>,
    /// PEM private key
    #[serde(default)]
    pub key_path: Option<String>,
}

/// TLS settings the local agent uses towards the remote CONNECT listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Accept any certificate (DANGEROUS)
    #[serde(default)]
    pub skip_cert_verification: bool,
}

/// A registered secret
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    pub secret_id: String,
    pub secret_key: String,
}

impl fmt::Debug for SecretEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEntry")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Remote agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub log: LogConfig,
    #[serde(default = "default_server_bind_address")]
    pub bind_address: String,
    /// Port of the HTTP leg (HTTP/1.1 and h2c)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Port of the CONNECT leg
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub tls: ServerTlsConfig,
    /// Secrets accepted from local agents
    #[serde(default)]
    pub auth: Vec<SecretEntry>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            bind_address: default_server_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            tls: ServerTlsConfig::default(),
            auth: Vec::new(),
            timeouts: TimeoutConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        load_yaml(path).await
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        save_yaml(self, path).await
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_log(&self.log)?;
        require("bind_address", &self.bind_address)?;
        validate_port("http_port", self.http_port)?;
        validate_port("https_port", self.https_port)?;
        validate_common(&self.timeouts, &self.metrics)?;
        if self.auth.is_empty() {
            return Err(anyhow!("At least one auth entry is required"));
        }
        for entry in &self.auth {
            require("auth.secret_id", &entry.secret_id)?;
            require("auth.secret_key", &entry.secret_key)?;
        }
        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(anyhow!("tls.cert_path and tls.key_path must be set together"));
        }
        Ok(())
    }

    pub fn secret_table(&self) -> anyhow::Result<SecretTable> {
        SecretTable::from_entries(
            self.auth
                .iter()
                .map(|entry| (entry.secret_id.as_str(), entry.secret_key.as_str())),
        )
    }
}

/// Local agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub log: LogConfig,
    #[serde(default = "default_client_bind_address")]
    pub bind_address: String,
    /// Port browsers use as their HTTP proxy
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Host of the remote agent
    #[serde(default)]
    pub remote_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub secret_id: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub tls: ClientTlsConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            bind_address: default_client_bind_address(),
            local_port: default_local_port(),
            remote_host: String::new(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            secret_id: String::new(),
            secret_key: String::new(),
            tls: ClientTlsConfig::default(),
            timeouts: TimeoutConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        load_yaml(path).await
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        save_yaml(self, path).await
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_log(&self.log)?;
        require("bind_address", &self.bind_address)?;
        validate_port("local_port", self.local_port)?;
        require("remote_host", &self.remote_host)?;
        validate_port("http_port", self.http_port)?;
        validate_port("https_port", self.https_port)?;
        require("secret_id", &self.secret_id)?;
        require("secret_key", &self.secret_key)?;
        validate_common(&self.timeouts, &self.metrics)
    }

    pub fn auth_generator(&self) -> anyhow::Result<AuthGenerator> {
        AuthGenerator::new(&self.secret_id, &self.secret_key)
    }
}

async fn load_yaml<T, P>(path: P) -> anyhow::Result<T>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    match fs::read_to_string(&path).await {
        Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Config file {} not found, using defaults",
                path.as_ref().display()
            );
            Ok(T::default())
        }
        Err(e) => Err(e.into()),
    }
}

async fn save_yaml<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> anyhow::Result<()> {
    let contents = serde_yaml::to_string(value)?;
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(path, contents).await?;
    Ok(())
}

fn validate_log(log: &LogConfig) -> anyhow::Result<()> {
    const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
    if !LEVELS.contains(&log.log_level.to_uppercase().as_str()) {
        return Err(anyhow!("Invalid log level: {}", log.log_level));
    }
    if log.log_to_file {
        if let Some(path) = &log.log_file_path {
            require("log_file_path", path)?;
        }
    }
    Ok(())
}

fn validate_common(timeouts: &TimeoutConfig, metrics: &MetricsConfig) -> anyhow::Result<()> {
    if timeouts.connect_timeout == 0 {
        return Err(anyhow!("timeouts.connect_timeout must be greater than 0"));
    }
    if timeouts.request_timeout == 0 {
        return Err(anyhow!("timeouts.request_timeout must be greater than 0"));
    }
    if metrics.enabled && metrics.interval_secs == 0 {
        return Err(anyhow!("metrics.interval_secs must be greater than 0"));
    }
    Ok(())
}

fn validate_port(name: &str, port: u16) -> anyhow::Result<()> {
    if port == 0 {
        return Err(anyhow!("{} must be between 1 and 65535", name));
    }
    Ok(())
}

fn require(name: &str, value: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} must not be empty", name));
    }
    Ok(())
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/log_theme.yml".to_string()
}

fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT.as_secs()
}

fn default_request_timeout() -> u64 {
    REQUEST_TIMEOUT.as_secs()
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_server_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_client_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_local_port() -> u16 {
    1080
}
