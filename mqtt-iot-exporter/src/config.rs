//! Configuration for the exporter.

use mqtt_iot_exporter_core::{LoggingConfig, load_config, parse_config};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] mqtt_iot_exporter_core::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// MQTT listener settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Prometheus HTTP endpoint settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// TLS and client certificate settings.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Address to listen on (default: "0.0.0.0:1883").
    #[serde(default = "default_mqtt_listen")]
    pub listen: String,

    /// Largest accepted packet in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Messages buffered per client before deliveries are dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Seconds a new connection has to send CONNECT.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_mqtt_listen() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_max_packet_size() -> usize {
    64 * 1024
}

fn default_outbound_queue() -> usize {
    64
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            listen: default_mqtt_listen(),
            max_packet_size: default_max_packet_size(),
            outbound_queue: default_outbound_queue(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address to listen on (default: "127.0.0.1:9100").
    #[serde(default = "default_metrics_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9100".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: default_metrics_listen(),
            path: default_path(),
        }
    }
}

/// TLS configuration for the MQTT listener and the client CA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server certificate chain (PEM). TLS is enabled when set with `server_key`.
    #[serde(default)]
    pub server_cert: Option<String>,

    /// Server private key (PEM).
    #[serde(default)]
    pub server_key: Option<String>,

    /// CA certificate used to verify client certificates (PEM).
    #[serde(default)]
    pub client_ca_cert: Option<String>,

    /// CA private key used to sign issued client certificates (PEM).
    #[serde(default)]
    pub client_ca_key: Option<String>,

    /// Create the client CA at startup when its files do not exist.
    #[serde(default)]
    pub autogenerate_client_ca: bool,

    /// Serve `/api/get-client-cert` on the HTTP endpoint.
    #[serde(default)]
    pub enable_client_key_generation: bool,
}

impl TlsConfig {
    /// Whether the MQTT listener is wrapped in TLS.
    pub fn enabled(&self) -> bool {
        self.server_cert.is_some() && self.server_key.is_some()
    }

    /// Both client CA paths, when configured.
    pub fn client_ca_paths(&self) -> Option<(&str, &str)> {
        match (&self.client_ca_cert, &self.client_ca_key) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, addr) in [
            ("MQTT", &self.mqtt.listen),
            ("metrics", &self.metrics.listen),
        ] {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "Invalid {} listen address: {}",
                    name, addr
                )));
            }
        }

        if !self.metrics.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.mqtt.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "max_packet_size must be > 0".to_string(),
            ));
        }

        if self.mqtt.outbound_queue == 0 {
            return Err(ConfigError::Validation(
                "outbound_queue must be > 0".to_string(),
            ));
        }

        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.tls.server_cert.is_some() != self.tls.server_key.is_some() {
            return Err(ConfigError::Validation(
                "server_cert and server_key must be set together".to_string(),
            ));
        }

        if self.tls.client_ca_cert.is_some() && !self.tls.enabled() {
            return Err(ConfigError::Validation(
                "client_ca_cert requires server_cert and server_key".to_string(),
            ));
        }

        if (self.tls.autogenerate_client_ca || self.tls.enable_client_key_generation)
            && self.tls.client_ca_paths().is_none()
        {
            return Err(ConfigError::Validation(
                "client CA generation and key issuance need client_ca_cert and client_ca_key"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
