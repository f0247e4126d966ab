//! MQTT IoT exporter.
//!
//! Devices connect over MQTT, declare metrics on
//! `device/<id>/metrics/<name>/define` and report values on
//! `device/<id>/metrics/<name>/push`. The exporter keeps the latest value
//! per label set and exposes everything via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  MQTT devices   │────>│     Broker      │────>│   Dispatcher    │
//! │   (TCP / TLS)   │<─┐  │  (ACL, fan-out) │     │ (define / push) │
//! └─────────────────┘  │  └─────────────────┘     └────────┬────────┘
//!                      │     server_error                  │
//!                      └───────────────────────────────────┤
//!                                                          v
//!                         ┌─────────────────┐     ┌─────────────────┐
//!                         │   HTTP Server   │<────│ Metric Registry │
//!                         │   (/metrics)    │     │                 │
//!                         └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! mqtt-iot-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod broker;
pub mod certs;
pub mod config;
pub mod exposition;
pub mod http;
pub mod stats;
pub mod tls;

pub use broker::{Broker, BrokerError};
pub use certs::ClientCertIssuer;
pub use config::ExporterConfig;
pub use http::HttpServer;
pub use stats::{ConnectionStats, SharedStats, StatsSnapshot};
