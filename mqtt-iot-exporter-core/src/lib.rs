//! MQTT IoT Exporter core
//!
//! The ingestion side of the exporter, independent of any transport:
//!
//! - [`topics`] - Topic parsing (`device/<id>/metrics/<name>/<action>`)
//! - [`auth`] - Device-scoped topic authorization and connection hooks
//! - [`registry`] - The lock-guarded metric registry
//! - [`dispatcher`] - Routing of define/push messages into the registry
//! - [`schema`] - JSON payload documents
//! - [`config`] - JSON5 configuration helpers and logging settings
//! - [`error`] - Error types

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod schema;
pub mod topics;

// Re-export commonly used types at the crate root
pub use auth::{Access, Authorizer, ClientInfo, ConnectionEvents, DeviceTopicAuthorizer};
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use dispatcher::{DiagnosticSink, Dispatcher, InboundMessage, Outcome};
pub use error::{Error, IngestError, Result};
pub use registry::{
    LabelSet, MetricFamily, MetricRegistry, MetricType, Observation, SharedRegistry,
};
pub use schema::{MetricDefinition, MetricPush, ServerError};
pub use topics::{Action, MetricTopic};

/// Install the global subscriber for the exporter's logs.
///
/// `RUST_LOG` wins over `logging.level` when set. A level that is not a
/// valid filter directive is a configuration error.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            Error::Config(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    // JSON lines carry event fields at the top level for log shippers.
    let output = match config.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().flatten_event(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Tracing already initialized: {}", e)))
}
