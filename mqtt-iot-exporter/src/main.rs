//! MQTT IoT exporter binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use mqtt_iot_exporter::{
    Broker, BrokerError, ClientCertIssuer, ConnectionStats, ExporterConfig, HttpServer, certs, tls,
};
use mqtt_iot_exporter_core::{DeviceTopicAuthorizer, MetricRegistry, init_tracing, load_config};

/// MQTT broker front-end exposing device metrics to Prometheus.
#[derive(Parser, Debug)]
#[command(name = "mqtt-iot-exporter")]
#[command(about = "Expose metrics pushed by MQTT devices to Prometheus")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, env = "MQTT_IOT_EXPORTER_CONFIG")]
    config: Option<String>,

    /// MQTT listen address (overrides config).
    #[arg(long, env = "MQTT_IOT_EXPORTER_MQTT_ADDR")]
    mqtt_listen: Option<String>,

    /// HTTP metrics listen address (overrides config).
    #[arg(long, env = "MQTT_IOT_EXPORTER_METRICS_ADDR")]
    metrics_listen: Option<String>,

    /// Server certificate (PEM). Enables TLS together with --server-key.
    #[arg(long, env = "MQTT_IOT_EXPORTER_SERVER_CERT_FILE")]
    server_cert: Option<String>,

    /// Server private key (PEM).
    #[arg(long, env = "MQTT_IOT_EXPORTER_SERVER_KEY_FILE")]
    server_key: Option<String>,

    /// Client CA certificate (PEM). Requires client certificates when set.
    #[arg(long, env = "MQTT_IOT_EXPORTER_CLIENT_CA_CERT")]
    client_ca_cert: Option<String>,

    /// Client CA private key (PEM).
    #[arg(long, env = "MQTT_IOT_EXPORTER_CLIENT_CA_KEY")]
    client_ca_key: Option<String>,

    /// Generate the client CA if its files do not exist.
    #[arg(long, env = "MQTT_IOT_EXPORTER_AUTOGENERATE_CLIENT_CA")]
    autogenerate_client_ca: bool,

    /// Serve client keys and certificates on /api/get-client-cert.
    #[arg(long, env = "MQTT_IOT_EXPORTER_ENABLE_CLIENT_KEY_GENERATION")]
    enable_client_key_generation: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ExporterConfig) {
        if let Some(listen) = self.mqtt_listen {
            config.mqtt.listen = listen;
        }
        if let Some(listen) = self.metrics_listen {
            config.metrics.listen = listen;
        }
        if self.server_cert.is_some() {
            config.tls.server_cert = self.server_cert;
        }
        if self.server_key.is_some() {
            config.tls.server_key = self.server_key;
        }
        if self.client_ca_cert.is_some() {
            config.tls.client_ca_cert = self.client_ca_cert;
        }
        if self.client_ca_key.is_some() {
            config.tls.client_ca_key = self.client_ca_key;
        }
        if self.autogenerate_client_ca {
            config.tls.autogenerate_client_ca = true;
        }
        if self.enable_client_key_generation {
            config.tls.enable_client_key_generation = true;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Build the effective configuration: file (or defaults), then command-line
/// overrides, validated once on the result.
fn load(args: Args) -> anyhow::Result<ExporterConfig> {
    let mut config = match &args.config {
        Some(path) => load_config::<ExporterConfig>(path)?,
        None => ExporterConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Flatten a server task's outcome into one error.
fn task_result(
    name: &str,
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result.map_err(|e| anyhow::anyhow!("{} failed: {}", name, e)),
        Err(e) => Err(anyhow::anyhow!("{} task panicked: {}", name, e)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load(Args::parse())?;

    init_tracing(&config.logging)?;

    info!("Starting MQTT IoT exporter");

    certs::autogenerate_client_ca(&config.tls)?;
    let acceptor = tls::load_acceptor(&config.tls)?;

    let metrics_addr: SocketAddr = config
        .metrics
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics listen address: {}", e))?;

    // Bind before spawning so a busy port fails startup.
    let mqtt_listener = TcpListener::bind(&config.mqtt.listen)
        .await
        .map_err(|source| BrokerError::Bind {
            addr: config.mqtt.listen.clone(),
            source,
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(MetricRegistry::new());
    let stats = Arc::new(ConnectionStats::new());

    let broker = Broker::new(
        config.mqtt.clone(),
        registry.clone(),
        Arc::new(DeviceTopicAuthorizer),
        stats.clone(),
    )
    .with_tls(acceptor);

    let http_server = HttpServer::new(
        registry.clone(),
        stats.clone(),
        metrics_addr,
        config.metrics.path.clone(),
    )
    .with_issuer(ClientCertIssuer::from_config(&config.tls));

    let broker_shutdown = shutdown_rx.clone();
    let mut broker_task = tokio::spawn(async move {
        broker
            .serve(mqtt_listener, broker_shutdown)
            .await
            .map_err(anyhow::Error::from)
    });

    let http_shutdown = shutdown_rx.clone();
    let mut http_task = tokio::spawn(async move { http_server.run(http_shutdown).await });

    // A server stopping on its own takes the exporter down with it.
    let failure = tokio::select! {
        _ = wait_for_signal() => None,
        joined = &mut broker_task => Some(task_result("MQTT listener", joined)),
        joined = &mut http_task => Some(task_result("HTTP server", joined)),
    };

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if !broker_task.is_finished() {
            let _ = (&mut broker_task).await;
        }
        if !http_task.is_finished() {
            let _ = (&mut http_task).await;
        }
    })
    .await;

    let snapshot = stats.snapshot();
    info!(
        total_connections = snapshot.total_connections,
        unclean_disconnects = snapshot.unclean_disconnects,
        metric_families = registry.len(),
        "Final statistics"
    );

    if let Some(result) = failure {
        let err = match result {
            Ok(()) => anyhow::anyhow!("server stopped unexpectedly"),
            Err(e) => e,
        };
        error!(error = %err, "Exporter stopped on failure");
        return Err(err);
    }

    info!("Exporter stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mqtt-iot-exporter").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_cli_completes_file_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(&path, r#"{ tls: { server_cert: "server.pem" } }"#).unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = load(parse(&["--config", &path, "--server-key", "server.key"])).unwrap();

        assert_eq!(config.tls.server_cert.as_deref(), Some("server.pem"));
        assert_eq!(config.tls.server_key.as_deref(), Some("server.key"));
    }

    #[test]
    fn test_cli_overrides_still_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(&path, "{}").unwrap();
        let path = path.to_string_lossy().into_owned();

        assert!(load(parse(&["--config", &path, "--server-key", "server.key"])).is_err());
    }

    #[test]
    fn test_task_result() {
        assert!(task_result("x", Ok(Ok(()))).is_ok());

        let err = task_result("HTTP server", Ok(Err(anyhow::anyhow!("bind")))).unwrap_err();
        assert_eq!(err.to_string(), "HTTP server failed: bind");
    }
}
