//! MQTT 3.1.1 front-end devices connect to.
//!
//! A deliberately small broker: QoS 0 delivery to subscribers, no retained
//! messages and no persistent sessions. Every publish and subscribe goes
//! through an [`Authorizer`], and publishes on the define/push topics are
//! handed to the ingestion [`Dispatcher`].

mod session;
pub mod subscriptions;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mqtt_iot_exporter_core::{Authorizer, ConnectionEvents, Dispatcher, SharedRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

pub use subscriptions::{Outbound, Subscriptions};

/// Errors raised by the MQTT front-end.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No CONNECT received within {0} seconds")]
    ConnectTimeout(u64),

    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
}

/// State shared by every session of one broker.
pub(crate) struct BrokerContext {
    pub(crate) config: MqttConfig,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) events: Arc<dyn ConnectionEvents>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) subscriptions: Arc<Subscriptions>,
    next_session_id: AtomicU64,
}

impl BrokerContext {
    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// The MQTT listener.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    tls: Option<TlsAcceptor>,
}

impl Broker {
    /// Create a broker feeding `registry`.
    pub fn new(
        config: MqttConfig,
        registry: SharedRegistry,
        authorizer: Arc<dyn Authorizer>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        let subscriptions = Arc::new(Subscriptions::new());
        let dispatcher = Dispatcher::new(registry, subscriptions.clone());

        Self {
            ctx: Arc::new(BrokerContext {
                config,
                authorizer,
                events,
                dispatcher,
                subscriptions,
                next_session_id: AtomicU64::new(1),
            }),
            tls: None,
        }
    }

    /// Wrap accepted connections in TLS.
    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    /// Subscription table, shared with the dispatcher.
    pub fn subscriptions(&self) -> Arc<Subscriptions> {
        self.ctx.subscriptions.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        let addr = self.ctx.config.listen.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })?;

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            tls = self.tls.is_some(),
            "MQTT listener started"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    self.spawn_session(stream, peer, shutdown.clone());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("MQTT listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_session(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let ctx = self.ctx.clone();
        let tls = self.tls.clone();

        tokio::spawn(async move {
            debug!(peer = %peer, "Accepted connection");

            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => session::run(stream, peer, ctx, shutdown).await,
                    Err(e) => Err(BrokerError::Tls(e)),
                },
                None => session::run(stream, peer, ctx, shutdown).await,
            };

            if let Err(e) = result {
                warn!(peer = %peer, error = %e, "Connection closed with error");
            }
        });
    }
}
