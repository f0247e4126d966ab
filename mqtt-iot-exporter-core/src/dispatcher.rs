//! Ingestion dispatcher: turns inbound device messages into registry calls.
//!
//! Failures never escape: each one becomes a single diagnostic message on
//! `device/<device_id>/server_error` so the device can see what went wrong.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::auth::ClientInfo;
use crate::error::IngestError;
use crate::registry::SharedRegistry;
use crate::schema::{MetricDefinition, MetricPush, ServerError};
use crate::topics::{self, Action};

/// Destination for diagnostic messages.
pub trait DiagnosticSink: Send + Sync {
    /// Publish a payload on a topic, best effort.
    fn publish(&self, topic: &str, payload: Vec<u8>);
}

/// A message delivered by the transport.
#[derive(Debug, Clone, Copy)]
pub struct InboundMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    /// Connection the message arrived on.
    pub client: &'a ClientInfo,
}

/// What happened to a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The registry was updated.
    Applied(Action),
    /// The topic is not a define or push topic.
    Ignored,
    /// Handling failed and a diagnostic was published.
    Reported,
    /// Handling failed and no diagnostic could be published.
    Dropped,
    /// Handling panicked.
    Panicked,
}

/// Routes define and push messages to the metric registry.
pub struct Dispatcher {
    registry: SharedRegistry,
    sink: Arc<dyn DiagnosticSink>,
}

impl Dispatcher {
    /// Create a dispatcher writing into `registry` and reporting to `sink`.
    pub fn new(registry: SharedRegistry, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { registry, sink }
    }

    /// Handle one inbound message.
    pub fn handle(&self, message: &InboundMessage<'_>) -> Outcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match self.dispatch(message) {
            Ok(Some(action)) => Outcome::Applied(action),
            Ok(None) => Outcome::Ignored,
            Err(err) => self.report(message, &err),
        }));

        result.unwrap_or_else(|panic| {
            error!(
                topic = %message.topic,
                client_id = %message.client.client_id,
                panic = %panic_message(panic.as_ref()),
                "Panic while handling message"
            );
            Outcome::Panicked
        })
    }

    fn dispatch(&self, message: &InboundMessage<'_>) -> Result<Option<Action>, IngestError> {
        let Some(action) = topics::action(message.topic) else {
            return Ok(None);
        };

        match action {
            Action::Define => {
                let definition: MetricDefinition = serde_json::from_slice(message.payload)?;
                let topic = topics::parse_metric_topic(message.topic)?;
                self.registry.define(topic.metric_name, &definition)?;
            }
            Action::Push => {
                let push: MetricPush = serde_json::from_slice(message.payload)?;
                let topic = topics::parse_metric_topic(message.topic)?;
                self.registry
                    .push(topic.metric_name, topic.device_id, push.labels, push.value)?;
            }
        }

        Ok(Some(action))
    }

    fn report(&self, message: &InboundMessage<'_>, err: &IngestError) -> Outcome {
        warn!(
            topic = %message.topic,
            client_id = %message.client.client_id,
            error = %err,
            "Handling message failed"
        );

        // Recovered on its own: the failure may have been the metric pattern.
        let Ok(device_id) = topics::device_id(message.topic) else {
            warn!(
                topic = %message.topic,
                error = %err,
                "No device id in topic, error not reported to device"
            );
            return Outcome::Dropped;
        };

        let report = ServerError {
            topic: message.topic.to_string(),
            error: err.to_string(),
        };
        let payload = match serde_json::to_vec(&report) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic = %message.topic, error = %e, "Failed to encode error report");
                return Outcome::Dropped;
            }
        };

        let error_topic = topics::server_error_topic(device_id);
        debug!(topic = %error_topic, "Publishing error report");
        self.sink.publish(&error_topic, payload);
        Outcome::Reported
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
