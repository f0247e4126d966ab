//! Topic routing for device telemetry.
//!
//! Device topics follow the pattern `device/<device_id>/...`; metric topics
//! follow `device/<device_id>/metrics/<metric_name>/<action>`. Matching is
//! purely structural: segments are split on `/` and compared literally.

use std::fmt;

use crate::error::IngestError;

/// Leading literal segment of every device topic.
pub const DEVICE_PREFIX: &str = "device";

/// Mid-path literal segment preceding the metric name.
pub const METRICS_SEGMENT: &str = "metrics";

/// Last segment of a metric definition topic.
pub const DEFINE_SUFFIX: &str = "define";

/// Last segment of a metric push topic.
pub const PUSH_SUFFIX: &str = "push";

/// Last segment of the per-device diagnostic topic.
pub const SERVER_ERROR_SUFFIX: &str = "server_error";

/// Subscription filter matching every metric definition.
pub const DEFINE_FILTER: &str = "device/+/metrics/+/define";

/// Subscription filter matching every metric push.
pub const PUSH_FILTER: &str = "device/+/metrics/+/push";

/// Inbound action encoded in the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Declare a metric's help, type and unit.
    Define,
    /// Record a value for a metric.
    Push,
}

impl Action {
    /// Get the topic suffix for this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Define => DEFINE_SUFFIX,
            Action::Push => PUSH_SUFFIX,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric topic split into its identifying parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricTopic<'a> {
    /// Device identifier (second segment).
    pub device_id: &'a str,
    /// Metric name (fourth segment).
    pub metric_name: &'a str,
}

/// Split off the leading `device/<id>/` of a topic.
///
/// Returns the device id and the remainder after its trailing slash.
fn split_device(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix(DEVICE_PREFIX)?.strip_prefix('/')?;
    let (device_id, rest) = rest.split_once('/')?;
    if device_id.is_empty() {
        return None;
    }
    Some((device_id, rest))
}

/// Extract the device identifier from a topic.
///
/// # Example
/// ```
/// use mqtt_iot_exporter_core::topics::device_id;
///
/// assert_eq!(device_id("device/sensor-7/metrics/temp/push").unwrap(), "sensor-7");
/// assert!(device_id("devices/sensor-7/metrics").is_err());
/// ```
pub fn device_id(topic: &str) -> Result<&str, IngestError> {
    split_device(topic)
        .map(|(device_id, _)| device_id)
        .ok_or_else(|| IngestError::MalformedTopic(format!("no device id in topic '{}'", topic)))
}

/// Extract the device identifier and metric name from a metric topic.
///
/// This is matched independently of [`device_id`]: a topic can carry a
/// valid device id and still fail here.
///
/// # Example
/// ```
/// use mqtt_iot_exporter_core::topics::parse_metric_topic;
///
/// let parsed = parse_metric_topic("device/sensor-7/metrics/temp/define").unwrap();
/// assert_eq!(parsed.device_id, "sensor-7");
/// assert_eq!(parsed.metric_name, "temp");
/// ```
pub fn parse_metric_topic(topic: &str) -> Result<MetricTopic<'_>, IngestError> {
    let malformed =
        || IngestError::MalformedTopic(format!("no metric name in topic '{}'", topic));

    let (device_id, rest) = split_device(topic).ok_or_else(malformed)?;
    let rest = rest
        .strip_prefix(METRICS_SEGMENT)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(malformed)?;
    let (metric_name, _) = rest.split_once('/').ok_or_else(malformed)?;
    if metric_name.is_empty() {
        return Err(malformed());
    }

    Ok(MetricTopic {
        device_id,
        metric_name,
    })
}

/// Classify a topic by its last segment.
///
/// Returns `None` when the topic is neither a define nor a push topic.
pub fn action(topic: &str) -> Option<Action> {
    match topic.rsplit('/').next()? {
        DEFINE_SUFFIX => Some(Action::Define),
        PUSH_SUFFIX => Some(Action::Push),
        _ => None,
    }
}

/// Build the diagnostic topic for a device.
///
/// # Example
/// ```
/// use mqtt_iot_exporter_core::topics::server_error_topic;
///
/// assert_eq!(server_error_topic("sensor-7"), "device/sensor-7/server_error");
/// ```
pub fn server_error_topic(device_id: &str) -> String {
    format!("{}/{}/{}", DEVICE_PREFIX, device_id, SERVER_ERROR_SUFFIX)
}

/// Build a metric topic for a device, metric and action.
pub fn metric_topic(device_id: &str, metric_name: &str, action: Action) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        DEVICE_PREFIX,
        device_id,
        METRICS_SEGMENT,
        metric_name,
        action.as_str()
    )
}
