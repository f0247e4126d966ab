//! Payload documents exchanged with devices.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Payload of a `device/<id>/metrics/<name>/define` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Help text shown in the exposition.
    #[serde(default)]
    pub help: Option<String>,

    /// Metric type token: "counter", "gauge" or "untyped" (any case).
    #[serde(default, rename = "type")]
    pub metric_type: Option<String>,

    /// Unit of the metric.
    #[serde(default)]
    pub unit: Option<String>,
}

/// Payload of a `device/<id>/metrics/<name>/push` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPush {
    /// Device supplied labels. `device_id` is always overridden.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,

    /// The observed value.
    pub value: f64,
}

/// Payload published on `device/<id>/server_error` when handling fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Topic of the message that failed.
    pub topic: String,
    /// Human readable error.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_all_optional() {
        let def: MetricDefinition = serde_json::from_str("{}").unwrap();
        assert_eq!(def, MetricDefinition::default());

        let def: MetricDefinition =
            serde_json::from_str(r#"{"help": "Temp", "type": "GAUGE", "unit": "celsius"}"#)
                .unwrap();
        assert_eq!(def.help.as_deref(), Some("Temp"));
        assert_eq!(def.metric_type.as_deref(), Some("GAUGE"));
        assert_eq!(def.unit.as_deref(), Some("celsius"));
    }

    #[test]
    fn test_push_requires_value() {
        assert!(serde_json::from_str::<MetricPush>(r#"{"labels": {}}"#).is_err());
        assert!(serde_json::from_str::<MetricPush>(r#"{"value": "12"}"#).is_err());

        let push: MetricPush = serde_json::from_str(r#"{"value": 12}"#).unwrap();
        assert_eq!(push.value, 12.0);
        assert!(push.labels.is_none());
    }

    #[test]
    fn test_push_with_labels() {
        let push: MetricPush =
            serde_json::from_str(r#"{"labels": {"room": "kitchen"}, "value": -1.5}"#).unwrap();
        assert_eq!(push.value, -1.5);
        assert_eq!(
            push.labels.unwrap().get("room").map(String::as_str),
            Some("kitchen")
        );
    }

    #[test]
    fn test_server_error_shape() {
        let err = ServerError {
            topic: "device/d/metrics/m/push".to_string(),
            error: "boom".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(json["topic"], "device/d/metrics/m/push");
        assert_eq!(json["error"], "boom");
    }
}
