//! Prometheus text exposition of the registry and connection counters.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

use mqtt_iot_exporter_core::registry::DEVICE_ID_LABEL;
use mqtt_iot_exporter_core::{MetricFamily, MetricType, Observation};
use tracing::{trace, warn};

use crate::stats::StatsSnapshot;

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Names of the connection counters. Device families are never rendered
/// under these names.
pub const SYSTEM_METRICS: [&str; 3] = [
    "mqtt_connected_clients",
    "mqtt_total_connections",
    "mqtt_unclean_disconnects",
];

/// Render device metrics followed by the connection counters.
///
/// Families without a single renderable sample are left out. A sample is
/// rendered from the slot of the family's current type.
///
/// Families whose names sanitize to the same Prometheus name are merged when
/// their types agree. Otherwise the first family in name order wins and the
/// others are dropped. Within one name, a label set is rendered once.
pub fn render(families: &[MetricFamily], stats: &StatsSnapshot) -> String {
    let mut output = String::with_capacity(families.len() * 128 + 512);

    let mut groups: BTreeMap<String, Vec<&MetricFamily>> = BTreeMap::new();
    for family in families {
        let name = sanitize_metric_name(&family.name);
        if SYSTEM_METRICS.contains(&name.as_str()) {
            warn!(metric = %family.name, "Metric name is reserved, not exported");
            continue;
        }
        groups.entry(name).or_default().push(family);
    }

    for (name, group) in &groups {
        render_group(&mut output, name, group);
    }

    write_system_metric(
        &mut output,
        SYSTEM_METRICS[0],
        "Number of currently connected MQTT clients to MQTT IoT exporter",
        MetricType::Gauge,
        stats.connected_clients as f64,
    );
    write_system_metric(
        &mut output,
        SYSTEM_METRICS[1],
        "Total number of MQTT connections that were established to the MQTT IoT exporter",
        MetricType::Counter,
        stats.total_connections as f64,
    );
    write_system_metric(
        &mut output,
        SYSTEM_METRICS[2],
        "Total number of disconnects with a network error",
        MetricType::Counter,
        stats.unclean_disconnects as f64,
    );

    output
}

fn render_group(output: &mut String, name: &str, group: &[&MetricFamily]) {
    let mut leader: Option<&MetricFamily> = None;
    let mut seen = HashSet::new();
    let mut lines = Vec::new();

    for family in group {
        let samples: Vec<_> = family
            .observations
            .iter()
            .filter_map(|o| o.value(family.metric_type).map(|v| (o, v)))
            .collect();

        if samples.is_empty() {
            trace!(metric = %family.name, "Skipping family without samples");
            continue;
        }

        match leader {
            None => leader = Some(family),
            Some(first) if first.metric_type != family.metric_type => {
                warn!(
                    metric = %family.name,
                    conflicts_with = %first.name,
                    exported_as = %name,
                    "Metric name collides with a family of another type, not exported"
                );
                continue;
            }
            Some(_) => {}
        }

        for (observation, value) in samples {
            let labels = format_labels(&sample_labels(observation));
            if !seen.insert(labels.clone()) {
                warn!(
                    metric = %family.name,
                    labels = %labels,
                    "Duplicate series after name sanitizing, not exported"
                );
                continue;
            }
            lines.push(format!("{}{} {}", name, labels, format_value(value)));
        }
    }

    let Some(leader) = leader else {
        return;
    };

    if let Some(help) = &leader.help {
        writeln!(output, "# HELP {} {}", name, escape_help(help)).ok();
    }
    if let Some(unit) = &leader.unit {
        writeln!(output, "# UNIT {} {}", name, escape_help(unit)).ok();
    }
    writeln!(output, "# TYPE {} {}", name, leader.metric_type.as_str()).ok();
    for line in lines {
        output.push_str(&line);
        output.push('\n');
    }
}

/// Sanitized labels of one sample, sorted by name.
///
/// `device_id` always keeps its own value. Among device labels that sanitize
/// to the same name, the first in key order wins.
fn sample_labels(observation: &Observation) -> Vec<(String, &str)> {
    let mut labels: BTreeMap<String, &str> = BTreeMap::new();

    if let Some(device_id) = observation.labels.get(DEVICE_ID_LABEL) {
        labels.insert(DEVICE_ID_LABEL.to_string(), device_id.as_str());
    }

    for (key, value) in &observation.labels {
        if key == DEVICE_ID_LABEL {
            continue;
        }
        let sanitized = sanitize_label_name(key);
        if labels.contains_key(&sanitized) {
            trace!(label = %key, "Dropping label that collides after sanitizing");
            continue;
        }
        labels.insert(sanitized, value.as_str());
    }

    labels.into_iter().collect()
}

fn write_system_metric(
    output: &mut String,
    name: &str,
    help: &str,
    metric_type: MetricType,
    value: f64,
) {
    writeln!(output, "# HELP {} {}", name, help).ok();
    writeln!(output, "# TYPE {} {}", name, metric_type.as_str()).ok();
    writeln!(output, "{} {}", name, format_value(value)).ok();
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`. Invalid
/// characters become underscores and a leading digit gets an underscore
/// prefix.
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, true)
}

/// Sanitize a label name to be Prometheus-compatible.
///
/// Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn sanitize_label_name(name: &str) -> String {
    sanitize(name, false)
}

fn sanitize(name: &str, allow_colon: bool) -> String {
    let mut result = String::with_capacity(name.len() + 1);

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
            result.push(c);
        } else {
            result.push('_');
        }
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Escape special characters in HELP text.
fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format labels for Prometheus exposition format.
fn format_labels(labels: &[(String, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
