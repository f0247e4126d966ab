//! The metric registry shared by ingestion and exposition.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::IngestError;
use crate::schema::MetricDefinition;

/// Label key injected into every observation.
pub const DEVICE_ID_LABEL: &str = "device_id";

/// Label set of an observation.
///
/// Kept sorted by key so two sets compare equal whenever they hold the same
/// pairs, regardless of the order the device sent them in.
pub type LabelSet = BTreeMap<String, String>;

/// Prometheus metric type of a family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    #[default]
    Untyped,
}

impl MetricType {
    /// Get the exposition name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [MetricType::Counter, MetricType::Gauge, MetricType::Untyped]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IngestError::UnknownMetricType(s.to_string()))
    }
}

/// One label-tagged value within a family.
///
/// Each type has its own slot. A push writes the slot matching the family's
/// type at that moment; the other slots keep whatever they held.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub labels: LabelSet,
    pub counter: Option<f64>,
    pub gauge: Option<f64>,
    pub untyped: Option<f64>,
}

impl Observation {
    fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }

    /// Read the slot for a metric type.
    pub fn value(&self, metric_type: MetricType) -> Option<f64> {
        match metric_type {
            MetricType::Counter => self.counter,
            MetricType::Gauge => self.gauge,
            MetricType::Untyped => self.untyped,
        }
    }

    fn set(&mut self, metric_type: MetricType, value: f64) {
        let slot = match metric_type {
            MetricType::Counter => &mut self.counter,
            MetricType::Gauge => &mut self.gauge,
            MetricType::Untyped => &mut self.untyped,
        };
        *slot = Some(value);
    }
}

/// A named, typed collection of observations.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub unit: Option<String>,
    pub metric_type: MetricType,
    /// Observations in first-push order. No two share a label set.
    pub observations: Vec<Observation>,
}

impl MetricFamily {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            help: None,
            unit: None,
            metric_type: MetricType::default(),
            observations: Vec::new(),
        }
    }

    /// Find the observation with exactly this label set.
    pub fn observation(&self, labels: &LabelSet) -> Option<&Observation> {
        self.observations.iter().find(|o| &o.labels == labels)
    }
}

/// Build the label set stored for a push: device labels plus `device_id`.
///
/// The device id is inserted last, so it wins over a device supplied
/// `device_id` label.
pub fn effective_labels(device_id: &str, labels: Option<HashMap<String, String>>) -> LabelSet {
    let mut set: LabelSet = labels.unwrap_or_default().into_iter().collect();
    set.insert(DEVICE_ID_LABEL.to_string(), device_id.to_string());
    set
}

/// Process-wide store of metric families behind a single reader/writer lock.
///
/// Every mutation takes the lock exclusively for its whole duration, and
/// every snapshot takes it shared, so readers never see half a mutation.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    families: RwLock<HashMap<String, MetricFamily>>,
}

/// Shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare or redeclare a metric.
    ///
    /// Help and unit are replaced (and cleared when absent). The type only
    /// changes when a token is supplied. An unknown type token fails the
    /// whole call before anything is applied.
    pub fn define(&self, name: &str, definition: &MetricDefinition) -> Result<(), IngestError> {
        let metric_type = definition
            .metric_type
            .as_deref()
            .map(MetricType::from_str)
            .transpose()?;

        let mut families = self.families.write();
        let family = families
            .entry(name.to_string())
            .or_insert_with(|| MetricFamily::new(name));

        family.help = definition.help.clone();
        if let Some(metric_type) = metric_type {
            family.metric_type = metric_type;
        }
        family.unit = definition.unit.clone();

        debug!(
            metric = %name,
            metric_type = %family.metric_type,
            "Metric defined"
        );
        Ok(())
    }

    /// Record a value for a device.
    ///
    /// Fails with [`IngestError::UnknownMetric`] when the metric was never
    /// defined. An existing observation with the same label set is updated
    /// in place; otherwise a new one is appended.
    pub fn push(
        &self,
        name: &str,
        device_id: &str,
        labels: Option<HashMap<String, String>>,
        value: f64,
    ) -> Result<(), IngestError> {
        let labels = effective_labels(device_id, labels);

        let mut families = self.families.write();
        let family = families
            .get_mut(name)
            .ok_or_else(|| IngestError::UnknownMetric(name.to_string()))?;

        let metric_type = family.metric_type;
        let index = match family.observations.iter().position(|o| o.labels == labels) {
            Some(index) => index,
            None => {
                family.observations.push(Observation::new(labels));
                family.observations.len() - 1
            }
        };
        family.observations[index].set(metric_type, value);

        trace!(
            metric = %name,
            device_id = %device_id,
            value,
            "Metric value recorded"
        );
        Ok(())
    }

    /// Take a point-in-time copy of every family, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricFamily> {
        let families = self.families.read();
        let mut snapshot: Vec<MetricFamily> = families.values().cloned().collect();
        drop(families);

        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Get a copy of a single family.
    pub fn get(&self, name: &str) -> Option<MetricFamily> {
        self.families.read().get(name).cloned()
    }

    /// Number of defined families.
    pub fn len(&self) -> usize {
        self.families.read().len()
    }

    /// Whether no family has been defined yet.
    pub fn is_empty(&self) -> bool {
        self.families.read().is_empty()
    }
}
