//! Integration tests for the ingestion path: topics, ACLs, registry and dispatcher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use mqtt_iot_exporter_core::topics::{self, Action};
use mqtt_iot_exporter_core::{
    Access, Authorizer, ClientInfo, DiagnosticSink, DeviceTopicAuthorizer, Dispatcher,
    InboundMessage, IngestError, MetricDefinition, MetricRegistry, MetricType, Outcome,
};

/// Sink that discards everything.
struct NullSink;

impl DiagnosticSink for NullSink {
    fn publish(&self, _topic: &str, _payload: Vec<u8>) {}
}

fn labels(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

fn typed(metric_type: &str) -> MetricDefinition {
    MetricDefinition {
        metric_type: Some(metric_type.to_string()),
        ..Default::default()
    }
}

#[test]
fn test_topic_router_extracts_device_and_metric() {
    for (device, metric) in [("D", "M"), ("sensor-01", "cpu.temp"), ("a b", "x_y")] {
        for action in [Action::Define, Action::Push] {
            let topic = topics::metric_topic(device, metric, action);
            let parsed = topics::parse_metric_topic(&topic).unwrap();
            assert_eq!(parsed.device_id, device);
            assert_eq!(parsed.metric_name, metric);
            assert_eq!(topics::device_id(&topic).unwrap(), device);
        }
    }

    for topic in ["", "device", "device/", "dev/D/metrics/M/push", "D/metrics/M/push"] {
        assert!(
            matches!(topics::device_id(topic), Err(IngestError::MalformedTopic(_))),
            "{topic} should not yield a device id"
        );
    }
}

#[test]
fn test_acl_follows_topic_device() {
    let auth = DeviceTopicAuthorizer;
    let topic = "device/D/metrics/M/push";

    assert!(auth.on_acl_check(&ClientInfo::new("c", "D"), topic, Access::Publish));
    assert!(!auth.on_acl_check(&ClientInfo::new("c", "D2"), topic, Access::Publish));
    assert!(!auth.on_acl_check(&ClientInfo::new("c", "D"), "garbage", Access::Publish));
}

#[test]
fn test_repush_keeps_single_observation() {
    let registry = MetricRegistry::new();
    registry.define("m", &typed("gauge")).unwrap();

    registry.push("m", "d", labels(&[("a", "1")]), 1.0).unwrap();
    registry.push("m", "d", labels(&[("a", "1")]), 9.0).unwrap();

    let family = registry.get("m").unwrap();
    assert_eq!(family.observations.len(), 1);
    assert_eq!(family.observations[0].gauge, Some(9.0));
}

#[test]
fn test_push_requires_define() {
    let registry = MetricRegistry::new();

    let err = registry.push("m", "d", None, 1.0).unwrap_err();
    assert!(matches!(err, IngestError::UnknownMetric(_)));

    registry.define("m", &typed("counter")).unwrap();
    registry.push("m", "d", None, 4.0).unwrap();

    let family = registry.get("m").unwrap();
    assert_eq!(family.observations[0].counter, Some(4.0));
    assert_eq!(family.observations[0].gauge, None);
    assert_eq!(family.observations[0].untyped, None);
}

#[test]
fn test_label_order_does_not_matter() {
    let registry = MetricRegistry::new();
    registry.define("m", &MetricDefinition::default()).unwrap();

    // HashMap iteration order differs between builds of the map; insert in
    // both orders to make sure it does not leak into matching.
    let mut first = HashMap::new();
    first.insert("a".to_string(), "1".to_string());
    first.insert("b".to_string(), "2".to_string());
    let mut second = HashMap::new();
    second.insert("b".to_string(), "2".to_string());
    second.insert("a".to_string(), "1".to_string());

    registry.push("m", "d", Some(first), 1.0).unwrap();
    registry.push("m", "d", Some(second), 2.0).unwrap();

    let family = registry.get("m").unwrap();
    assert_eq!(family.observations.len(), 1);
    assert_eq!(family.observations[0].untyped, Some(2.0));
}

#[test]
fn test_type_switch_does_not_convert_slots() {
    let registry = MetricRegistry::new();
    registry.define("m", &typed("gauge")).unwrap();
    registry.push("m", "d", labels(&[("k", "v")]), 5.0).unwrap();

    registry.define("m", &typed("counter")).unwrap();
    registry.push("m", "d", labels(&[("k", "v")]), 7.0).unwrap();

    let family = registry.get("m").unwrap();
    assert_eq!(family.metric_type, MetricType::Counter);
    assert_eq!(family.observations.len(), 1);
    assert_eq!(family.observations[0].counter, Some(7.0));
    assert_eq!(family.observations[0].gauge, Some(5.0));
    assert_eq!(family.observations[0].value(MetricType::Counter), Some(7.0));
}

#[test]
fn test_concurrent_pushes_distinct_label_sets() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    for _round in 0..20 {
        let registry = Arc::new(MetricRegistry::new());
        registry.define("m", &typed("gauge")).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let value = (t * PER_THREAD + i) as f64;
                        let series = i.to_string();
                        registry
                            .push("m", &format!("d{t}"), labels(&[("series", series.as_str())]), value)
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let family = registry.get("m").unwrap();
        assert_eq!(family.observations.len(), THREADS * PER_THREAD);

        let distinct: HashSet<_> = family.observations.iter().map(|o| &o.labels).collect();
        assert_eq!(distinct.len(), THREADS * PER_THREAD);

        for obs in &family.observations {
            let device: usize = obs.labels["device_id"][1..].parse().unwrap();
            let series: usize = obs.labels["series"].parse().unwrap();
            assert_eq!(obs.gauge, Some((device * PER_THREAD + series) as f64));
        }
    }
}

#[test]
fn test_concurrent_pushes_same_label_set_keep_one() {
    let registry = Arc::new(MetricRegistry::new());
    registry.define("m", &typed("counter")).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    registry
                        .push("m", "d", labels(&[("k", "v")]), (t * 1000 + i) as f64)
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let family = registry.get("m").unwrap();
    assert_eq!(family.observations.len(), 1);
    let last = family.observations[0].counter.unwrap();
    // Last writer wins: the value is the final push of one of the threads.
    assert_eq!(last % 1000.0, 199.0);
}

#[test]
fn test_snapshot_never_sees_partial_state() {
    const SERIES: usize = 300;

    let registry = Arc::new(MetricRegistry::new());

    let writer = {
        let registry = registry.clone();
        thread::spawn(move || {
            registry.define("m", &typed("gauge")).unwrap();
            for i in 0..SERIES {
                registry
                    .push("m", "d", labels(&[("i", i.to_string().as_str())]), i as f64)
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                loop {
                    let snapshot = registry.snapshot();
                    let Some(family) = snapshot.iter().find(|f| f.name == "m") else {
                        continue;
                    };

                    assert_eq!(family.metric_type, MetricType::Gauge);
                    // Every observation visible is complete, and they form a
                    // prefix of the writer's sequence.
                    for (index, obs) in family.observations.iter().enumerate() {
                        assert_eq!(obs.labels["i"], index.to_string());
                        assert_eq!(obs.gauge, Some(index as f64));
                    }

                    if family.observations.len() == SERIES {
                        break;
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_dispatcher_from_many_devices() {
    let registry = Arc::new(MetricRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), Arc::new(NullSink)));

    let define = topics::metric_topic("d0", "uptime", Action::Define);
    let client = ClientInfo::new("c0", "d0");
    assert_eq!(
        dispatcher.handle(&InboundMessage {
            topic: &define,
            payload: br#"{"type": "counter", "help": "Uptime"}"#,
            client: &client,
        }),
        Outcome::Applied(Action::Define)
    );

    let handles: Vec<_> = (0..6)
        .map(|d| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                let device = format!("d{d}");
                let client = ClientInfo::new(format!("c{d}"), device.clone());
                let topic = topics::metric_topic(&device, "uptime", Action::Push);
                for i in 0..20 {
                    let payload = format!(r#"{{"value": {i}}}"#);
                    let outcome = dispatcher.handle(&InboundMessage {
                        topic: &topic,
                        payload: payload.as_bytes(),
                        client: &client,
                    });
                    assert_eq!(outcome, Outcome::Applied(Action::Push));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let family = registry.get("uptime").unwrap();
    assert_eq!(family.observations.len(), 6);
    assert!(family.observations.iter().all(|o| o.counter == Some(19.0)));
}
