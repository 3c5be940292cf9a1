//! Pipeline scenarios driven through the public API: events written to the
//! shared buffers flow through the processor exactly as they would coming
//! from the watcher, without needing an apiserver or a broker.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

use event_relay::buffer::RingBuffer;
use event_relay::event::EnhancedEvent;
use event_relay::filter::FilterSpec;
use event_relay::payload::{PayloadProjector, Selector};
use event_relay::processor::{KafkaRecord, Processor};

fn event(uid: &str, kind: &str, reason: &str) -> EnhancedEvent {
    EnhancedEvent::new(
        Event {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some(format!("event-{uid}")),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some(kind.to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            ..Default::default()
        },
        "c",
    )
}

async fn run_until(
    processor: Processor,
    output: &RingBuffer<KafkaRecord>,
    expected: usize,
) {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(processor.run(cancel.clone()));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while output.len() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn filtering_publishes_only_matching_events() {
    let events = Arc::new(RingBuffer::new(16));
    let records = Arc::new(RingBuffer::new(16));
    events.write(event("uid-a", "Node", "NodeAllocatableEnforced"));
    events.write(event("uid-b", "Pod", "Created"));

    let filters = vec![FilterSpec {
        reason: "(?i)^created".to_string(),
        ..Default::default()
    }
    .compile()
    .unwrap()];

    let processor = Processor::new(events, records.clone(), filters, None);
    run_until(processor, &records, 1).await;

    let record = records.read().expect("exactly one record expected");
    assert!(records.read().is_none());
    assert_eq!(record.key, b"uid-b".to_vec());
    let decoded: EnhancedEvent = serde_json::from_slice(&record.value).unwrap();
    assert_eq!(decoded.event.reason.as_deref(), Some("Created"));
    assert_eq!(decoded, event("uid-b", "Pod", "Created"));
}

#[tokio::test]
async fn projection_shapes_the_published_payload() {
    let events = Arc::new(RingBuffer::new(16));
    let records = Arc::new(RingBuffer::new(16));
    events.write(event("uid-b", "Pod", "Created"));

    let projector = PayloadProjector::new(&[
        Selector {
            key: "cluster".to_string(),
            value: "{{ .ClusterName }}".to_string(),
        },
        Selector {
            key: "kind".to_string(),
            value: "{{ .InvolvedObject.Kind }}".to_string(),
        },
        Selector {
            key: "reason".to_string(),
            value: "{{ .Reason }}".to_string(),
        },
    ])
    .unwrap();

    let processor = Processor::new(events, records.clone(), Vec::new(), Some(projector));
    run_until(processor, &records, 1).await;

    let record = records.read().unwrap();
    assert_eq!(
        String::from_utf8(record.value).unwrap(),
        r#"{"cluster":"c","kind":"Pod","reason":"Created"}"#
    );
}

#[tokio::test]
async fn broken_selector_publishes_the_fallback_fields() {
    let events = Arc::new(RingBuffer::new(16));
    let records = Arc::new(RingBuffer::new(16));
    events.write(event("uid-b", "Pod", "Created"));

    let projector = PayloadProjector::new(&[Selector {
        key: "x".to_string(),
        value: "{{ .Missing }}".to_string(),
    }])
    .unwrap();

    let processor = Processor::new(events, records.clone(), Vec::new(), Some(projector));
    run_until(processor, &records, 1).await;

    let record = records.read().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&record.value).unwrap();
    assert_eq!(value["cluster"], "c");
    assert_eq!(value["kind"], "Pod");
    assert_eq!(value["namespace"], "default");
    assert_eq!(value["reason"], "Created");
    assert!(value.get("x").is_none());
}

#[tokio::test]
async fn overload_drops_the_oldest_events_silently() {
    let capacity = 8;
    let events = Arc::new(RingBuffer::new(capacity));
    let records = Arc::new(RingBuffer::new(2 * capacity));

    // Twice the buffer capacity arrives before the processor gets a chance
    // to run; the oldest half is displaced.
    for i in 0..2 * capacity {
        events.write(event(&format!("uid-{i:02}"), "Pod", "Created"));
    }

    let processor = Processor::new(events, records.clone(), Vec::new(), None);
    run_until(processor, &records, capacity).await;

    assert_eq!(records.len(), capacity);
    for i in capacity..2 * capacity {
        let record = records.read().unwrap();
        assert_eq!(record.key, format!("uid-{i:02}").into_bytes());
    }
}
