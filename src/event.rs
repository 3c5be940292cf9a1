use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Event;
use serde::{Deserialize, Serialize};

/// A Kubernetes event enriched with the name of the observing cluster.
///
/// The enrichment lets consumers of the Kafka topic tell apart events coming
/// from different clusters. The wrapped event is carried verbatim; its fields
/// serialize at the top level of the payload next to `clusterName`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnhancedEvent {
    #[serde(flatten)]
    pub event: Event,
    #[serde(rename = "clusterName")]
    pub cluster_name: String,
}

impl EnhancedEvent {
    pub fn new(event: Event, cluster_name: impl Into<String>) -> Self {
        EnhancedEvent {
            event,
            cluster_name: cluster_name.into(),
        }
    }

    /// The event UID, used as the Kafka record key.
    pub fn uid(&self) -> &str {
        self.event.metadata.uid.as_deref().unwrap_or_default()
    }

    /// When the event first occurred: `eventTime` if set, else
    /// `firstTimestamp`.
    pub fn first_occurrence(&self) -> Option<DateTime<Utc>> {
        self.event
            .event_time
            .as_ref()
            .map(|t| t.0)
            .or_else(|| self.event.first_timestamp.as_ref().map(|t| t.0))
    }

    /// The occurrence timestamp used for age computation: `lastTimestamp` if
    /// set, else `eventTime`.
    pub fn occurrence(&self) -> Option<DateTime<Utc>> {
        self.event
            .last_timestamp
            .as_ref()
            .map(|t| t.0)
            .or_else(|| self.event.event_time.as_ref().map(|t| t.0))
    }

    /// RFC3339 rendering of the first occurrence, empty when the event
    /// carries no timestamp at all.
    pub fn first_occurrence_rfc3339(&self) -> String {
        self.first_occurrence()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::Event;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};

    use super::EnhancedEvent;

    #[test]
    fn first_occurrence_prefers_event_time() {
        let event_time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let first_timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        let event = EnhancedEvent::new(
            Event {
                event_time: Some(MicroTime(event_time)),
                first_timestamp: Some(Time(first_timestamp)),
                ..Default::default()
            },
            "local",
        );
        assert_eq!(event.first_occurrence(), Some(event_time));
    }

    #[test]
    fn first_occurrence_falls_back_to_first_timestamp() {
        let first_timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        let event = EnhancedEvent::new(
            Event {
                first_timestamp: Some(Time(first_timestamp)),
                ..Default::default()
            },
            "local",
        );
        assert_eq!(event.first_occurrence(), Some(first_timestamp));
        assert_eq!(event.first_occurrence_rfc3339(), "2024-05-01T11:00:00Z");
    }

    #[test]
    fn occurrence_prefers_last_timestamp() {
        let last_timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let event_time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let event = EnhancedEvent::new(
            Event {
                last_timestamp: Some(Time(last_timestamp)),
                event_time: Some(MicroTime(event_time)),
                ..Default::default()
            },
            "local",
        );
        assert_eq!(event.occurrence(), Some(last_timestamp));
    }

    #[test]
    fn timestamps_absent() {
        let event = EnhancedEvent::new(Event::default(), "local");
        assert_eq!(event.first_occurrence(), None);
        assert_eq!(event.occurrence(), None);
        assert_eq!(event.first_occurrence_rfc3339(), "");
    }

    #[test]
    fn serialization_inlines_event_fields() {
        let event = EnhancedEvent::new(
            Event {
                reason: Some("Created".to_string()),
                ..Default::default()
            },
            "prod-eu",
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["clusterName"], "prod-eu");
        assert_eq!(value["reason"], "Created");
    }

    #[test]
    fn payload_round_trips() {
        let event = EnhancedEvent::new(
            Event {
                reason: Some("Created".to_string()),
                message: Some("Pod created successfully".to_string()),
                count: Some(2),
                ..Default::default()
            },
            "prod-eu",
        );
        let payload = serde_json::to_vec(&event).unwrap();
        let decoded: EnhancedEvent = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, event);
    }
}
