use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event as CoreEvent;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use metrics::counter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::RingBuffer;
use crate::event::EnhancedEvent;

pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(60);
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("initial cache sync failed: timed out after {0:?}")]
    SyncTimeout(Duration),
    #[error("initial cache sync failed: canceled before completion")]
    SyncCanceled,
}

/// Watcher options, filled in explicitly by the caller.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub cluster_name: String,
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Events older than this are dropped during the initial list replay.
    pub max_event_age: Duration,
    /// How long the initial list may take before the watcher gives up.
    pub sync_timeout: Duration,
}

/// The first pipeline stage: watches the Events resource and writes enriched
/// copies into the event buffer until cancelled.
pub struct Watcher {
    api: Api<CoreEvent>,
    sync_timeout: Duration,
    ingest: EventIngest,
}

impl Watcher {
    pub fn new(
        client: Client,
        config: WatcherConfig,
        output: Arc<RingBuffer<EnhancedEvent>>,
    ) -> Self {
        let api = match &config.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        Watcher {
            api,
            sync_timeout: config.sync_timeout,
            ingest: EventIngest {
                cluster_name: config.cluster_name,
                max_event_age: config.max_event_age,
                output,
                seen: HashMap::new(),
            },
        }
    }

    /// Watches until the token is cancelled. Fails only when the initial
    /// cache sync cannot complete; later stream errors are retried with
    /// backoff by the watch machinery and merely logged here.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WatchError> {
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        let mut stream = pin!(stream);

        let sync_deadline = tokio::time::sleep(self.sync_timeout);
        let mut sync_deadline = pin!(sync_deadline);
        let mut synced = false;

        info!("syncing initial watcher cache");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return if synced {
                        Ok(())
                    } else {
                        Err(WatchError::SyncCanceled)
                    };
                }
                _ = &mut sync_deadline, if !synced => {
                    return Err(WatchError::SyncTimeout(self.sync_timeout));
                }
                item = stream.next() => match item {
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitApply(event))) => {
                        self.ingest.on_initial(event);
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        if !synced {
                            synced = true;
                            info!("initial watcher cache synced");
                        }
                    }
                    Some(Ok(watcher::Event::Apply(event))) => self.ingest.on_apply(event),
                    Some(Ok(watcher::Event::Delete(event))) => self.ingest.on_delete(&event),
                    Some(Err(err)) => {
                        warn!(error = %err, "watch stream error, retrying");
                    }
                    None => {
                        warn!("watch stream ended unexpectedly");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Handler state shared by the initial list replay and the live watch:
/// enrichment, the age gate, and resource-version deduplication.
struct EventIngest {
    cluster_name: String,
    max_event_age: Duration,
    output: Arc<RingBuffer<EnhancedEvent>>,
    seen: HashMap<String, String>,
}

impl EventIngest {
    /// Initial-list delivery. Events whose occurrence is older than
    /// `max_event_age` are dropped; they are still recorded so a later
    /// relist does not resurrect them.
    fn on_initial(&mut self, event: CoreEvent) {
        let event = EnhancedEvent::new(event, self.cluster_name.clone());
        if self.exceeds_max_age(&event) {
            counter!("relay_events_dropped_total", "reason" => "age").increment(1);
            debug!(
                namespace = event.event.metadata.namespace.as_deref().unwrap_or_default(),
                name = event.event.metadata.name.as_deref().unwrap_or_default(),
                "event does not meet the age criteria"
            );
            self.record(&event);
            return;
        }
        self.record(&event);
        self.deliver(event);
    }

    /// Live add or update. Deliveries with an unchanged resource version are
    /// relist re-runs or resync noise and are suppressed.
    fn on_apply(&mut self, event: CoreEvent) {
        let unchanged = event.metadata.uid.as_ref().is_some_and(|uid| {
            self.seen.get(uid) == Some(&resource_version(&event))
        });
        if unchanged {
            return;
        }
        let event = EnhancedEvent::new(event, self.cluster_name.clone());
        self.record(&event);
        self.deliver(event);
    }

    /// Deletions are not exported; just stop tracking the object.
    fn on_delete(&mut self, event: &CoreEvent) {
        if let Some(uid) = &event.metadata.uid {
            self.seen.remove(uid);
        }
    }

    fn record(&mut self, event: &EnhancedEvent) {
        if let Some(uid) = &event.event.metadata.uid {
            self.seen.insert(uid.clone(), resource_version(&event.event));
        }
    }

    fn deliver(&mut self, event: EnhancedEvent) {
        counter!("relay_events_received_total").increment(1);
        debug!(
            namespace = event.event.metadata.namespace.as_deref().unwrap_or_default(),
            name = event.event.metadata.name.as_deref().unwrap_or_default(),
            reason = event.event.reason.as_deref().unwrap_or_default(),
            regarding = event.event.involved_object.name.as_deref().unwrap_or_default(),
            "received event"
        );
        self.output.write(event);
    }

    fn exceeds_max_age(&self, event: &EnhancedEvent) -> bool {
        let Some(occurred) = event.occurrence() else {
            // No usable timestamp; treat as stale rather than replaying
            // arbitrarily old history.
            return true;
        };
        let age = (Utc::now() - occurred).to_std().unwrap_or_default();
        age > self.max_event_age
    }
}

fn resource_version(event: &CoreEvent) -> String {
    event.metadata.resource_version.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use k8s_openapi::api::core::v1::Event as CoreEvent;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use tokio_util::sync::CancellationToken;

    use super::{EventIngest, WatchError, Watcher, WatcherConfig};
    use crate::buffer::RingBuffer;
    use crate::event::EnhancedEvent;

    fn ingest(output: Arc<RingBuffer<EnhancedEvent>>) -> EventIngest {
        EventIngest {
            cluster_name: "tests.local".to_string(),
            max_event_age: Duration::from_secs(60),
            output,
            seen: HashMap::new(),
        }
    }

    fn event(uid: &str, resource_version: &str, age: Duration) -> CoreEvent {
        CoreEvent {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                resource_version: Some(resource_version.to_string()),
                name: Some(format!("event-{uid}")),
                ..Default::default()
            },
            last_timestamp: Some(Time(
                Utc::now() - chrono::Duration::from_std(age).unwrap(),
            )),
            ..Default::default()
        }
    }

    #[test]
    fn initial_list_applies_age_gate() {
        let output = Arc::new(RingBuffer::new(8));
        let mut ingest = ingest(output.clone());

        ingest.on_initial(event("old", "1", Duration::from_secs(120)));
        assert!(output.is_empty());

        ingest.on_initial(event("fresh", "2", Duration::from_secs(5)));
        assert_eq!(output.len(), 1);
        let delivered = output.read().unwrap();
        assert_eq!(delivered.uid(), "fresh");
        assert_eq!(delivered.cluster_name, "tests.local");
    }

    #[test]
    fn initial_list_drops_events_without_timestamps() {
        let output = Arc::new(RingBuffer::new(8));
        let mut ingest = ingest(output.clone());

        let mut no_timestamp = event("bare", "1", Duration::ZERO);
        no_timestamp.last_timestamp = None;
        ingest.on_initial(no_timestamp);
        assert!(output.is_empty());
    }

    #[test]
    fn live_events_bypass_the_age_gate() {
        let output = Arc::new(RingBuffer::new(8));
        let mut ingest = ingest(output.clone());

        ingest.on_apply(event("old", "1", Duration::from_secs(3600)));
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn unchanged_resource_version_is_deduplicated() {
        let output = Arc::new(RingBuffer::new(8));
        let mut ingest = ingest(output.clone());

        ingest.on_apply(event("uid-a", "100", Duration::ZERO));
        ingest.on_apply(event("uid-a", "100", Duration::ZERO));
        assert_eq!(output.len(), 1);

        ingest.on_apply(event("uid-a", "101", Duration::ZERO));
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn age_dropped_initial_events_stay_deduplicated() {
        let output = Arc::new(RingBuffer::new(8));
        let mut ingest = ingest(output.clone());

        let stale = event("old", "1", Duration::from_secs(120));
        ingest.on_initial(stale.clone());
        // A relist redelivers the same object at the same resource version.
        ingest.on_apply(stale);
        assert!(output.is_empty());
    }

    #[test]
    fn delete_clears_tracking() {
        let output = Arc::new(RingBuffer::new(8));
        let mut ingest = ingest(output.clone());

        let ev = event("uid-a", "100", Duration::ZERO);
        ingest.on_apply(ev.clone());
        ingest.on_delete(&ev);
        // Same resource version shows up again after the delete; without the
        // tracking entry it is delivered anew.
        ingest.on_apply(event("uid-a", "100", Duration::ZERO));
        assert_eq!(output.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_initial_sync() {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let watcher = Watcher::new(
            client,
            WatcherConfig {
                cluster_name: "tests.local".to_string(),
                namespace: Some("default".to_string()),
                max_event_age: Duration::from_secs(60),
                sync_timeout: Duration::from_millis(200),
            },
            Arc::new(RingBuffer::new(8)),
        );

        let err = watcher.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WatchError::SyncTimeout(_)));
    }

    #[tokio::test]
    async fn cancellation_before_sync_is_an_error() {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let watcher = Watcher::new(
            client,
            WatcherConfig {
                cluster_name: "tests.local".to_string(),
                namespace: None,
                max_event_age: Duration::from_secs(60),
                sync_timeout: Duration::from_secs(30),
            },
            Arc::new(RingBuffer::new(8)),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = watcher.run(cancel).await.unwrap_err();
        assert!(matches!(err, WatchError::SyncCanceled));
    }
}
