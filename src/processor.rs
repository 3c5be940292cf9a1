use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::RingBuffer;
use crate::event::EnhancedEvent;
use crate::filter::{any_matches, Filter};
use crate::payload::{relevant_fields, PayloadProjector};

/// How often the processor polls its input buffer. The buffer's
/// overwrite-on-full semantics rule out a blocking receive, so the stage
/// polls; 100ms bounds the added latency while keeping cancellation prompt.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A record ready to be published: key is the event UID, value the JSON
/// payload.
#[derive(Clone, Debug, PartialEq)]
pub struct KafkaRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// The middle pipeline stage: reads events, applies the filter set, shapes
/// the payload and emits ready-to-send records.
pub struct Processor {
    source: Arc<RingBuffer<EnhancedEvent>>,
    output: Arc<RingBuffer<KafkaRecord>>,
    filters: Vec<Filter>,
    projector: Option<PayloadProjector>,
}

impl Processor {
    pub fn new(
        source: Arc<RingBuffer<EnhancedEvent>>,
        output: Arc<RingBuffer<KafkaRecord>>,
        filters: Vec<Filter>,
        projector: Option<PayloadProjector>,
    ) -> Self {
        Processor {
            source,
            output,
            filters,
            projector,
        }
    }

    /// Runs until the token is cancelled. All per-event failures are handled
    /// locally; this stage never aborts the pipeline.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let Some(event) = self.source.read() else {
                        continue;
                    };
                    self.process(event);
                }
            }
        }
    }

    fn process(&self, event: EnhancedEvent) {
        if !self.filters.is_empty() && !any_matches(&self.filters, &event) {
            counter!("relay_events_filtered_total").increment(1);
            debug!(
                namespace = event.event.metadata.namespace.as_deref().unwrap_or_default(),
                name = event.event.metadata.name.as_deref().unwrap_or_default(),
                reason = event.event.reason.as_deref().unwrap_or_default(),
                "event filtered out"
            );
            return;
        }

        let value = match self.payload(&event) {
            Some(value) => value,
            None => return,
        };
        self.output.write(KafkaRecord {
            key: event.uid().as_bytes().to_vec(),
            value,
        });
        counter!("relay_events_processed_total").increment(1);
    }

    fn payload(&self, event: &EnhancedEvent) -> Option<Vec<u8>> {
        let value = match &self.projector {
            Some(projector) => {
                let fields = projector.project(event).unwrap_or_else(|err| {
                    warn!(
                        error = %err,
                        "failed to select fields from event, falling back to relevant fields"
                    );
                    relevant_fields(event)
                });
                serde_json::to_vec(&fields)
            }
            None => serde_json::to_vec(event),
        };
        match value {
            Ok(value) => Some(value),
            Err(err) => {
                // Serialization of maps and events is effectively infallible;
                // drop the event rather than poison the stage.
                warn!(error = %err, "failed to serialize event payload");
                None
            }
        }
    }
}
