use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Statistics};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::RingBuffer;
use crate::config::{Compression, SaslConfig, TlsConfig};
use crate::processor::KafkaRecord;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Transient errors are retried twice by librdkafka before the delivery
/// report surfaces them, for three attempts in total.
const SEND_MAX_RETRIES: u32 = 2;

pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to create kafka producer: {0}")]
    Producer(#[source] KafkaError),
    #[error("encountered fatal kafka error: {0}")]
    Fatal(#[source] KafkaError),
}

/// Exporter options, filled in explicitly by the caller.
#[derive(Clone, Debug)]
pub struct ExporterConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub compression: Compression,
    pub tls: Option<TlsConfig>,
    pub sasl: Option<SaslConfig>,
    /// Upper bound on records published per tick.
    pub batch_size: usize,
    /// Total time a record may spend in the producer, retries included.
    pub message_timeout: Duration,
}

impl ExporterConfig {
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        ExporterConfig {
            brokers,
            topic: topic.into(),
            compression: Compression::None,
            tls: None,
            sasl: None,
            batch_size: DEFAULT_BATCH_SIZE,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("statistics.interval.ms", "10000")
            .set("compression.codec", self.compression.codec())
            .set("message.send.max.retries", SEND_MAX_RETRIES.to_string())
            .set(
                "message.timeout.ms",
                self.message_timeout.as_millis().to_string(),
            );

        let protocol = match (&self.tls, &self.sasl) {
            (Some(_), Some(_)) => "sasl_ssl",
            (Some(_), None) => "ssl",
            (None, Some(_)) => "sasl_plaintext",
            (None, None) => "plaintext",
        };
        config.set("security.protocol", protocol);

        if let Some(tls) = &self.tls {
            if let Some(cacert) = &tls.cacert {
                config.set("ssl.ca.location", cacert.display().to_string());
            }
            if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
                config.set("ssl.certificate.location", cert.display().to_string());
                config.set("ssl.key.location", key.display().to_string());
            }
            if tls.skip_verify {
                config.set("enable.ssl.certificate.verification", "false");
            }
        }

        if let Some(sasl) = &self.sasl {
            config
                .set("sasl.mechanism", sasl.mechanism.as_str())
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
        config
    }
}

/// Client context forwarding librdkafka's periodic statistics to the
/// metrics exporter.
struct RelayContext;

impl ClientContext for RelayContext {
    fn stats(&self, stats: Statistics) {
        gauge!("relay_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("relay_kafka_producer_queue_bytes").set(stats.msg_size as f64);

        for (topic, stats) in stats.topics {
            gauge!("relay_kafka_produce_avg_batch_size_bytes", "topic" => topic.clone())
                .set(stats.batchsize.avg as f64);
            gauge!("relay_kafka_produce_avg_batch_size_messages", "topic" => topic)
                .set(stats.batchcnt.avg as f64);
        }

        for (_, broker) in stats.brokers {
            let id = broker.nodeid.to_string();
            gauge!("relay_kafka_broker_requests_pending", "broker" => id.clone())
                .set(broker.outbuf_cnt as f64);
            counter!("relay_kafka_broker_tx_errors_total", "broker" => id.clone())
                .absolute(broker.txerrs);
            counter!("relay_kafka_broker_rx_errors_total", "broker" => id)
                .absolute(broker.rxerrs);
        }
    }
}

/// The last pipeline stage: drains record batches from the message buffer
/// and publishes them, stopping only on errors the producer cannot recover
/// from (missing topic, authentication or authorization defects).
pub struct Exporter {
    source: Arc<RingBuffer<KafkaRecord>>,
    producer: FutureProducer<RelayContext>,
    topic: String,
    batch_size: usize,
    balancer: LeastBytes,
}

impl Exporter {
    pub fn new(
        config: ExporterConfig,
        source: Arc<RingBuffer<KafkaRecord>>,
    ) -> Result<Self, ExportError> {
        debug!(brokers = ?config.brokers, topic = %config.topic, "creating kafka producer");
        let producer = config
            .client_config()
            .create_with_context(RelayContext)
            .map_err(ExportError::Producer)?;
        Ok(Exporter {
            source,
            producer,
            topic: config.topic,
            batch_size: config.batch_size,
            balancer: LeastBytes::new(0),
        })
    }

    /// Publishes until the token is cancelled, returning early only on a
    /// fatal error. On cancellation the producer is flushed and the stage
    /// returns cleanly; whatever is still buffered at that point is lost,
    /// which is the accepted at-most-once contract.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ExportError> {
        self.probe_partitions();

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if self.source.is_empty() {
                        continue;
                    }
                    let batch = self.next_batch();
                    let written = self.publish(batch).await?;
                    debug!(written, "wrote messages to kafka");
                }
            }
        }
    }

    /// Learns the partition layout for least-bytes balancing. Doubles as a
    /// broker connectivity probe; failure here is not fatal, the producer
    /// keeps retrying and records go out without an explicit partition.
    fn probe_partitions(&mut self) {
        match self
            .producer
            .client()
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
        {
            Ok(metadata) => {
                let partitions = metadata
                    .topics()
                    .first()
                    .map(|t| t.partitions().len())
                    .unwrap_or(0);
                info!(topic = %self.topic, partitions, "connected to kafka brokers");
                self.balancer = LeastBytes::new(partitions);
            }
            Err(err) => {
                warn!(error = %err, "failed to fetch kafka metadata, deferring to broker-side partitioning");
            }
        }
    }

    fn next_batch(&self) -> Vec<KafkaRecord> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.source.read() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    /// Enqueues the batch sequentially, then waits for all delivery reports.
    /// Returns the number of records acknowledged by the broker.
    async fn publish(&mut self, records: Vec<KafkaRecord>) -> Result<usize, ExportError> {
        let mut deliveries = Vec::with_capacity(records.len());
        for record in &records {
            let partition = self.balancer.pick(record.key.len() + record.value.len());
            let mut request = FutureRecord::to(&self.topic)
                .key(&record.key)
                .payload(&record.value);
            if let Some(partition) = partition {
                request = request.partition(partition);
            }
            match self.producer.send_result(request) {
                Ok(delivery) => deliveries.push(delivery),
                Err((err, _)) => {
                    if is_fatal(&err) {
                        return Err(ExportError::Fatal(err));
                    }
                    counter!("relay_export_errors_total", "kind" => "transient").increment(1);
                    error!(error = %err, "failed to enqueue message for kafka");
                }
            }
        }

        let mut written = 0;
        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => written += 1,
                Ok(Err((err, _))) => {
                    if is_fatal(&err) {
                        return Err(ExportError::Fatal(err));
                    }
                    counter!("relay_export_errors_total", "kind" => "transient").increment(1);
                    error!(error = %err, "failed to write message to kafka");
                }
                Err(_) => {
                    // Delivery future canceled, typically at producer teardown.
                    counter!("relay_export_errors_total", "kind" => "transient").increment(1);
                    error!("kafka delivery report was canceled");
                }
            }
        }
        counter!("relay_records_published_total").increment(written as u64);
        Ok(written)
    }

    fn close(&self) {
        if let Err(err) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!(error = %err, "failed to flush kafka producer on shutdown");
        }
    }
}

/// Errors the producer cannot retry to success: the topic is missing, or the
/// cluster rejects our credentials or mechanism. Everything else is treated
/// as transient.
fn is_fatal(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnsupportedSASLMechanism
                | RDKafkaErrorCode::IllegalSASLState
                | RDKafkaErrorCode::SASLAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
        )
    )
}

/// Assigns each record to the partition with the fewest bytes sent so far.
///
/// Note that this deliberately ignores record keys, mirroring the documented
/// balancing policy: records for the same event UID may land on different
/// partitions. Consumers that need per-UID ordering must read from a single
/// partition or accept reordering.
struct LeastBytes {
    tallies: Vec<u64>,
}

impl LeastBytes {
    fn new(partitions: usize) -> Self {
        LeastBytes {
            tallies: vec![0; partitions],
        }
    }

    fn pick(&mut self, bytes: usize) -> Option<i32> {
        let (partition, tally) = self
            .tallies
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, tally)| **tally)?;
        *tally += bytes as u64;
        Some(partition as i32)
    }
}
