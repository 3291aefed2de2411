use std::sync::{Arc, Weak};
use std::time::Duration;

use health::HealthHandle;
use rdkafka::{
    consumer::{Consumer, ConsumerContext, StreamConsumer},
    error::KafkaError,
    message::Headers,
    ClientConfig, ClientContext, Message, Statistics,
};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::KAFKA_CONSUMER_LAG;

/// Client context that feeds the consumer-lag gauge and the kafka liveness
/// handle from librdkafka's periodic statistics callbacks. The callbacks run
/// on librdkafka's own thread, so reporting must go through the blocking path.
pub struct ConsumerHealthContext {
    liveness: HealthHandle,
}

impl ClientContext for ConsumerHealthContext {
    fn stats(&self, stats: Statistics) {
        self.liveness.report_alive_blocking();

        let lag: i64 = stats
            .topics
            .values()
            .flat_map(|topic| topic.partitions.values())
            .filter(|partition| partition.consumer_lag >= 0)
            .map(|partition| partition.consumer_lag)
            .sum();
        metrics::gauge!(KAFKA_CONSUMER_LAG).set(lag as f64);
    }
}

impl ConsumerContext for ConsumerHealthContext {}

#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<ConsumerHealthContext>,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// A message as it came off the wire: payload bytes and headers untouched,
/// plus a commit handle for its offset. Decoding is the caller's problem,
/// so undecodable payloads can still be dead-lettered byte-for-byte.
pub struct ReceivedMessage {
    pub payload: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub partition: i32,
    pub offset: Offset,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "enable.auto.commit",
                consumer_config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        // Offsets are stored by hand, record by record, once a record is
        // durably handled; the auto-committer only publishes stored offsets.
        client_config.set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let context = ConsumerHealthContext { liveness };
        let consumer: StreamConsumer<ConsumerHealthContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn recv(&self) -> Result<ReceivedMessage, KafkaError> {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.map(|v| v.to_vec()).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ReceivedMessage {
            payload: message.payload().map(|p| p.to_vec()),
            key: message.key().map(|k| k.to_vec()),
            headers,
            partition: message.partition(),
            offset,
        })
    }

    /// Receive up to `max` messages, waiting at most `timeout` for the batch
    /// to fill. Returns early on the first transport error so the caller can
    /// decide whether to fall over.
    pub async fn recv_batch(
        &self,
        max: usize,
        timeout: Duration,
    ) -> Vec<Result<ReceivedMessage, KafkaError>> {
        let mut batch = Vec::with_capacity(max);
        let deadline = tokio::time::Instant::now() + timeout;

        while batch.len() < max {
            tokio::select! {
                received = self.recv() => {
                    let errored = received.is_err();
                    batch.push(received);
                    if errored {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        batch
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    /// Mark this record's offset as handled. Stored offsets are published by
    /// the consumer's background commit, so storing strictly in record order
    /// is what upholds the never-skip commit discipline.
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn value(&self) -> i64 {
        self.offset
    }
}
