use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use common_kafka::kafka_producer::KafkaContext;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::warn;

use crate::error::DeadLetterError;
use crate::metrics_consts::DEAD_LETTERS_SENT;

pub const ERROR_REASON_HEADER: &str = "error-reason";
pub const FAILED_TIMESTAMP_HEADER: &str = "failed-timestamp";
pub const ORIGINAL_TOPIC_HEADER: &str = "original-topic";

/// A record on its way to the dead-letter topic: the bytes and headers
/// exactly as they came off the log, so the original message stays
/// byte-for-byte recoverable.
pub struct FailedRecord<'a> {
    pub payload: &'a [u8],
    pub key: Option<&'a [u8]>,
    pub headers: &'a [(String, Vec<u8>)],
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append a failed record to the dead-letter channel with the failure
    /// reason attached. An error here must reach the pipeline: it decides
    /// whether the record's offset may be committed.
    async fn send(&self, record: FailedRecord<'_>, error_reason: &str)
        -> Result<(), DeadLetterError>;
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    original_topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        topic: String,
        original_topic: String,
    ) -> Self {
        Self {
            producer,
            topic,
            original_topic,
        }
    }
}

/// Original headers first, failure metadata appended, payload untouched.
fn dead_letter_headers(
    original: &[(String, Vec<u8>)],
    error_reason: &str,
    original_topic: &str,
    failed_at: DateTime<Utc>,
) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in original {
        headers = headers.insert(Header {
            key,
            value: Some(value.as_slice()),
        });
    }
    headers
        .insert(Header {
            key: ERROR_REASON_HEADER,
            value: Some(error_reason.as_bytes()),
        })
        .insert(Header {
            key: FAILED_TIMESTAMP_HEADER,
            value: Some(
                failed_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
                    .as_bytes(),
            ),
        })
        .insert(Header {
            key: ORIGINAL_TOPIC_HEADER,
            value: Some(original_topic.as_bytes()),
        })
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(
        &self,
        record: FailedRecord<'_>,
        error_reason: &str,
    ) -> Result<(), DeadLetterError> {
        let headers =
            dead_letter_headers(record.headers, error_reason, &self.original_topic, Utc::now());

        let future_record: FutureRecord<[u8], [u8]> = FutureRecord {
            topic: &self.topic,
            partition: None,
            payload: Some(record.payload),
            key: record.key,
            timestamp: None,
            headers: Some(headers),
        };

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(error, _)| DeadLetterError::Produce(error))?;

        match delivery.await {
            Ok(Ok(_)) => {
                metrics::counter!(DEAD_LETTERS_SENT).increment(1);
                Ok(())
            }
            Ok(Err((error, _))) => {
                warn!("dead letter delivery failed: {}", error);
                Err(DeadLetterError::Produce(error))
            }
            Err(_) => Err(DeadLetterError::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rdkafka::message::Headers;

    fn header_value<'a>(headers: &'a OwnedHeaders, key: &str) -> Option<&'a [u8]> {
        headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value)
    }

    #[test]
    fn failure_metadata_is_appended_to_original_headers() {
        let original = vec![
            ("trace-id".to_string(), b"abc123".to_vec()),
            ("content-type".to_string(), b"application/json".to_vec()),
        ];
        let failed_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let headers = dead_letter_headers(&original, "store unavailable", "events", failed_at);

        assert_eq!(headers.count(), 5);
        assert_eq!(header_value(&headers, "trace-id"), Some(&b"abc123"[..]));
        assert_eq!(
            header_value(&headers, ERROR_REASON_HEADER),
            Some(&b"store unavailable"[..])
        );
        assert_eq!(
            header_value(&headers, ORIGINAL_TOPIC_HEADER),
            Some(&b"events"[..])
        );
        assert_eq!(
            header_value(&headers, FAILED_TIMESTAMP_HEADER),
            Some(&b"2024-06-01T12:00:00.000Z"[..])
        );
    }

    #[tokio::test]
    async fn sends_to_a_mock_cluster() {
        let (cluster, producer) = common_kafka::test::create_mock_kafka().await;
        cluster
            .create_topic("events_dead_letter", 1, 1)
            .expect("failed to create topic");

        let sink = KafkaDeadLetterSink::new(
            producer,
            "events_dead_letter".to_string(),
            "events".to_string(),
        );
        let payload = br#"{"id":"evt-1"}"#;
        let result = sink
            .send(
                FailedRecord {
                    payload,
                    key: Some(b"evt-1"),
                    headers: &[],
                },
                "invalid format",
            )
            .await;
        assert!(result.is_ok());
    }
}
