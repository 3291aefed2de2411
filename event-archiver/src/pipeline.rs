use std::sync::Arc;

use common_kafka::kafka_consumer::{OffsetErr, ReceivedMessage};
use health::HealthHandle;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dead_letter::{DeadLetterSink, FailedRecord};
use crate::error::PipelineError;
use crate::metrics_consts::{
    BATCHES_PROCESSED, BATCH_PROCESS_TIME, BATCH_SIZE, DEAD_LETTER_FAILURES, INVALID_RECORDS,
    MESSAGES_FAILED, MESSAGES_PROCESSED, MESSAGES_RECEIVED, SHUTDOWN_ABANDONED, WRITE_RETRIES,
};
use crate::retry::RetryPolicy;
use crate::sink::SinkWriter;
use crate::types::Record;

/// The reason attached to records that fail decoding or validation.
pub const INVALID_FORMAT_REASON: &str = "invalid format";

/// The pipeline's view of one log message: original bytes, original
/// headers, and a commit handle for its offset. A trait so tests can feed
/// batches and observe commits without a broker.
pub trait LogMessage: Send {
    fn payload(&self) -> Option<&[u8]>;
    fn key(&self) -> Option<&[u8]>;
    fn headers(&self) -> &[(String, Vec<u8>)];
    fn commit(self) -> Result<(), OffsetErr>;
}

impl LogMessage for ReceivedMessage {
    fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    fn headers(&self) -> &[(String, Vec<u8>)] {
        &self.headers
    }

    fn commit(self) -> Result<(), OffsetErr> {
        self.offset.store()
    }
}

/// One poll window's worth of records for a single partition, in offset
/// order. Ordering within the batch is what preserves partition ordering.
pub struct Batch<M> {
    pub partition: i32,
    pub records: Vec<M>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Records durably handled: stored, already stored, or dead-lettered
    pub processed: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    /// Records left unprocessed by a shutdown; redelivered on the next poll
    pub abandoned: usize,
}

/// The delivery pipeline: validation, retry-wrapped idempotent persistence,
/// dead-letter routing, and the per-record commit discipline that ties them
/// to at-least-once delivery. An offset is committed when, and only when,
/// its record has been durably handled one way or the other.
pub struct BatchPipeline {
    sink: Arc<SinkWriter>,
    dead_letter: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    shutdown: watch::Receiver<bool>,
}

impl BatchPipeline {
    pub fn new(
        sink: Arc<SinkWriter>,
        dead_letter: Arc<dyn DeadLetterSink>,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sink,
            dead_letter,
            retry_policy,
            liveness,
            shutdown,
        }
    }

    pub async fn process_batch<M: LogMessage>(
        &self,
        batch: Batch<M>,
    ) -> Result<BatchSummary, PipelineError> {
        let total = batch.records.len();
        metrics::gauge!(BATCH_SIZE).set(total as f64);
        let timer = common_metrics::timing_guard(BATCH_PROCESS_TIME, &[]);

        let mut summary = BatchSummary::default();
        for message in batch.records {
            if *self.shutdown.borrow() {
                summary.abandoned = total - summary.processed;
                metrics::counter!(SHUTDOWN_ABANDONED).increment(summary.abandoned as u64);
                info!(
                    partition = batch.partition,
                    abandoned = summary.abandoned,
                    "shutdown requested, leaving rest of batch for redelivery"
                );
                break;
            }

            // Keep the health surface fed even when a single batch takes a
            // long time to grind through retries
            self.liveness.report_alive().await;
            metrics::counter!(MESSAGES_RECEIVED).increment(1);

            let record = match Record::from_bytes(message.payload().unwrap_or_default()) {
                Ok(record) => record,
                Err(reason) => {
                    warn!(
                        partition = batch.partition,
                        "routing invalid record to dead letter: {}", reason
                    );
                    metrics::counter!(INVALID_RECORDS).increment(1);
                    self.send_to_dead_letter(&message, INVALID_FORMAT_REASON)
                        .await?;
                    message.commit()?;
                    summary.processed += 1;
                    summary.dead_lettered += 1;
                    continue;
                }
            };

            let written = self
                .retry_policy
                .retry(|attempt| {
                    if attempt > 1 {
                        metrics::counter!(WRITE_RETRIES).increment(1);
                    }
                    self.sink.write(&record)
                })
                .await;

            match written {
                Ok(outcome) => {
                    if outcome.is_duplicate() {
                        summary.duplicates += 1;
                    } else {
                        summary.stored += 1;
                    }
                    metrics::counter!(MESSAGES_PROCESSED).increment(1);
                    self.liveness.report_progress().await;
                    message.commit()?;
                    summary.processed += 1;
                }
                Err(final_error) => {
                    metrics::counter!(MESSAGES_FAILED).increment(1);
                    warn!(
                        record_id = record.id,
                        "store write exhausted retries, routing to dead letter: {}", final_error
                    );
                    self.send_to_dead_letter(&message, &final_error.to_string())
                        .await?;
                    message.commit()?;
                    summary.processed += 1;
                    summary.dead_lettered += 1;
                }
            }
        }

        timer.fin();
        metrics::counter!(BATCHES_PROCESSED).increment(1);
        Ok(summary)
    }

    /// A failed append leaves the record unhandled: the error propagates and
    /// the caller halts the batch with the offset uncommitted, forcing
    /// redelivery.
    async fn send_to_dead_letter<M: LogMessage>(
        &self,
        message: &M,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let failed = FailedRecord {
            payload: message.payload().unwrap_or_default(),
            key: message.key(),
            headers: message.headers(),
        };
        match self.dead_letter.send(failed, reason).await {
            Ok(()) => Ok(()),
            Err(append_error) => {
                metrics::counter!(DEAD_LETTER_FAILURES).increment(1);
                error!("dead letter append failed, halting batch: {}", append_error);
                Err(PipelineError::DeadLetter(append_error))
            }
        }
    }
}
