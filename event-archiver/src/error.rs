use common_kafka::kafka_consumer::OffsetErr;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// A record that cannot enter the pipeline. Never retried; always
/// dead-lettered as "invalid format".
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("record is not valid JSON: {0}")]
    Undecodable(#[from] serde_json::Error),
    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),
}

/// A fault in the underlying document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What a sink write can fail with. `CircuitOpen` is rejected before the
/// store is touched, but still counts as a failed attempt for retry
/// purposes.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("sink circuit is open")]
    CircuitOpen,
    #[error("sink write failed: {0}")]
    Store(#[from] StoreError),
}

/// A failed append to the dead-letter topic. Fatal to the current batch:
/// the pipeline must not commit the offending offset.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to append to dead letter topic: {0}")]
    Produce(#[from] KafkaError),
    #[error("dead letter append timed out")]
    Canceled,
    #[error("dead letter channel unavailable: {0}")]
    Unavailable(String),
}

/// Errors `process_batch` surfaces to the worker. Everything else is
/// recovered inside the pipeline by dead-lettering.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error("failed to commit offset: {0}")]
    Commit(#[from] OffsetErr),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] envconfig::Error),
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
