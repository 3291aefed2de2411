pub mod config;
pub mod kafka_consumer;
pub mod kafka_producer;

/// Gauge fed from librdkafka statistics callbacks, summed across the
/// partitions currently assigned to this consumer.
pub const KAFKA_CONSUMER_LAG: &str = "kafka_consumer_lag";
