use std::sync::Arc;
use std::time::Duration;

use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use health::{HealthHandle, HealthRegistry};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::dead_letter::KafkaDeadLetterSink;
use crate::error::Error;
use crate::pipeline::BatchPipeline;
use crate::sink::SinkWriter;
use crate::store::{PostgresStore, RecordStore};

pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    pub kafka_consumer: SingleTopicConsumer,
    pub pipeline: BatchPipeline,
    pub config: Config,
}

impl AppContext {
    pub async fn new(config: &Config, shutdown: watch::Receiver<bool>) -> Result<Self, Error> {
        let health_registry = HealthRegistry::new("liveness");
        let worker_liveness = health_registry
            .register(
                "worker".to_string(),
                Duration::from_secs(60),
                Some(Duration::from_secs(config.progress_staleness_seconds)),
            )
            .await;
        let consumer_liveness = health_registry
            .register("kafka_consumer".to_string(), Duration::from_secs(30), None)
            .await;
        let producer_liveness = health_registry
            .register("kafka_producer".to_string(), Duration::from_secs(30), None)
            .await;

        let kafka_consumer = SingleTopicConsumer::new(
            config.kafka.clone(),
            config.consumer.clone(),
            consumer_liveness,
        )?;
        let kafka_producer = create_kafka_producer(&config.kafka, producer_liveness).await?;
        let dead_letter = KafkaDeadLetterSink::new(
            kafka_producer,
            config.dead_letter_topic.clone(),
            config.consumer.kafka_consumer_topic.clone(),
        );

        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;
        let store = PostgresStore::new(pool);
        store.ping().await?;

        let sink = SinkWriter::new(Arc::new(store), config.breaker_config());
        let pipeline = BatchPipeline::new(
            Arc::new(sink),
            Arc::new(dead_letter),
            config.retry_policy(),
            worker_liveness.clone(),
            shutdown,
        );

        info!(
            "AppContext initialized, subscribed to topic {}",
            config.consumer.kafka_consumer_topic
        );

        Ok(Self {
            health_registry,
            worker_liveness,
            kafka_consumer,
            pipeline,
            config: config.clone(),
        })
    }
}
