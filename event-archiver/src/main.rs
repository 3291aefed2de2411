use std::collections::BTreeMap;
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use common_kafka::kafka_consumer::ReceivedMessage;
use common_metrics::{serve, setup_metrics_routes};
use event_archiver::{app_context::AppContext, config::Config, error::Error, pipeline::Batch};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "event archiver service"
}

fn start_health_liveness_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let config = config.clone();
    let liveness_context = context.clone();
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || ready(context.health_registry.get_status())),
        )
        .route(
            "/_liveness",
            get(move || ready(liveness_context.health_registry.get_status())),
        );
    let router = setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

/// The shutdown flag is written exactly once, here; the pipeline only ever
/// reads it. In-flight store and dead-letter calls finish before the worker
/// stops, so no record is left half-handled.
fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        info!("shutdown signal received");
        _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults()?;
    let shutdown = spawn_shutdown_listener();
    let context = Arc::new(AppContext::new(&config, shutdown.clone()).await?);

    start_health_liveness_server(&config, context.clone());

    let batch_wait = Duration::from_secs(config.max_batch_wait_seconds);
    let batch_size = config.max_records_per_batch;

    while !*shutdown.borrow() {
        context.worker_liveness.report_alive().await;

        let received = context
            .kafka_consumer
            .recv_batch(batch_size, batch_wait)
            .await;

        // Group the poll window by partition; records within each batch stay
        // in arrival order, which is offset order per partition
        let mut by_partition: BTreeMap<i32, Vec<ReceivedMessage>> = BTreeMap::new();
        for message in received {
            match message {
                Ok(message) => by_partition
                    .entry(message.partition)
                    .or_default()
                    .push(message),
                Err(e) => {
                    // Transport loss: stop the worker rather than risk
                    // dropping records. Uncommitted offsets redeliver.
                    context.worker_liveness.report_unhealthy().await;
                    error!("Kafka receive failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        for (partition, records) in by_partition {
            let batch = Batch { partition, records };
            match context.pipeline.process_batch(batch).await {
                Ok(summary) => {
                    debug!(
                        partition,
                        stored = summary.stored,
                        duplicates = summary.duplicates,
                        dead_lettered = summary.dead_lettered,
                        abandoned = summary.abandoned,
                        "batch processed"
                    );
                }
                Err(e) => {
                    context.worker_liveness.report_unhealthy().await;
                    error!("halting worker: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("shutting down");
    Ok(())
}
