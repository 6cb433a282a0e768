//! Consume `PgQueue` jobs to resolve and link saved restaurants.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;

use save_common::health::HealthRegistry;
use save_common::metrics::{serve, setup_metrics_router};
use save_common::pgqueue::PgQueue;
use save_common::retry::RetryPolicy;
use save_common::store::Store;
use save_worker::config::Config;
use save_worker::error::WorkerError;
use save_worker::resolver::StaticPlaceLookup;
use save_worker::worker::{Pipeline, SaveWorker};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );

    let store = Store::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to initialize store");
    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "save-worker",
    )
    .await
    .expect("failed to initialize queue");

    let pipeline = Pipeline::new(store, Arc::new(StaticPlaceLookup));

    let worker = SaveWorker::new(
        &config.worker_name,
        &queue,
        pipeline,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        retry_policy,
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router()
            .route("/_liveness", get(move || ready(liveness.get_status())));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await?;

    Ok(())
}
