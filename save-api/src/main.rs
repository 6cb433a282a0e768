use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use auth::UnverifiedJsonIdentity;
use handlers::AppState;
use save_common::metrics::setup_metrics_recorder;
use save_common::pgqueue::PgQueue;
use save_common::store::Store;

mod auth;
mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = Store::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to initialize store");
    let queue = PgQueue::new(
        &config.queue_name,
        &config.database_url,
        config.max_pg_connections,
        "save-api",
    )
    .await
    .expect("failed to initialize queue");

    let state = AppState {
        store,
        queue,
        verifier: Arc::new(UnverifiedJsonIdentity),
        max_attempts: config.max_attempts,
    };

    let recorder_handle = setup_metrics_recorder();
    let app = handlers::add_routes(Router::new(), state, Some(recorder_handle));

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start save-api http server, {}", e),
    }
}
