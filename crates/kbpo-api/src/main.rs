//! KBPO API Server
//!
//! REST API server for the KBPO evaluation engine.
//!
//! Author: hephaex@gmail.com

use kbpo_api::{create_router, state::AppState};
use kbpo_core::AppConfig;
use kbpo_pipeline::{HttpCrowdClient, Pipeline, Task, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

fn load_config() -> anyhow::Result<AppConfig> {
    let config = match std::env::var("KBPO_CONFIG") {
        Ok(path) => AppConfig::from_file(path)?.with_env_override()?,
        Err(_) => AppConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{},tower_http=info", config.logging.level).into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.logging.include_location)
        .with_line_number(config.logging.include_location);
    if config.logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config);

    let store = kbpo_store::connect(&config.database).await?;
    let crowd = Arc::new(HttpCrowdClient::from_config(&config.crowd));
    let pipeline = Arc::new(Pipeline::new(store, crowd, config.clone()));

    let pool = WorkerPool::spawn(pipeline.clone(), &config.worker);
    tracing::info!(workers = pool.workers(), "worker pool started");

    // Periodically collect crowd responses and expire stale HITs
    let ticker = {
        let tasks = pool.sender();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                for task in [Task::Expire, Task::Poll] {
                    if tasks.send(task).await.is_err() {
                        return;
                    }
                }
            }
        })
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, pipeline).with_tasks(pool.sender()));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("KBPO API Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);
    tracing::info!("OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    ticker.abort();
    pool.shutdown().await;
    Ok(())
}
