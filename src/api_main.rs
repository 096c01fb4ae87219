// Open Testimony API server binary.

use std::net::SocketAddr;

use anyhow::Result;

use open_testimony::api::{self, ApiState};
use open_testimony::config::Settings;
use open_testimony::db::Db;
use open_testimony::storage::ObjectStorage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env();
    let port = settings.api_port;

    let db = Db::open(&settings.database_path)?;
    let storage = ObjectStorage::from_settings(&settings)?;
    let state = ApiState::new(db, storage, settings);

    api::run_startup_tasks(&state).await?;

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Open Testimony API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Open Testimony API shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("Shutdown signal received");
}
