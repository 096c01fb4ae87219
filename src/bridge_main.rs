// AI search bridge server binary.

use std::net::SocketAddr;

use anyhow::Result;

use open_testimony::bridge::{self, worker, BridgeState};
use open_testimony::config::Settings;
use open_testimony::db::{migrations, Db};
use open_testimony::models::Models;
use open_testimony::storage::ObjectStorage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env();
    let port = settings.bridge_port;

    let db = Db::open(&settings.database_path)?;

    // Embedding columns must match the configured model dimensions; on
    // mismatch the rows are dropped and regenerated via reindex.
    {
        let conn = db.connect()?;
        migrations::ensure_embedding_dims(
            &conn,
            &migrations::embedding_tables(
                settings.vision_embedding_dim,
                settings.transcript_embedding_dim,
            ),
        )?;
    }

    std::fs::create_dir_all(&settings.temp_dir)?;
    std::fs::create_dir_all(&settings.thumbnail_dir)?;
    std::fs::create_dir_all(&settings.face_thumbnail_dir)?;

    let storage = ObjectStorage::from_settings(&settings)?;
    let models = Models::from_settings(&settings);
    let state = BridgeState::new(db, storage, settings, models);

    let worker_handle = worker::spawn_worker(state.clone());

    let app = bridge::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("AI search bridge listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop polling and wait for the task to wind down. An in-flight job
    // stays `processing` until an admin reopens it.
    worker_handle.abort();
    let _ = worker_handle.await;
    log::info!("Bridge service shut down");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("Shutdown signal received");
}
