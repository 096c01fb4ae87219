// AI search bridge service: indexing queue, worker, search, thumbnails.

pub mod hooks;
pub mod search;
pub mod thumbnails;
pub mod worker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use axum_extra::extract::CookieJar;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::auth::decode_access_token;
use crate::config::Settings;
use crate::constants::ACCESS_TOKEN_COOKIE;
use crate::db::Db;
use crate::error::{OtError, Result};
use crate::models::Models;
use crate::storage::ObjectStorage;

/// In-process advisory locks, one per video id. The worker holds a video's
/// lock for the whole pipeline run; fix/reindex admission takes it briefly so
/// modality inspection can't race embedding deletion. Both sides live in this
/// one process, so a process-local set is sufficient.
#[derive(Clone, Default)]
pub struct VideoLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

pub struct VideoLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    video_id: String,
}

impl VideoLocks {
    /// Try to take the lock for a video. None if someone already holds it.
    pub fn try_acquire(&self, video_id: &str) -> Option<VideoLockGuard> {
        let mut held = self.held.lock().expect("lock set poisoned");
        if !held.insert(video_id.to_string()) {
            return None;
        }
        Some(VideoLockGuard {
            held: Arc::clone(&self.held),
            video_id: video_id.to_string(),
        })
    }
}

impl Drop for VideoLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .expect("lock set poisoned")
            .remove(&self.video_id);
    }
}

#[derive(Clone)]
pub struct BridgeState {
    pub db: Db,
    pub storage: Arc<ObjectStorage>,
    pub settings: Arc<Settings>,
    pub models: Arc<Models>,
    pub video_locks: VideoLocks,
}

impl BridgeState {
    pub fn new(db: Db, storage: ObjectStorage, settings: Settings, models: Models) -> Self {
        BridgeState {
            db,
            storage: Arc::new(storage),
            settings: Arc::new(settings),
            models: Arc::new(models),
            video_locks: VideoLocks::default(),
        }
    }
}

/// Token-validated identity. The bridge never queries the users table; a
/// valid signature under the shared secret is sufficient.
pub struct BridgeAuth {
    pub username: String,
}

#[async_trait]
impl FromRequestParts<BridgeState> for BridgeAuth {
    type Rejection = OtError;

    async fn from_request_parts(parts: &mut Parts, state: &BridgeState) -> Result<Self> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(ACCESS_TOKEN_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or(OtError::Unauthenticated)?;
        let username = decode_access_token(&token, &state.settings.jwt_secret_key)
            .ok_or(OtError::Unauthenticated)?;
        Ok(BridgeAuth { username })
    }
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/hooks/video-uploaded", post(hooks::video_uploaded_hook))
        .route("/indexing/status", get(hooks::indexing_overview))
        .route("/indexing/status/:video_id", get(hooks::indexing_status_for_video))
        .route("/indexing/reindex/:video_id", post(hooks::reindex_video))
        .route("/indexing/reindex-all", post(hooks::reindex_all))
        .route("/indexing/reindex-visual/:video_id", post(hooks::reindex_visual_video))
        .route("/indexing/reindex-visual-all", post(hooks::reindex_visual_all))
        .route("/indexing/fix/:video_id", post(hooks::fix_video))
        .route("/indexing/fix-all", post(hooks::fix_all))
        .route("/search/visual", get(search::visual_text_search).post(search::visual_image_search))
        .route("/search/transcript", get(search::transcript_semantic_search))
        .route("/search/transcript/exact", get(search::transcript_exact_search))
        .route("/search/captions", get(search::caption_search))
        .route("/search/captions/exact", get(search::caption_exact_search))
        .route("/search/clips", get(search::clip_visual_search))
        .route("/search/actions", get(search::action_semantic_search))
        .route("/search/actions/exact", get(search::action_exact_search))
        .route("/search/combined", get(search::combined_search))
        .route("/thumbnails/:video_id/:filename", get(thumbnails::get_thumbnail))
        .route("/thumbnails/faces/:video_id/:filename", get(thumbnails::get_face_thumbnail))
        .route("/faces/clusters", get(hooks::list_face_clusters))
        .route("/faces/clusters/:cluster_id", get(hooks::get_face_cluster))
        .route("/faces/recluster", post(hooks::recluster_faces))
        .route("/health", get(health))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<BridgeState>,
) -> Json<serde_json::Value> {
    let settings = &state.settings;
    Json(json!({
        "status": "healthy",
        "vision_model_family": settings.vision_model_family,
        "vision_model_name": settings.vision_model_name,
        "vision_embedding_dim": settings.vision_embedding_dim,
        "transcript_model_name": settings.transcript_model_name,
        "caption_enabled": settings.caption_enabled,
        "caption_provider": settings.caption_provider,
        "caption_model_name": settings.caption_model_name,
        "clip_enabled": settings.clip_enabled,
        "clip_window_frames": settings.clip_window_frames,
        "clip_window_stride": settings.clip_window_stride,
        "clip_fps": settings.clip_fps,
        "face_enabled": settings.face_enabled,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_lock_exclusive_until_dropped() {
        let locks = VideoLocks::default();
        let guard = locks.try_acquire("vid-1").unwrap();
        assert!(locks.try_acquire("vid-1").is_none());
        assert!(locks.try_acquire("vid-2").is_some());
        drop(guard);
        assert!(locks.try_acquire("vid-1").is_some());
    }
}
