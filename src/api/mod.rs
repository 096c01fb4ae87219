// Ingest API service: upload, provenance, listings, review, users, audit.

pub mod audit_routes;
pub mod devices;
pub mod geocode;
pub mod tags;
pub mod upload;
pub mod users;
pub mod videos;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::request::Parts;
use axum::routing::{get, post, put};
use axum::{async_trait, Json, Router};
use axum_extra::extract::CookieJar;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::auth::decode_access_token;
use crate::config::Settings;
use crate::constants::{ACCESS_TOKEN_COOKIE, WEBHOOK_TIMEOUT_SECS};
use crate::db::schema::{self, User};
use crate::db::Db;
use crate::error::{OtError, Result};
use crate::storage::ObjectStorage;

#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub storage: Arc<ObjectStorage>,
    pub settings: Arc<Settings>,
    /// Short-timeout client for the fire-and-forget bridge webhook.
    pub webhook_client: reqwest::Client,
}

impl ApiState {
    pub fn new(db: Db, storage: ObjectStorage, settings: Settings) -> Self {
        ApiState {
            db,
            storage: Arc::new(storage),
            settings: Arc::new(settings),
            webhook_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
        }
    }
}

// ----- Session extractors -----

async fn user_from_parts(parts: &Parts, state: &ApiState) -> Result<User> {
    let jar = CookieJar::from_headers(&parts.headers);
    let token = jar
        .get(ACCESS_TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(OtError::Unauthenticated)?;
    let username = decode_access_token(&token, &state.settings.jwt_secret_key)
        .ok_or(OtError::Unauthenticated)?;

    let user = state
        .db
        .call(move |conn| schema::get_user_by_username(conn, &username))
        .await?
        .filter(|u| u.is_active)
        .ok_or(OtError::Unauthenticated)?;
    Ok(user)
}

/// Any active logged-in user.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<ApiState> for CurrentUser {
    type Rejection = OtError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self> {
        Ok(CurrentUser(user_from_parts(parts, state).await?))
    }
}

/// Staff gate: admin or staff role.
pub struct Staff(pub User);

#[async_trait]
impl FromRequestParts<ApiState> for Staff {
    type Rejection = OtError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self> {
        let user = user_from_parts(parts, state).await?;
        if user.role != "admin" && user.role != "staff" {
            return Err(OtError::Forbidden("Staff access required".to_string()));
        }
        Ok(Staff(user))
    }
}

/// Admin gate.
pub struct Admin(pub User);

#[async_trait]
impl FromRequestParts<ApiState> for Admin {
    type Rejection = OtError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self> {
        let user = user_from_parts(parts, state).await?;
        if user.role != "admin" {
            return Err(OtError::Forbidden("Admin access required".to_string()));
        }
        Ok(Admin(user))
    }
}

// ----- Router -----

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/tags", get(tags::get_tags).post(tags::create_tag).delete(tags::delete_tag))
        .route("/tags/counts", get(tags::get_tag_counts))
        .route("/categories/counts", get(tags::get_category_counts))
        .route("/register-device", post(devices::register_device))
        .route("/upload", post(upload::upload_media))
        .route("/bulk-upload", post(upload::bulk_upload))
        .route("/videos", get(videos::list_videos))
        .route("/videos/:id", get(videos::get_video_details).delete(videos::delete_video))
        .route("/videos/:id/annotations", put(videos::update_annotations_device))
        .route("/videos/:id/annotations/web", put(videos::update_annotations_web))
        .route("/videos/:id/review", put(videos::update_review_status))
        .route("/videos/:id/url", get(videos::get_video_url))
        .route("/videos/:id/audit", get(audit_routes::get_video_audit_trail))
        .route("/queue", get(videos::get_queue))
        .route("/queue/stats", get(videos::get_queue_stats))
        .route("/audit-log", get(audit_routes::get_audit_log))
        .route("/audit-log/verify", get(audit_routes::verify_audit_log))
        .route("/export/integrity-report", get(audit_routes::export_integrity_report))
        .route("/auth/login", post(users::login))
        .route("/auth/logout", post(users::logout))
        .route("/auth/me", get(users::get_me))
        .route("/auth/users", post(users::create_user).get(users::list_users))
        .route("/auth/users/:id", put(users::update_user))
        .route("/auth/users/:id/password", put(users::reset_user_password))
        .route("/geocode/search", get(geocode::geocode_search))
        // Media bodies are far larger than the default multipart cap
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "Open Testimony API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "operational",
    }))
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> Json<serde_json::Value> {
    let database = state.db.call(|conn| {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    });
    let db_ok = database.await.is_ok();
    let storage_ok = state.storage.ping().await.is_ok();
    Json(json!({
        "status": if db_ok && storage_ok { "healthy" } else { "degraded" },
        "timestamp": crate::db::now_iso(),
        "database": if db_ok { "connected" } else { "unreachable" },
        "storage": if storage_ok { "connected" } else { "unreachable" },
    }))
}

// ----- Startup tasks -----

/// Seed the initial admin from configuration when the users table is empty,
/// and load the default tag catalogue.
pub async fn run_startup_tasks(state: &ApiState) -> Result<()> {
    let settings = Arc::clone(&state.settings);

    if let (Some(username), Some(password)) =
        (settings.admin_username.clone(), settings.admin_password.clone())
    {
        let display_name = settings.admin_display_name.clone();
        let seeded = state
            .db
            .call(move |conn| {
                if schema::count_users(conn)? > 0 {
                    return Ok(None);
                }
                let hash = crate::auth::hash_password(&password)?;
                schema::insert_user(conn, &username, &hash, &display_name, "admin")?;
                Ok(Some(username))
            })
            .await?;
        if let Some(username) = seeded {
            log::info!("Seeded admin user: {}", username);
        }
    }

    if let Some(ref tags_path) = settings.default_tags_file {
        match std::fs::read_to_string(tags_path) {
            Ok(raw) => {
                let default_tags: Vec<String> = serde_json::from_str(&raw)?;
                let added = state
                    .db
                    .call(move |conn| {
                        let mut added = 0;
                        for tag in &default_tags {
                            if schema::insert_tag(conn, tag)? {
                                added += 1;
                            }
                        }
                        Ok(added)
                    })
                    .await?;
                if added > 0 {
                    log::info!("Seeded {} default tags", added);
                }
            }
            Err(e) => log::warn!("Default tags file not readable: {}", e),
        }
    }

    if let Err(e) = state.storage.ping().await {
        log::warn!("Object store health check failed at startup: {}", e);
    }

    Ok(())
}

/// Best-effort POST to the bridge's video-uploaded hook. Failures are logged
/// and swallowed — the upload is already durable.
pub async fn notify_bridge(state: &ApiState, video_id: &str, object_name: &str) {
    let url = format!("{}/hooks/video-uploaded", state.settings.bridge_url);
    let result = state
        .webhook_client
        .post(&url)
        .json(&json!({ "video_id": video_id, "object_name": object_name }))
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            log::info!("Bridge notified for video {}", video_id);
        }
        Ok(response) => {
            log::warn!(
                "Bridge notification failed (non-fatal): status {}",
                response.status()
            );
        }
        Err(e) => log::warn!("Bridge notification failed (non-fatal): {}", e),
    }
}
