// End-to-end API tests over the router, backed by a temp-file database.
// Object-store writes are not exercised here; every asserted path either
// precedes the blob write (rejections) or never touches storage.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use open_testimony::api::{self, ApiState};
use open_testimony::auth::hash_password;
use open_testimony::config::Settings;
use open_testimony::db::{schema, Db};
use open_testimony::storage::ObjectStorage;

struct TestApp {
    app: Router,
    db: Db,
    _dir: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Db::open(&dir.path().join("ot.db")).unwrap();
    let mut settings = Settings::from_env();
    settings.jwt_secret_key = "test-secret".to_string();
    let storage = ObjectStorage::from_settings(&settings).unwrap();
    let state = ApiState::new(db.clone(), storage, settings);
    TestApp {
        app: api::router(state),
        db,
        _dir: dir,
    }
}

async fn request(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(req: Request<Body>, cookie: &str) -> Request<Body> {
    let (mut parts, body) = req.into_parts();
    parts
        .headers
        .insert(header::COOKIE, cookie.parse().unwrap());
    Request::from_parts(parts, body)
}

async fn seed_user(db: &Db, username: &str, role: &str) {
    let username = username.to_string();
    let role = role.to_string();
    db.call(move |conn| {
        let hash = hash_password("pw")?;
        schema::insert_user(conn, &username, &hash, &username, &role)?;
        Ok(())
    })
    .await
    .unwrap();
}

async fn login(app: &Router, username: &str) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/auth/login",
            &json!({ "username": username, "password": "pw" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("login sets a cookie")
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

fn register_body(device_id: &str) -> Value {
    json!({
        "device_id": device_id,
        "public_key_pem": "DEVICE:test-device-key",
        "device_info": "test phone",
        "crypto_version": "hmac",
    })
}

// ----- Devices -----

#[tokio::test]
async fn test_register_device_idempotent_and_audited() {
    let t = test_app();

    let (status, body) = request(&t.app, post_json("/api/register-device", &register_body("dev-A"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    // Second identical registration succeeds idempotently
    let (status, body) = request(&t.app, post_json("/api/register-device", &register_body("dev-A"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Device already registered");

    // Exactly one device_register entry
    let count: i64 = t
        .db
        .call(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE event_type = 'device_register'",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_register_device_crypto_upgrade() {
    let t = test_app();
    request(&t.app, post_json("/api/register-device", &register_body("dev-A"))).await;

    let mut upgrade = register_body("dev-A");
    upgrade["crypto_version"] = json!("ecdsa");
    upgrade["public_key_pem"] = json!("-----BEGIN PUBLIC KEY-----\nnewkey\n-----END PUBLIC KEY-----");
    let (status, body) = request(&t.app, post_json("/api/register-device", &upgrade)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("upgraded"));

    let device = t
        .db
        .call(|conn| schema::get_device(conn, "dev-A"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.crypto_version, "ecdsa");
    assert!(device.public_key_pem.contains("newkey"));
}

// ----- Upload rejection paths (all precede the blob write) -----

fn multipart_upload(metadata: &Value, file_bytes: &[u8]) -> Request<Body> {
    let boundary = "testboundary7423";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"metadata\"\r\n\r\n{m}\r\n",
            b = boundary,
            m = metadata
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"clip.mp4\"\r\n\
             Content-Type: video/mp4\r\n\r\n",
            b = boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(file_bytes);
    body.extend_from_slice(format!("\r\n--{b}--\r\n", b = boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

fn upload_envelope(device_id: &str, key: &str, video_hash: &str) -> Value {
    json!({
        "version": "1.0",
        "auth": { "device_id": device_id, "public_key_pem": key },
        "payload": {
            "video_hash": video_hash,
            "timestamp": "2026-05-01T12:00:00Z",
            "location": { "lat": 40.7, "lon": -74.0 },
            "incident_tags": ["protest"],
            "source": "live",
        },
        "signature": "c2lnbmF0dXJl",
    })
}

#[tokio::test]
async fn test_upload_unregistered_device_403() {
    let t = test_app();
    let envelope = upload_envelope("ghost", "DEVICE:k", &"0".repeat(64));
    let (status, body) = request(&t.app, multipart_upload(&envelope, b"data")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("not registered"));
}

#[tokio::test]
async fn test_upload_key_mismatch_403() {
    let t = test_app();
    request(&t.app, post_json("/api/register-device", &register_body("dev-A"))).await;

    let envelope = upload_envelope("dev-A", "DEVICE:different-key", &"0".repeat(64));
    let (status, body) = request(&t.app, multipart_upload(&envelope, b"data")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("key mismatch"));
}

#[tokio::test]
async fn test_upload_hash_mismatch_400_leaves_no_trace() {
    let t = test_app();
    request(&t.app, post_json("/api/register-device", &register_body("dev-A"))).await;

    let envelope = upload_envelope("dev-A", "DEVICE:test-device-key", &"0".repeat(64));
    let (status, body) = request(&t.app, multipart_upload(&envelope, b"real content")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("hash mismatch"));

    // No media row, no upload audit entry
    let (videos, uploads): (i64, i64) = t
        .db
        .call(|conn| {
            Ok((
                conn.query_row("SELECT COUNT(*) FROM videos", [], |r| r.get(0))?,
                conn.query_row(
                    "SELECT COUNT(*) FROM audit_log WHERE event_type = 'upload'",
                    [],
                    |r| r.get(0),
                )?,
            ))
        })
        .await
        .unwrap();
    assert_eq!(videos, 0);
    assert_eq!(uploads, 0);
}

#[tokio::test]
async fn test_upload_missing_field_400() {
    let t = test_app();
    request(&t.app, post_json("/api/register-device", &register_body("dev-A"))).await;

    let mut envelope = upload_envelope("dev-A", "DEVICE:test-device-key", &"0".repeat(64));
    envelope["payload"].as_object_mut().unwrap().remove("video_hash");
    let (status, body) = request(&t.app, multipart_upload(&envelope, b"x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("video_hash"));
}

// ----- Auth and users -----

#[tokio::test]
async fn test_login_logout_me_flow() {
    let t = test_app();
    seed_user(&t.db, "casey", "staff").await;

    // Wrong password rejected
    let (status, _) = request(
        &t.app,
        post_json("/api/auth/login", &json!({ "username": "casey", "password": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let cookie = login(&t.app, "casey").await;
    let (status, body) = request(
        &t.app,
        authed(Request::builder().uri("/api/auth/me").body(Body::empty()).unwrap(), &cookie),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "casey");

    // No cookie -> 401
    let (status, _) = request(
        &t.app,
        Request::builder().uri("/api/auth/me").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_user_management_roles_and_conflict() {
    let t = test_app();
    seed_user(&t.db, "root", "admin").await;
    seed_user(&t.db, "helper", "staff").await;
    let admin = login(&t.app, "root").await;
    let staff = login(&t.app, "helper").await;

    // Staff cannot create users
    let create = json!({ "username": "new", "password": "pw2", "role": "staff" });
    let (status, _) = request(&t.app, authed(post_json("/api/auth/users", &create), &staff)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Admin can
    let (status, body) = request(&t.app, authed(post_json("/api/auth/users", &create), &admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "new");

    // Duplicate username -> 409
    let (status, _) = request(&t.app, authed(post_json("/api/auth/users", &create), &admin)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // user_created audit entry carries the admin id in event_data
    let has_user_id: bool = t
        .db
        .call(|conn| {
            let data: String = conn.query_row(
                "SELECT event_data FROM audit_log WHERE event_type = 'user_created'",
                [],
                |r| r.get(0),
            )?;
            Ok(data.contains("user_id"))
        })
        .await
        .unwrap();
    assert!(has_user_id);
}

#[tokio::test]
async fn test_deactivated_user_cannot_authenticate() {
    let t = test_app();
    seed_user(&t.db, "root", "admin").await;
    seed_user(&t.db, "temp", "staff").await;
    let admin = login(&t.app, "root").await;
    let temp_cookie = login(&t.app, "temp").await;

    let user_id = t
        .db
        .call(|conn| Ok(schema::get_user_by_username(conn, "temp")?.unwrap().id))
        .await
        .unwrap();

    let (status, _) = request(
        &t.app,
        authed(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/auth/users/{}", user_id))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "is_active": false }).to_string()))
                .unwrap(),
            &admin,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Token still cryptographically valid, but the account gate rejects it
    let (status, _) = request(
        &t.app,
        authed(Request::builder().uri("/api/auth/me").body(Body::empty()).unwrap(), &temp_cookie),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ----- Videos, queue, tags -----

async fn seed_video(db: &Db, device_id: &str, tags: &[&str]) -> String {
    let device_id = device_id.to_string();
    let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    db.call(move |conn| {
        schema::insert_video(
            conn,
            &schema::NewVideo {
                device_id: device_id.clone(),
                object_name: format!("videos/{}/f.mp4", device_id),
                file_hash: "ab".repeat(32),
                timestamp: "2026-05-01T12:00:00.000000".to_string(),
                latitude: Some(40.0),
                longitude: Some(-74.0),
                incident_tags: tags,
                source: Some("live".to_string()),
                media_type: "video".to_string(),
                exif_metadata: None,
                verification_status: "verified".to_string(),
                metadata_json: json!({"version": "1.0"}),
            },
        )
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_listing_filters_and_soft_delete_exclusion() {
    let t = test_app();
    seed_user(&t.db, "root", "admin").await;
    let admin = login(&t.app, "root").await;

    let keep = seed_video(&t.db, "dev-A", &["protest"]).await;
    let gone = seed_video(&t.db, "dev-B", &["protest", "police"]).await;

    // Delete one as admin
    let (status, _) = request(
        &t.app,
        authed(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/videos/{}", gone))
                .body(Body::empty())
                .unwrap(),
            &admin,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        &t.app,
        Request::builder().uri("/api/videos").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["videos"][0]["id"], json!(keep));

    // Details of the deleted video 404
    let (status, _) = request(
        &t.app,
        Request::builder()
            .uri(format!("/api/videos/{}", gone))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Tag filter requires every named tag
    let (_, body) = request(
        &t.app,
        Request::builder()
            .uri("/api/videos?tags=protest,police")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_review_flow_stamps_and_clears() {
    let t = test_app();
    seed_user(&t.db, "helper", "staff").await;
    let staff = login(&t.app, "helper").await;
    let video_id = seed_video(&t.db, "dev-A", &[]).await;

    // Queue defaults to pending
    let (_, body) = request(
        &t.app,
        authed(Request::builder().uri("/api/queue").body(Body::empty()).unwrap(), &staff),
    )
    .await;
    assert_eq!(body["total"], 1);

    let review = |status: &str| {
        authed(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/videos/{}/review", video_id))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "review_status": status }).to_string()))
                .unwrap(),
            &staff,
        )
    };

    let (status, _) = request(&t.app, review("reviewed")).await;
    assert_eq!(status, StatusCode::OK);

    let video = {
        let id = video_id.clone();
        t.db.call(move |conn| schema::get_video(conn, &id, false))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(video.review_status, "reviewed");
    assert_eq!(video.reviewed_by.as_deref(), Some("helper"));
    assert!(video.reviewed_at.is_some());

    // Reset to pending clears the stamp
    let (status, _) = request(&t.app, review("pending")).await;
    assert_eq!(status, StatusCode::OK);
    let video = {
        let id = video_id.clone();
        t.db.call(move |conn| schema::get_video(conn, &id, false))
            .await
            .unwrap()
            .unwrap()
    };
    assert!(video.reviewed_by.is_none());
    assert!(video.reviewed_at.is_none());

    let (status, _) = request(&t.app, review("bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Stats reflect the queue
    let (_, stats) = request(
        &t.app,
        authed(Request::builder().uri("/api/queue/stats").body(Body::empty()).unwrap(), &staff),
    )
    .await;
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["total"], 1);
}

#[tokio::test]
async fn test_tag_catalogue_and_admin_delete() {
    let t = test_app();
    seed_user(&t.db, "root", "admin").await;
    seed_user(&t.db, "helper", "staff").await;
    let admin = login(&t.app, "root").await;
    let staff = login(&t.app, "helper").await;

    seed_video(&t.db, "dev-A", &["typo-tag", "good"]).await;

    // Staff adds to the catalogue
    let (status, body) = request(
        &t.app,
        authed(post_json("/api/tags", &json!({ "tag": "Protest " })), &staff),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tag"], "protest");

    // Vocabulary is catalogue first, then in-use tags
    let (_, body) = request(
        &t.app,
        Request::builder().uri("/api/tags").body(Body::empty()).unwrap(),
    )
    .await;
    let all: Vec<String> = body["all_tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(all[0], "protest");
    assert!(all.contains(&"typo-tag".to_string()));

    // Staff cannot delete tags; admin removes it everywhere
    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri("/api/tags")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "tag": "typo-tag" }).to_string()))
            .unwrap()
    };
    let (status, _) = request(&t.app, authed(delete(), &staff)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = request(&t.app, authed(delete(), &admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["videos_affected"], 1);

    let (_, body) = request(
        &t.app,
        Request::builder().uri("/api/tags").body(Body::empty()).unwrap(),
    )
    .await;
    let all: Vec<String> = body["all_tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(!all.contains(&"typo-tag".to_string()));
}

// ----- Audit endpoints -----

#[tokio::test]
async fn test_audit_log_and_verify_endpoints() {
    let t = test_app();
    for i in 0..3 {
        request(&t.app, post_json("/api/register-device", &register_body(&format!("dev-{}", i)))).await;
    }

    let (status, body) = request(
        &t.app,
        Request::builder().uri("/api/audit-log").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    // Newest first
    assert_eq!(body["entries"][0]["sequence_number"], 3);

    let (status, body) = request(
        &t.app,
        Request::builder().uri("/api/audit-log/verify").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["entries_checked"], 3);
}

#[tokio::test]
async fn test_integrity_report_admin_only() {
    let t = test_app();
    seed_user(&t.db, "root", "admin").await;
    let admin = login(&t.app, "root").await;
    seed_video(&t.db, "dev-A", &[]).await;

    let (status, _) = request(
        &t.app,
        Request::builder()
            .uri("/api/export/integrity-report")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = request(
        &t.app,
        authed(
            Request::builder()
                .uri("/api/export/integrity-report")
                .body(Body::empty())
                .unwrap(),
            &admin,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_files"], 1);
    assert_eq!(body["chain_verification"]["valid"], true);
    assert!(body["files"][0]["file_hash"].as_str().unwrap().len() == 64);
}
