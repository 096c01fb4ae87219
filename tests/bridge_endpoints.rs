// Bridge service tests: webhook idempotency, indexing admin operations, and
// search over stub encoders. Model forward passes are deterministic stubs;
// the same text always encodes to the same unit vector, so ranking is exact.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use open_testimony::auth::create_access_token;
use open_testimony::bridge::{self, BridgeState};
use open_testimony::config::Settings;
use open_testimony::db::{schema, Db};
use open_testimony::models::testing::{pseudo_embedding, StubCaptioner, StubText, StubTranscriber, StubVision};
use open_testimony::models::Models;
use open_testimony::storage::ObjectStorage;
use open_testimony::vector::encode_blob;

const DIM: usize = 64;
const SECRET: &str = "bridge-test-secret";

struct TestBridge {
    app: Router,
    db: Db,
    _dir: tempfile::TempDir,
}

fn test_bridge() -> TestBridge {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Db::open(&dir.path().join("ot.db")).unwrap();

    let mut settings = Settings::from_env();
    settings.jwt_secret_key = SECRET.to_string();
    settings.thumbnail_dir = dir.path().join("thumbs");
    settings.face_thumbnail_dir = dir.path().join("face-thumbs");

    let storage = ObjectStorage::from_settings(&settings).unwrap();
    let models = Models::new(
        Arc::new(StubVision { dim: DIM }),
        Arc::new(StubText { dim: DIM }),
        Some(Arc::new(StubCaptioner)),
        None,
        Arc::new(StubTranscriber { segments: vec![] }),
    );
    let state = BridgeState::new(db.clone(), storage, settings, models);

    TestBridge {
        app: bridge::router(state),
        db,
        _dir: dir,
    }
}

fn auth_cookie() -> String {
    let token = create_access_token("operator", SECRET).unwrap();
    format!("access_token={}", token)
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

fn get_authed(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, auth_cookie())
        .body(Body::empty())
        .unwrap()
}

fn post_authed(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::COOKIE, auth_cookie())
        .body(Body::empty())
        .unwrap()
}

fn hook_request(video_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/hooks/video-uploaded")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "video_id": video_id, "object_name": "videos/dev/f.mp4" }).to_string(),
        ))
        .unwrap()
}

const VID: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

#[tokio::test]
async fn test_webhook_idempotent_single_job_row() {
    let t = test_bridge();

    let (status, body) = request(&t.app, hook_request(VID)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    let (status, body) = request(&t.app, hook_request(VID)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_queued");

    let count: i64 = t
        .db
        .call(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM video_index_status", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_webhook_rejects_malformed_uuid() {
    let t = test_bridge();
    let (status, _) = request(&t.app, hook_request("not-a-uuid")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_indexing_status_endpoints() {
    let t = test_bridge();
    request(&t.app, hook_request(VID)).await;

    // Unauthenticated -> 401
    let (status, _) = request(
        &t.app,
        Request::builder().uri("/indexing/status").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = request(&t.app, get_authed("/indexing/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["pending"], 1);

    let (status, body) = request(&t.app, get_authed(&format!("/indexing/status/{}", VID))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["visual_indexed"], false);

    let (status, _) = request(
        &t.app,
        get_authed("/indexing/status/11111111-1111-4111-8111-111111111111"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_visual_reindex_refuses_pending_job() {
    let t = test_bridge();
    request(&t.app, hook_request(VID)).await;

    let (status, body) = request(
        &t.app,
        post_authed(&format!("/indexing/reindex-visual/{}", VID)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["detail"].as_str().unwrap().contains("pending"));

    // fix has the same guard
    let (status, _) = request(&t.app, post_authed(&format!("/indexing/fix/{}", VID))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_visual_reindex_drops_only_vision_dependants() {
    let t = test_bridge();
    request(&t.app, hook_request(VID)).await;

    t.db.call(|conn| {
        schema::set_job_status(conn, VID, "completed")?;
        let emb = encode_blob(&pseudo_embedding(b"e", DIM));
        schema::insert_frame_embedding(conn, VID, 0, 0, &emb)?;
        schema::insert_clip_embedding(conn, VID, 0, 1000, 0, 5, 6, &emb)?;
        schema::insert_action_embedding(conn, VID, 0, 1000, 0, 5, 6, "runs", &emb)?;
        schema::insert_transcript_embedding(conn, VID, "kept", 0, 500, &emb)?;
        schema::insert_caption_embedding(conn, VID, 0, 0, "kept too", &emb)?;
        Ok(())
    })
    .await
    .unwrap();

    let (status, body) = request(
        &t.app,
        post_authed(&format!("/indexing/reindex-visual/{}", VID)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "visual_reindex_queued");

    let counts: Vec<i64> = t
        .db
        .call(|conn| {
            let mut out = Vec::new();
            for table in schema::EMBEDDING_TABLES {
                out.push(schema::count_embeddings_for_video(conn, table, VID)?);
            }
            Ok(out)
        })
        .await
        .unwrap();
    // frames, transcripts, captions, clips, actions
    assert_eq!(counts, vec![0, 1, 1, 0, 0]);

    let job = t
        .db
        .call(|conn| schema::get_index_job(conn, VID))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "pending_visual");
    assert!(!job.visual_indexed);
}

#[tokio::test]
async fn test_full_reindex_drops_everything_and_backfills() {
    let t = test_bridge();
    request(&t.app, hook_request(VID)).await;

    t.db.call(|conn| {
        schema::set_job_status(conn, VID, "completed")?;
        let emb = encode_blob(&pseudo_embedding(b"e", DIM));
        schema::insert_frame_embedding(conn, VID, 0, 0, &emb)?;
        schema::insert_transcript_embedding(conn, VID, "t", 0, 500, &emb)?;

        // A video that never got a job row
        schema::insert_video(
            conn,
            &schema::NewVideo {
                device_id: "dev-Z".to_string(),
                object_name: "videos/dev-Z/z.mp4".to_string(),
                file_hash: "cd".repeat(32),
                timestamp: "2026-05-01T12:00:00.000000".to_string(),
                latitude: None,
                longitude: None,
                incident_tags: vec![],
                source: Some("live".to_string()),
                media_type: "video".to_string(),
                exif_metadata: None,
                verification_status: "verified".to_string(),
                metadata_json: json!({}),
            },
        )?;
        Ok(())
    })
    .await
    .unwrap();

    let (status, body) = request(&t.app, post_authed("/indexing/reindex-all")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (pending, frames): (i64, i64) = t
        .db
        .call(|conn| {
            Ok((
                conn.query_row(
                    "SELECT COUNT(*) FROM video_index_status WHERE status = 'pending'",
                    [],
                    |r| r.get(0),
                )?,
                conn.query_row("SELECT COUNT(*) FROM frame_embeddings", [], |r| r.get(0))?,
            ))
        })
        .await
        .unwrap();
    assert_eq!(pending, 2);
    assert_eq!(frames, 0);
}

// ----- Search -----

#[tokio::test]
async fn test_visual_search_top1_matches_seeded_frame() {
    let t = test_bridge();

    // The stub vision encoder maps query text and frame bytes through the
    // same hash, so seeding a frame with the query's own embedding makes it
    // the exact nearest neighbour.
    let target = pseudo_embedding("a red truck".as_bytes(), DIM);
    t.db.call(move |conn| {
        schema::insert_frame_embedding(conn, VID, 7, 14000, &encode_blob(&target))?;
        for i in 0..10 {
            let noise = pseudo_embedding(format!("noise-{}", i).as_bytes(), DIM);
            schema::insert_frame_embedding(
                conn,
                "11111111-1111-4111-8111-111111111111",
                i,
                i * 2000,
                &encode_blob(&noise),
            )?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let (status, body) = request(&t.app, get_authed("/search/visual?q=a%20red%20truck")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "visual_text");

    let top = &body["results"][0];
    assert_eq!(top["video_id"], VID);
    assert_eq!(top["timestamp_ms"], 14000);
    assert!(top["score"].as_f64().unwrap() > 0.95);

    assert!(body["timing"]["total_ms"].is_number());
    assert!(body["timing"]["encode_ms"].is_number());

    // One analytics row, no PII columns to even store
    let logged: (String, String, i64) = t
        .db
        .call(|conn| {
            Ok(conn.query_row(
                "SELECT query_text, search_mode, result_count FROM search_queries",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(logged.0, "a red truck");
    assert_eq!(logged.1, "visual_text");
    assert!(logged.2 >= 1);
}

#[tokio::test]
async fn test_transcript_exact_and_semantic_search() {
    let t = test_bridge();

    t.db.call(|conn| {
        let emb = encode_blob(&pseudo_embedding("they pushed through".as_bytes(), DIM));
        schema::insert_transcript_embedding(conn, VID, "They pushed through the line", 3000, 6000, &emb)?;
        let other = encode_blob(&pseudo_embedding("weather talk".as_bytes(), DIM));
        schema::insert_transcript_embedding(conn, VID, "nice weather today", 6000, 9000, &other)?;
        Ok(())
    })
    .await
    .unwrap();

    let (status, body) = request(
        &t.app,
        get_authed("/search/transcript/exact?q=pushed%20through"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"][0]["start_ms"], 3000);

    let (status, body) = request(
        &t.app,
        get_authed("/search/transcript?q=they%20pushed%20through"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let top = &body["results"][0];
    assert_eq!(top["segment_text"], "They pushed through the line");
    assert!(top["score"].as_f64().unwrap() > 0.95);
}

#[tokio::test]
async fn test_combined_search_merges_and_ranks() {
    let t = test_bridge();

    // Caption path scores 1.0 for the frame whose caption embedding matches
    // the query through the text stub; the visual stub encodes the same
    // query differently, so the caption hit must win the fused ranking.
    t.db.call(|conn| {
        let caption_emb = encode_blob(&pseudo_embedding("crowd control".as_bytes(), DIM));
        schema::insert_caption_embedding(conn, VID, 2, 4000, "crowd control line", &caption_emb)?;
        let frame_emb = encode_blob(&pseudo_embedding(b"some frame", DIM));
        schema::insert_frame_embedding(conn, VID, 2, 4000, &frame_emb)?;
        Ok(())
    })
    .await
    .unwrap();

    let (status, body) = request(&t.app, get_authed("/search/combined?q=crowd%20control")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "combined");

    let top = &body["results"][0];
    assert_eq!(top["video_id"], VID);
    assert_eq!(top["source"], "caption");
    assert!(top["caption_score"].as_f64().unwrap() > 0.95);
    // Both component scores recorded for the merged frame
    assert!(top["visual_score"].is_number());
    assert_eq!(top["caption_text"], "crowd control line");
}

#[tokio::test]
async fn test_clip_and_action_search() {
    let t = test_bridge();

    t.db.call(|conn| {
        let clip_emb = encode_blob(&pseudo_embedding("people running".as_bytes(), DIM));
        schema::insert_clip_embedding(conn, VID, 2000, 10000, 4, 20, 16, &clip_emb)?;
        let action_emb = encode_blob(&pseudo_embedding("a scuffle breaks out".as_bytes(), DIM));
        schema::insert_action_embedding(conn, VID, 2000, 10000, 4, 20, 16, "a scuffle breaks out near the door", &action_emb)?;
        Ok(())
    })
    .await
    .unwrap();

    let (status, body) = request(&t.app, get_authed("/search/clips?q=people%20running")).await;
    assert_eq!(status, StatusCode::OK);
    let top = &body["results"][0];
    assert_eq!(top["duration_ms"], 8000);
    assert_eq!(top["thumbnail_url"], format!("/thumbnails/{}/6000.jpg", VID));
    assert!(top["score"].as_f64().unwrap() > 0.95);

    let (status, body) = request(&t.app, get_authed("/search/actions?q=a%20scuffle%20breaks%20out")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["action_text"], "a scuffle breaks out near the door");

    let (status, body) = request(&t.app, get_authed("/search/actions/exact?q=scuffle")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_thumbnail_nearest_fallback() {
    let t = test_bridge();

    // Indexing wrote a thumbnail at 2000ms; the search result asks for 2400
    let thumb_dir = t._dir.path().join("thumbs").join(VID);
    std::fs::create_dir_all(&thumb_dir).unwrap();
    std::fs::write(thumb_dir.join("2000.jpg"), b"\xFF\xD8fakejpeg").unwrap();

    let (status, _) = request(
        &t.app,
        Request::builder()
            .uri(format!("/thumbnails/{}/2400.jpg", VID))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &t.app,
        Request::builder()
            .uri("/thumbnails/11111111-1111-4111-8111-111111111111/2400.jpg")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
