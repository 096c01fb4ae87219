// Webhook intake, indexing status, admin reindex/fix operations, faces.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::schema;
use crate::error::{OtError, Result};
use crate::index::clusters;

use super::{BridgeAuth, BridgeState};

fn parse_video_id(raw: &str) -> Result<String> {
    Uuid::parse_str(raw)
        .map(|u| u.to_string())
        .map_err(|_| OtError::Unprocessable("Invalid video_id format".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct VideoUploadedPayload {
    pub video_id: String,
    pub object_name: String,
}

/// Webhook called by the API after a durable upload. Idempotent: a second
/// POST with the same video id reports already_queued and changes nothing.
pub async fn video_uploaded_hook(
    State(state): State<BridgeState>,
    Json(payload): Json<VideoUploadedPayload>,
) -> Result<Json<Value>> {
    let video_id = parse_video_id(&payload.video_id)?;

    let vid = video_id.clone();
    let object_name = payload.object_name.clone();
    let queued = state
        .db
        .call(move |conn| {
            if schema::get_index_job(conn, &vid)?.is_some() {
                return Ok(false);
            }
            schema::insert_index_job(conn, &vid, &object_name)?;
            Ok(true)
        })
        .await?;

    if queued {
        log::info!("Queued indexing for video {}", video_id);
        Ok(Json(json!({ "status": "queued", "video_id": video_id })))
    } else {
        Ok(Json(json!({ "status": "already_queued", "video_id": video_id })))
    }
}

/// Overall indexing statistics.
pub async fn indexing_overview(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
) -> Result<Json<Value>> {
    let rows = state.db.call(|conn| schema::job_status_counts(conn)).await?;
    let count_of = |status: &str| {
        rows.iter()
            .find(|(s, _)| s == status)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    };
    let total: i64 = rows.iter().map(|(_, c)| c).sum();

    Ok(Json(json!({
        "total": total,
        "pending": count_of("pending"),
        "pending_visual": count_of("pending_visual"),
        "pending_fix": count_of("pending_fix"),
        "processing": count_of("processing"),
        "completed": count_of("completed"),
        "failed": count_of("failed"),
    })))
}

fn job_json(job: &schema::IndexJob) -> Value {
    json!({
        "video_id": job.video_id,
        "status": job.status,
        "visual_indexed": job.visual_indexed,
        "transcript_indexed": job.transcript_indexed,
        "caption_indexed": job.caption_indexed,
        "clip_indexed": job.clip_indexed,
        "frame_count": job.frame_count,
        "segment_count": job.segment_count,
        "caption_count": job.caption_count,
        "clip_count": job.clip_count,
        "error_message": job.error_message,
        "created_at": job.created_at,
        "completed_at": job.completed_at,
    })
}

/// Indexing status for a specific video.
pub async fn indexing_status_for_video(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let video_id = parse_video_id(&video_id)?;
    let job = state
        .db
        .call(move |conn| schema::get_index_job(conn, &video_id))
        .await?
        .ok_or_else(|| OtError::NotFound("No indexing job found".to_string()))?;
    Ok(Json(job_json(&job)))
}

/// Full reindex of one video: drop every embedding row and reset the job.
pub async fn reindex_video(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let video_id = parse_video_id(&video_id)?;
    let _guard = state
        .video_locks
        .try_acquire(&video_id)
        .ok_or_else(|| OtError::Conflict("Video is currently being indexed".to_string()))?;

    let vid = video_id.clone();
    state
        .db
        .call(move |conn| {
            schema::get_index_job(conn, &vid)?
                .ok_or_else(|| OtError::NotFound("No indexing job found".to_string()))?;
            for table in schema::EMBEDDING_TABLES {
                schema::delete_embeddings_for_video(conn, table, &vid)?;
            }
            schema::reset_job_full(conn, &vid)?;
            Ok(())
        })
        .await?;

    Ok(Json(json!({ "status": "reindex_queued", "video_id": video_id })))
}

/// Full reindex of everything, back-filling job rows for videos that never
/// got one.
pub async fn reindex_all(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
) -> Result<Json<Value>> {
    let count = state
        .db
        .call(|conn| {
            for table in schema::EMBEDDING_TABLES {
                schema::delete_all_embeddings(conn, table)?;
            }

            for (video_id, object_name) in schema::videos_missing_index_jobs(conn)? {
                schema::insert_index_job(conn, &video_id, &object_name)?;
            }

            let jobs = schema::list_index_jobs(conn)?;
            for job in &jobs {
                schema::reset_job_full(conn, &job.video_id)?;
            }
            Ok(jobs.len())
        })
        .await?;

    Ok(Json(json!({ "status": "reindex_all_queued", "count": count })))
}

fn guard_not_busy(job: &schema::IndexJob) -> Result<()> {
    if job.status == "pending" || job.status == "processing" {
        return Err(OtError::Conflict(format!(
            "Video is currently '{}' - wait for full indexing to finish",
            job.status
        )));
    }
    Ok(())
}

/// Visual-only reindex: drop frames/clips/actions (all vision-model
/// dependants), keep captions and transcripts. Refuses while the job is
/// pending or processing.
pub async fn reindex_visual_video(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let video_id = parse_video_id(&video_id)?;
    let _guard = state
        .video_locks
        .try_acquire(&video_id)
        .ok_or_else(|| OtError::Conflict("Video is currently being indexed".to_string()))?;

    let vid = video_id.clone();
    state
        .db
        .call(move |conn| {
            let job = schema::get_index_job(conn, &vid)?
                .ok_or_else(|| OtError::NotFound("No indexing job found".to_string()))?;
            guard_not_busy(&job)?;

            for table in ["frame_embeddings", "clip_embeddings", "action_embeddings"] {
                schema::delete_embeddings_for_video(conn, table, &vid)?;
            }
            schema::reset_job_visual(conn, &vid)?;
            Ok(())
        })
        .await?;

    Ok(Json(json!({ "status": "visual_reindex_queued", "video_id": video_id })))
}

/// Visual-only reindex across the board, skipping busy jobs.
pub async fn reindex_visual_all(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
) -> Result<Json<Value>> {
    let (queued, skipped) = state
        .db
        .call(|conn| {
            let mut queued = Vec::new();
            let mut skipped = Vec::new();
            for job in schema::list_index_jobs(conn)? {
                if job.status == "pending" || job.status == "processing" {
                    skipped.push(job.video_id);
                    continue;
                }
                for table in ["frame_embeddings", "clip_embeddings", "action_embeddings"] {
                    schema::delete_embeddings_for_video(conn, table, &job.video_id)?;
                }
                schema::reset_job_visual(conn, &job.video_id)?;
                queued.push(job.video_id);
            }
            Ok((queued, skipped))
        })
        .await?;

    let mut result = json!({
        "status": "visual_reindex_all_queued",
        "queued": queued.len(),
    });
    if !skipped.is_empty() {
        result["skipped"] = json!(skipped.len());
        result["skipped_reason"] = json!("still pending/processing full indexing");
        result["skipped_video_ids"] = json!(skipped);
    }
    Ok(Json(result))
}

/// Fix missing modalities for one video: the worker inspects which embedding
/// tables are empty and fills just those. Deletes nothing.
pub async fn fix_video(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let video_id = parse_video_id(&video_id)?;
    let _guard = state
        .video_locks
        .try_acquire(&video_id)
        .ok_or_else(|| OtError::Conflict("Video is currently being indexed".to_string()))?;

    let vid = video_id.clone();
    state
        .db
        .call(move |conn| {
            let job = schema::get_index_job(conn, &vid)?
                .ok_or_else(|| OtError::NotFound("No indexing job found".to_string()))?;
            guard_not_busy(&job)?;
            schema::set_job_fix(conn, &vid)?;
            Ok(())
        })
        .await?;

    Ok(Json(json!({ "status": "fix_queued", "video_id": video_id })))
}

/// Fix missing modalities for every video, skipping busy jobs.
pub async fn fix_all(_auth: BridgeAuth, State(state): State<BridgeState>) -> Result<Json<Value>> {
    let (queued, skipped) = state
        .db
        .call(|conn| {
            let mut queued = Vec::new();
            let mut skipped = Vec::new();
            for job in schema::list_index_jobs(conn)? {
                if job.status == "pending" || job.status == "processing" {
                    skipped.push(job.video_id);
                    continue;
                }
                schema::set_job_fix(conn, &job.video_id)?;
                queued.push(job.video_id);
            }
            Ok((queued, skipped))
        })
        .await?;

    let mut result = json!({ "status": "fix_all_queued", "queued": queued.len() });
    if !skipped.is_empty() {
        result["skipped"] = json!(skipped.len());
        result["skipped_reason"] = json!("still pending/processing");
        result["skipped_video_ids"] = json!(skipped);
    }
    Ok(Json(result))
}

// ----- Faces -----

/// Face clusters with representative thumbnails, largest first.
pub async fn list_face_clusters(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
) -> Result<Json<Value>> {
    let clusters = state.db.call(|conn| schema::list_face_clusters(conn)).await?;
    Ok(Json(json!({
        "clusters": clusters
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "face_count": c.face_count,
                    "video_count": c.video_count,
                    "representative_face_id": c.representative_face_id,
                    "updated_at": c.updated_at,
                })
            })
            .collect::<Vec<_>>(),
    })))
}

/// One cluster's faces and the videos they appear in.
pub async fn get_face_cluster(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<Value>> {
    let faces = state
        .db
        .call(move |conn| schema::faces_in_cluster(conn, cluster_id))
        .await?;
    if faces.is_empty() {
        return Err(OtError::NotFound("Cluster not found".to_string()));
    }

    let videos: Vec<String> = {
        let mut seen = std::collections::HashSet::new();
        faces
            .iter()
            .filter(|f| seen.insert(f.video_id.clone()))
            .map(|f| f.video_id.clone())
            .collect()
    };

    Ok(Json(json!({
        "cluster_id": cluster_id,
        "videos": videos,
        "faces": faces
            .iter()
            .map(|f| {
                json!({
                    "id": f.id,
                    "video_id": f.video_id,
                    "frame_num": f.frame_num,
                    "timestamp_ms": f.timestamp_ms,
                    "bbox": [f.bbox.0, f.bbox.1, f.bbox.2, f.bbox.3],
                    "detection_score": f.detection_score,
                    "thumbnail_url": f.thumbnail_path.as_ref().map(|t| {
                        format!("/thumbnails/faces/{}/{}", f.video_id, t)
                    }),
                })
            })
            .collect::<Vec<_>>(),
    })))
}

/// Admin-triggered full HDBSCAN re-cluster over all face embeddings.
pub async fn recluster_faces(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
) -> Result<Json<Value>> {
    let min_cluster_size = state.settings.face_cluster_min_size;
    let (num_clusters, num_noise) = state
        .db
        .call(move |conn| clusters::run_full_clustering(conn, min_cluster_size))
        .await?;

    Ok(Json(json!({
        "status": "recluster_complete",
        "clusters": num_clusters,
        "noise": num_noise,
    })))
}
