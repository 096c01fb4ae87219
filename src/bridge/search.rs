// Search dispatcher: per-modality nearest-neighbour lookups, exact text
// search, and the combined visual+caption fusion path.
//
// Stored vectors are L2-normalised, so ranking is a dot product over a
// streamed table scan with a top-K heap. Every query logs one analytics row
// (no IP, no user-agent) and every response carries a timing breakdown.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Multipart, Query, State};
use axum::Json;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::schema;
use crate::error::{OtError, Result};
use crate::vector::{decode_blob, dot, TopK};

use super::{BridgeAuth, BridgeState};

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> usize {
    limit.unwrap_or(20).clamp(1, 100) as usize
}

fn ms_since(t: Instant) -> i64 {
    t.elapsed().as_millis() as i64
}

/// Record one analytics row. Query text is redactable by config; counts and
/// latency survive redaction.
async fn log_search(state: &BridgeState, query: &str, mode: &str, results: usize, total_ms: i64) {
    let text = if state.settings.search_log_query_text {
        query.to_string()
    } else {
        "[redacted]".to_string()
    };
    let mode = mode.to_string();
    let result = state
        .db
        .call(move |conn| {
            schema::insert_search_query(conn, &text, &mode, results as i64, total_ms)
        })
        .await;
    if let Err(e) = result {
        log::warn!("Failed to log search query: {}", e);
    }
}

// ----- Table scans -----

#[derive(Debug, Clone, serde::Serialize)]
pub struct FrameHit {
    pub video_id: String,
    pub timestamp_ms: i64,
    pub frame_num: i64,
    pub score: f32,
}

pub fn scan_frames(conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<FrameHit>> {
    let mut stmt =
        conn.prepare("SELECT video_id, timestamp_ms, frame_num, embedding FROM frame_embeddings")?;
    let mut rows = stmt.query([])?;
    let mut top = TopK::new(limit);
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(3)?;
        let embedding = decode_blob(&blob)?;
        if embedding.len() != query.len() {
            continue;
        }
        top.push(
            dot(query, &embedding),
            (
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ),
        );
    }
    Ok(top
        .into_sorted()
        .into_iter()
        .map(|(score, (video_id, timestamp_ms, frame_num))| FrameHit {
            video_id,
            timestamp_ms,
            frame_num,
            score,
        })
        .collect())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmentHit {
    pub video_id: String,
    pub segment_text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

pub fn scan_transcripts(conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<SegmentHit>> {
    let mut stmt = conn.prepare(
        "SELECT video_id, segment_text, start_ms, end_ms, embedding FROM transcript_embeddings",
    )?;
    let mut rows = stmt.query([])?;
    let mut top = TopK::new(limit);
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(4)?;
        let embedding = decode_blob(&blob)?;
        if embedding.len() != query.len() {
            continue;
        }
        top.push(
            dot(query, &embedding),
            (
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ),
        );
    }
    Ok(top
        .into_sorted()
        .into_iter()
        .map(|(score, (video_id, segment_text, start_ms, end_ms))| SegmentHit {
            video_id,
            segment_text,
            start_ms,
            end_ms,
            score: Some(score),
        })
        .collect())
}

pub fn scan_transcripts_exact(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<SegmentHit>> {
    let pattern = format!("%{}%", query);
    let mut stmt = conn.prepare(
        "SELECT video_id, segment_text, start_ms, end_ms FROM transcript_embeddings
         WHERE segment_text LIKE ?1 ORDER BY start_ms LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(rusqlite::params![pattern, limit as i64], |row| {
            Ok(SegmentHit {
                video_id: row.get(0)?,
                segment_text: row.get(1)?,
                start_ms: row.get(2)?,
                end_ms: row.get(3)?,
                score: None,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CaptionHit {
    pub video_id: String,
    pub timestamp_ms: i64,
    pub frame_num: i64,
    pub caption_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub thumbnail_url: String,
}

fn caption_hit(
    video_id: String,
    timestamp_ms: i64,
    frame_num: i64,
    caption_text: String,
    score: Option<f32>,
) -> CaptionHit {
    let thumbnail_url = format!("/thumbnails/{}/{}.jpg", video_id, timestamp_ms);
    CaptionHit {
        video_id,
        timestamp_ms,
        frame_num,
        caption_text,
        score,
        thumbnail_url,
    }
}

pub fn scan_captions(conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<CaptionHit>> {
    let mut stmt = conn.prepare(
        "SELECT video_id, timestamp_ms, frame_num, caption_text, embedding FROM caption_embeddings",
    )?;
    let mut rows = stmt.query([])?;
    let mut top = TopK::new(limit);
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(4)?;
        let embedding = decode_blob(&blob)?;
        if embedding.len() != query.len() {
            continue;
        }
        top.push(
            dot(query, &embedding),
            (
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ),
        );
    }
    Ok(top
        .into_sorted()
        .into_iter()
        .map(|(score, (video_id, timestamp_ms, frame_num, text))| {
            caption_hit(video_id, timestamp_ms, frame_num, text, Some(score))
        })
        .collect())
}

pub fn scan_captions_exact(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<CaptionHit>> {
    let pattern = format!("%{}%", query);
    let mut stmt = conn.prepare(
        "SELECT video_id, timestamp_ms, frame_num, caption_text FROM caption_embeddings
         WHERE caption_text LIKE ?1 ORDER BY timestamp_ms LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(rusqlite::params![pattern, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits
        .into_iter()
        .map(|(video_id, timestamp_ms, frame_num, text)| {
            caption_hit(video_id, timestamp_ms, frame_num, text, None)
        })
        .collect())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClipHit {
    pub video_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub start_frame: i64,
    pub end_frame: i64,
    pub num_frames: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub thumbnail_url: String,
}

#[allow(clippy::too_many_arguments)]
fn clip_hit(
    video_id: String,
    start_ms: i64,
    end_ms: i64,
    start_frame: i64,
    end_frame: i64,
    num_frames: i64,
    action_text: Option<String>,
    score: Option<f32>,
) -> ClipHit {
    // Midpoint thumbnail; the endpoint falls back to the nearest frame
    let mid_ms = (start_ms + end_ms) / 2;
    let thumbnail_url = format!("/thumbnails/{}/{}.jpg", video_id, mid_ms);
    ClipHit {
        video_id,
        start_ms,
        end_ms,
        start_frame,
        end_frame,
        num_frames,
        duration_ms: end_ms - start_ms,
        action_text,
        score,
        thumbnail_url,
    }
}

pub fn scan_clips(conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<ClipHit>> {
    let mut stmt = conn.prepare(
        "SELECT video_id, start_ms, end_ms, start_frame, end_frame, num_frames, embedding
         FROM clip_embeddings",
    )?;
    let mut rows = stmt.query([])?;
    let mut top = TopK::new(limit);
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(6)?;
        let embedding = decode_blob(&blob)?;
        if embedding.len() != query.len() {
            continue;
        }
        top.push(
            dot(query, &embedding),
            (
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ),
        );
    }
    Ok(top
        .into_sorted()
        .into_iter()
        .map(|(score, (vid, s, e, sf, ef, n))| {
            clip_hit(vid, s, e, sf, ef, n, None, Some(score))
        })
        .collect())
}

pub fn scan_actions(conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<ClipHit>> {
    let mut stmt = conn.prepare(
        "SELECT video_id, start_ms, end_ms, start_frame, end_frame, num_frames, action_text, embedding
         FROM action_embeddings",
    )?;
    let mut rows = stmt.query([])?;
    let mut top = TopK::new(limit);
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(7)?;
        let embedding = decode_blob(&blob)?;
        if embedding.len() != query.len() {
            continue;
        }
        top.push(
            dot(query, &embedding),
            (
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ),
        );
    }
    Ok(top
        .into_sorted()
        .into_iter()
        .map(|(score, (vid, s, e, sf, ef, n, text))| {
            clip_hit(vid, s, e, sf, ef, n, Some(text), Some(score))
        })
        .collect())
}

pub fn scan_actions_exact(conn: &Connection, query: &str, limit: usize) -> Result<Vec<ClipHit>> {
    let pattern = format!("%{}%", query);
    let mut stmt = conn.prepare(
        "SELECT video_id, start_ms, end_ms, start_frame, end_frame, num_frames, action_text
         FROM action_embeddings WHERE action_text LIKE ?1 ORDER BY start_ms LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(rusqlite::params![pattern, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits
        .into_iter()
        .map(|(vid, s, e, sf, ef, n, text)| clip_hit(vid, s, e, sf, ef, n, Some(text), None))
        .collect())
}

// ----- Handlers -----

/// Text-to-video visual search: the query goes through the vision model's
/// text branch, then nearest-neighbour over frame embeddings.
pub async fn visual_text_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let query_embedding = state.models.encode_visual_text(&params.q).await?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let results = state
        .db
        .call(move |conn| scan_frames(conn, &query_embedding, limit))
        .await?;
    let search_ms = ms_since(t1);
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "visual_text", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "visual_text",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Image-to-video visual search on an uploaded image.
pub async fn visual_image_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut image_bytes: Option<Vec<u8>> = None;
    let mut limit = 20usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| OtError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                image_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| OtError::Validation(format!("Bad image field: {}", e)))?
                        .to_vec(),
                );
            }
            Some("limit") => {
                if let Ok(text) = field.text().await {
                    if let Ok(parsed) = text.parse::<i64>() {
                        limit = clamp_limit(Some(parsed));
                    }
                }
            }
            _ => {}
        }
    }
    let image_bytes =
        image_bytes.ok_or_else(|| OtError::Validation("Missing required field: image".into()))?;

    let t0 = Instant::now();
    let mut embeddings = state.models.encode_images(&[image_bytes]).await?;
    let query_embedding = embeddings
        .pop()
        .ok_or_else(|| OtError::Model("vision model returned no embedding".to_string()))?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let results = state
        .db
        .call(move |conn| scan_frames(conn, &query_embedding, limit))
        .await?;
    let search_ms = ms_since(t1);
    let total_ms = ms_since(t0);

    log_search(&state, "[image]", "visual_image", results.len(), total_ms).await;
    Ok(Json(json!({
        "mode": "visual_image",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Semantic transcript search via the text model.
pub async fn transcript_semantic_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let query_embedding = state.models.encode_text_query(&params.q).await?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let results = state
        .db
        .call(move |conn| scan_transcripts(conn, &query_embedding, limit))
        .await?;
    let search_ms = ms_since(t1);
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "transcript_semantic", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "transcript_semantic",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Case-insensitive substring search on transcript segments.
pub async fn transcript_exact_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let q = params.q.clone();
    let results = state
        .db
        .call(move |conn| scan_transcripts_exact(conn, &q, limit))
        .await?;
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "transcript_exact", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "transcript_exact",
        "timing": { "search_ms": total_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Semantic search over AI-generated frame captions.
pub async fn caption_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let query_embedding = state.models.encode_text_query(&params.q).await?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let results = state
        .db
        .call(move |conn| scan_captions(conn, &query_embedding, limit))
        .await?;
    let search_ms = ms_since(t1);
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "caption_semantic", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "caption_semantic",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Case-insensitive substring search on captions.
pub async fn caption_exact_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let q = params.q.clone();
    let results = state
        .db
        .call(move |conn| scan_captions_exact(conn, &q, limit))
        .await?;
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "caption_exact", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "caption_exact",
        "timing": { "search_ms": total_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Visual clip search: vision text branch against mean-pooled clip windows.
pub async fn clip_visual_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let query_embedding = state.models.encode_visual_text(&params.q).await?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let results = state
        .db
        .call(move |conn| scan_clips(conn, &query_embedding, limit))
        .await?;
    let search_ms = ms_since(t1);
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "clip_visual", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "clip_visual",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Semantic search over temporal action captions.
pub async fn action_semantic_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let query_embedding = state.models.encode_text_query(&params.q).await?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let results = state
        .db
        .call(move |conn| scan_actions(conn, &query_embedding, limit))
        .await?;
    let search_ms = ms_since(t1);
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "action_semantic", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "action_semantic",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Case-insensitive substring search on action captions.
pub async fn action_exact_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    let q = params.q.clone();
    let results = state
        .db
        .call(move |conn| scan_actions_exact(conn, &q, limit))
        .await?;
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "action_exact", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "action_exact",
        "timing": { "search_ms": total_ms, "total_ms": total_ms },
        "results": results,
    })))
}

/// Fused result row for combined search.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CombinedHit {
    pub video_id: String,
    pub timestamp_ms: i64,
    pub frame_num: i64,
    pub score: f32,
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_text: Option<String>,
    pub thumbnail_url: String,
}

/// Merge visual and caption hits by (video_id, frame_num), keeping the
/// higher score as primary while recording both component scores.
pub fn merge_combined(
    visual: Vec<FrameHit>,
    captions: Vec<CaptionHit>,
    limit: usize,
) -> Vec<CombinedHit> {
    let mut merged: HashMap<(String, i64), CombinedHit> = HashMap::new();

    for hit in visual {
        let key = (hit.video_id.clone(), hit.frame_num);
        let thumbnail_url = format!("/thumbnails/{}/{}.jpg", hit.video_id, hit.timestamp_ms);
        merged.insert(
            key,
            CombinedHit {
                video_id: hit.video_id,
                timestamp_ms: hit.timestamp_ms,
                frame_num: hit.frame_num,
                score: hit.score,
                source: "visual",
                visual_score: Some(hit.score),
                caption_score: None,
                caption_text: None,
                thumbnail_url,
            },
        );
    }

    for hit in captions {
        let score = hit.score.unwrap_or(0.0);
        let key = (hit.video_id.clone(), hit.frame_num);
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.caption_score = Some(score);
                existing.caption_text = Some(hit.caption_text);
                if score > existing.score {
                    existing.score = score;
                    existing.source = "caption";
                }
            }
            None => {
                merged.insert(
                    key,
                    CombinedHit {
                        video_id: hit.video_id,
                        timestamp_ms: hit.timestamp_ms,
                        frame_num: hit.frame_num,
                        score,
                        source: "caption",
                        visual_score: None,
                        caption_score: Some(score),
                        caption_text: Some(hit.caption_text),
                        thumbnail_url: hit.thumbnail_url,
                    },
                );
            }
        }
    }

    let mut results: Vec<CombinedHit> = merged.into_values().collect();
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    results
}

/// Combined search: visual and caption paths in parallel (each under its own
/// model lock), fused by frame.
pub async fn combined_search(
    _auth: BridgeAuth,
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let t0 = Instant::now();

    // Two different models, two different locks: encode concurrently
    let (visual_embedding, caption_embedding) = tokio::try_join!(
        state.models.encode_visual_text(&params.q),
        state.models.encode_text_query(&params.q),
    )?;
    let encode_ms = ms_since(t0);

    let t1 = Instant::now();
    let (visual_results, caption_results) = state
        .db
        .call(move |conn| {
            Ok((
                scan_frames(conn, &visual_embedding, limit)?,
                scan_captions(conn, &caption_embedding, limit)?,
            ))
        })
        .await?;
    let search_ms = ms_since(t1);

    let results = merge_combined(visual_results, caption_results, limit);
    let total_ms = ms_since(t0);

    log_search(&state, &params.q, "combined", results.len(), total_ms).await;
    Ok(Json(json!({
        "query": params.q,
        "mode": "combined",
        "timing": { "encode_ms": encode_ms, "search_ms": search_ms, "total_ms": total_ms },
        "results": results,
    })))
}
