// Video listings, annotations, review queue, playback URLs, soft delete.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::{self, EventRefs};
use crate::constants::CATEGORIES;
use crate::db::schema::{self, AnnotationChanges, Video, VideoFilter};
use crate::error::{OtError, Result};

use super::{Admin, ApiState, Staff};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub device_id: Option<String>,
    #[serde(default)]
    pub verified_only: bool,
    pub tags: Option<String>,
    pub category: Option<String>,
    pub search: Option<String>,
    pub media_type: Option<String>,
    pub source: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn split_tags(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn filter_from_query(query: &ListQuery, default_sort: &str) -> VideoFilter {
    VideoFilter {
        device_id: query.device_id.clone(),
        verified_only: query.verified_only,
        tags: split_tags(&query.tags),
        category: query.category.clone(),
        search: query.search.clone(),
        media_type: query.media_type.clone(),
        source: query.source.clone(),
        review_status: None,
        sort: query.sort.clone().unwrap_or_else(|| default_sort.to_string()),
        limit: query.limit.unwrap_or(50).clamp(1, 500),
        offset: query.offset.unwrap_or(0).max(0),
    }
}

fn location_json(video: &Video) -> Value {
    match video.latitude {
        Some(lat) => json!({ "lat": lat, "lon": video.longitude }),
        None => Value::Null,
    }
}

fn summary_json(video: &Video) -> Value {
    json!({
        "id": video.id,
        "device_id": video.device_id,
        "timestamp": video.timestamp,
        "location": location_json(video),
        "incident_tags": video.incident_tags,
        "source": video.source,
        "media_type": video.media_type,
        "category": video.category,
        "verification_status": video.verification_status,
        "review_status": video.review_status,
        "uploaded_at": video.uploaded_at,
    })
}

/// List uploaded videos with optional filtering. Soft-deleted rows never
/// appear here.
pub async fn list_videos(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let filter = filter_from_query(&query, "newest");
    let (total, videos) = state
        .db
        .call(move |conn| schema::list_videos(conn, &filter))
        .await?;

    Ok(Json(json!({
        "total": total,
        "count": videos.len(),
        "videos": videos.iter().map(summary_json).collect::<Vec<_>>(),
    })))
}

/// Full record for one video.
pub async fn get_video_details(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let id = video_id.clone();
    let video = state
        .db
        .call(move |conn| schema::get_video(conn, &id, false))
        .await?
        .ok_or_else(|| OtError::NotFound("Video not found".to_string()))?;

    Ok(Json(json!({
        "id": video.id,
        "device_id": video.device_id,
        "object_name": video.object_name,
        "file_hash": video.file_hash,
        "timestamp": video.timestamp,
        "location": location_json(&video),
        "incident_tags": video.incident_tags,
        "source": video.source,
        "media_type": video.media_type,
        "exif_metadata": video.exif_metadata,
        "verification_status": video.verification_status,
        "category": video.category,
        "location_description": video.location_description,
        "notes": video.notes,
        "annotations_updated_at": video.annotations_updated_at,
        "review_status": video.review_status,
        "reviewed_at": video.reviewed_at,
        "reviewed_by": video.reviewed_by,
        "uploaded_at": video.uploaded_at,
        "metadata": video.metadata_json,
    })))
}

fn validate_category(category: &Option<String>) -> Result<()> {
    if let Some(ref c) = category {
        if !c.is_empty() && !CATEGORIES.contains(&c.as_str()) {
            return Err(OtError::Validation("Invalid category".to_string()));
        }
    }
    Ok(())
}

/// Empty string clears a text field; absent leaves it untouched.
fn text_change(value: &Option<String>) -> Option<Option<String>> {
    value
        .as_ref()
        .map(|v| if v.is_empty() { None } else { Some(v.clone()) })
}

#[derive(Debug, Deserialize)]
pub struct AnnotationUpdate {
    pub device_id: String,
    pub category: Option<String>,
    pub location_description: Option<String>,
    pub notes: Option<String>,
    pub incident_tags: Option<Vec<String>>,
}

/// Update annotations on a video. Only the owning device can update.
pub async fn update_annotations_device(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
    Json(body): Json<AnnotationUpdate>,
) -> Result<Json<Value>> {
    validate_category(&body.category)?;

    let id = video_id.clone();
    let response = state
        .db
        .call(move |conn| {
            let video = schema::get_video(conn, &id, true)?
                .ok_or_else(|| OtError::NotFound("Video not found".to_string()))?;

            if video.device_id != body.device_id {
                return Err(OtError::Forbidden(
                    "Only the recording device can update annotations".to_string(),
                ));
            }

            let old_values = json!({
                "category": video.category,
                "location_description": video.location_description,
                "notes": video.notes,
                "incident_tags": video.incident_tags,
            });

            let changes = AnnotationChanges {
                category: text_change(&body.category),
                location_description: Some(body.location_description.clone()),
                notes: Some(body.notes.clone()),
                incident_tags: body.incident_tags.clone(),
                ..Default::default()
            };
            schema::update_annotations(conn, &id, &changes, &body.device_id)?;

            let updated = schema::get_video(conn, &id, true)?.expect("row still present");
            audit::log_event(
                conn,
                "annotation_update",
                json!({
                    "old": old_values,
                    "new": {
                        "category": updated.category,
                        "location_description": updated.location_description,
                        "notes": updated.notes,
                        "incident_tags": updated.incident_tags,
                    },
                }),
                EventRefs {
                    video_id: Some(&id),
                    device_id: Some(&body.device_id),
                    ..Default::default()
                },
            )?;

            Ok(json!({
                "status": "success",
                "message": "Annotations updated",
                "video_id": id,
            }))
        })
        .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct WebAnnotationUpdate {
    pub category: Option<String>,
    pub location_description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    pub incident_tags: Option<Vec<String>>,
}

/// Staff edits annotations on any video via the web UI.
pub async fn update_annotations_web(
    Staff(user): Staff,
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
    Json(body): Json<WebAnnotationUpdate>,
) -> Result<Json<Value>> {
    validate_category(&body.category)?;

    let id = video_id.clone();
    let response = state
        .db
        .call(move |conn| {
            let video = schema::get_video(conn, &id, false)?
                .ok_or_else(|| OtError::NotFound("Video not found".to_string()))?;

            let old_values = json!({
                "category": video.category,
                "location_description": video.location_description,
                "latitude": video.latitude,
                "longitude": video.longitude,
                "notes": video.notes,
                "incident_tags": video.incident_tags,
            });

            let changes = AnnotationChanges {
                category: text_change(&body.category),
                location_description: text_change(&body.location_description),
                latitude: body.latitude,
                longitude: body.longitude,
                notes: text_change(&body.notes),
                incident_tags: body.incident_tags.clone(),
            };
            schema::update_annotations(conn, &id, &changes, &user.username)?;

            let updated = schema::get_video(conn, &id, false)?.expect("row still present");
            audit::log_event(
                conn,
                "web_annotation_update",
                json!({
                    "old": old_values,
                    "new": {
                        "category": updated.category,
                        "location_description": updated.location_description,
                        "latitude": updated.latitude,
                        "longitude": updated.longitude,
                        "notes": updated.notes,
                        "incident_tags": updated.incident_tags,
                    },
                    "updated_by": user.username,
                }),
                EventRefs {
                    video_id: Some(&id),
                    user_id: Some(&user.id),
                    ..Default::default()
                },
            )?;

            Ok(json!({
                "status": "success",
                "message": "Annotations updated",
                "video_id": id,
            }))
        })
        .await?;

    Ok(Json(response))
}

/// Generate a temporary presigned URL for playback.
pub async fn get_video_url(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let id = video_id.clone();
    let video = state
        .db
        .call(move |conn| schema::get_video(conn, &id, false))
        .await?
        .ok_or_else(|| OtError::NotFound("Video not found".to_string()))?;

    let url = state.storage.presigned_get_url(&video.object_name).await?;
    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub review_status: Option<String>,
    pub tags: Option<String>,
    pub category: Option<String>,
    pub search: Option<String>,
    pub media_type: Option<String>,
    pub source: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Review queue listing. Defaults to pending items, oldest first.
pub async fn get_queue(
    Staff(_user): Staff,
    State(state): State<ApiState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Value>> {
    let filter = VideoFilter {
        device_id: None,
        verified_only: false,
        tags: split_tags(&query.tags),
        category: query.category.clone(),
        search: query.search.clone(),
        media_type: query.media_type.clone(),
        source: query.source.clone(),
        review_status: Some(
            query
                .review_status
                .clone()
                .unwrap_or_else(|| "pending".to_string()),
        )
        .filter(|s| !s.is_empty()),
        sort: query.sort.clone().unwrap_or_else(|| "oldest".to_string()),
        limit: query.limit.unwrap_or(50).clamp(1, 500),
        offset: query.offset.unwrap_or(0).max(0),
    };

    let (total, videos) = state
        .db
        .call(move |conn| schema::list_videos(conn, &filter))
        .await?;

    let items: Vec<Value> = videos
        .iter()
        .map(|v| {
            json!({
                "id": v.id,
                "device_id": v.device_id,
                "timestamp": v.timestamp,
                "location": location_json(v),
                "incident_tags": v.incident_tags,
                "source": v.source,
                "media_type": v.media_type,
                "category": v.category,
                "location_description": v.location_description,
                "notes": v.notes,
                "verification_status": v.verification_status,
                "review_status": v.review_status,
                "reviewed_at": v.reviewed_at,
                "reviewed_by": v.reviewed_by,
                "uploaded_at": v.uploaded_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "total": total,
        "count": items.len(),
        "videos": items,
    })))
}

/// Queue statistics: counts by review status.
pub async fn get_queue_stats(
    Staff(_user): Staff,
    State(state): State<ApiState>,
) -> Result<Json<Value>> {
    let rows = state
        .db
        .call(|conn| schema::review_status_counts(conn))
        .await?;

    let mut pending = 0i64;
    let mut reviewed = 0i64;
    let mut flagged = 0i64;
    for (status, count) in rows {
        match status.as_str() {
            "reviewed" => reviewed += count,
            "flagged" => flagged += count,
            _ => pending += count,
        }
    }

    Ok(Json(json!({
        "pending": pending,
        "reviewed": reviewed,
        "flagged": flagged,
        "total": pending + reviewed + flagged,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReviewUpdate {
    pub review_status: String,
}

/// Mark a video reviewed, flagged, or back to pending. Transitions to
/// reviewed/flagged stamp the reviewer; a reset clears the stamp.
pub async fn update_review_status(
    Staff(user): Staff,
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
    Json(body): Json<ReviewUpdate>,
) -> Result<Json<Value>> {
    if !crate::constants::REVIEW_STATUSES.contains(&body.review_status.as_str()) {
        return Err(OtError::Validation(
            "review_status must be 'pending', 'reviewed', or 'flagged'".to_string(),
        ));
    }

    let id = video_id.clone();
    let response = state
        .db
        .call(move |conn| {
            let video = schema::get_video(conn, &id, false)?
                .ok_or_else(|| OtError::NotFound("Video not found".to_string()))?;

            let old_status = video.review_status.clone();
            let reviewer = if body.review_status == "pending" {
                None
            } else {
                Some(user.username.as_str())
            };
            schema::update_review_status(conn, &id, &body.review_status, reviewer)?;

            audit::log_event(
                conn,
                "queue_review",
                json!({
                    "old_status": old_status,
                    "new_status": body.review_status,
                    "reviewed_by": user.username,
                }),
                EventRefs {
                    video_id: Some(&id),
                    user_id: Some(&user.id),
                    ..Default::default()
                },
            )?;

            Ok(json!({
                "status": "success",
                "video_id": id,
                "review_status": body.review_status,
                "reviewed_by": user.username,
            }))
        })
        .await?;

    Ok(Json(response))
}

/// Admin soft delete. The object-store blob stays (retention policy is a
/// separate concern); the row disappears from every listing and playback path
/// but remains in the audit log and integrity report.
pub async fn delete_video(
    Admin(admin): Admin,
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let id = video_id.clone();
    let response = state
        .db
        .call(move |conn| {
            schema::get_video(conn, &id, false)?
                .ok_or_else(|| OtError::NotFound("Video not found".to_string()))?;

            schema::soft_delete_video(conn, &id, &admin.id)?;
            audit::log_event(
                conn,
                "video_deleted",
                json!({ "video_id": id, "deleted_by": admin.username }),
                EventRefs {
                    video_id: Some(&id),
                    user_id: Some(&admin.id),
                    ..Default::default()
                },
            )?;

            Ok(json!({
                "status": "success",
                "message": "Video deleted",
                "video_id": id,
            }))
        })
        .await?;

    Ok(Json(response))
}
