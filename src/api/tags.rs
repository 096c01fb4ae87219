// Tag catalogue management.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::{self, EventRefs};
use crate::db::schema;
use crate::error::{OtError, Result};

use super::{Admin, ApiState, Staff};

/// The advertised vocabulary: catalogue tags first (in catalogue order),
/// then any tags found on videos that slipped past the catalogue.
pub async fn get_tags(State(state): State<ApiState>) -> Result<Json<Value>> {
    let (catalogue, in_use) = state
        .db
        .call(|conn| {
            Ok((
                schema::list_tags(conn)?,
                schema::distinct_video_tags(conn)?,
            ))
        })
        .await?;

    let mut all_tags = catalogue.clone();
    for tag in in_use {
        if !all_tags.contains(&tag) {
            all_tags.push(tag);
        }
    }

    Ok(Json(json!({
        "default_tags": catalogue,
        "all_tags": all_tags,
    })))
}

/// Tags with usage counts, sorted by count descending.
pub async fn get_tag_counts(State(state): State<ApiState>) -> Result<Json<Value>> {
    let counts = state.db.call(|conn| schema::tag_counts(conn)).await?;
    Ok(Json(json!({
        "tags": counts
            .iter()
            .map(|(tag, count)| json!({ "tag": tag, "count": count }))
            .collect::<Vec<_>>(),
    })))
}

/// Categories with usage counts, sorted by count descending.
pub async fn get_category_counts(State(state): State<ApiState>) -> Result<Json<Value>> {
    let counts = state.db.call(|conn| schema::category_counts(conn)).await?;
    Ok(Json(json!({
        "categories": counts
            .iter()
            .map(|(category, count)| json!({ "category": category, "count": count }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateTagRequest {
    pub tag: String,
}

/// Staff adds a tag to the catalogue. Idempotent.
pub async fn create_tag(
    Staff(_user): Staff,
    State(state): State<ApiState>,
    Json(body): Json<CreateTagRequest>,
) -> Result<Json<Value>> {
    let tag = body.tag.trim().to_lowercase();
    if tag.is_empty() {
        return Err(OtError::Validation("Tag cannot be empty".to_string()));
    }

    let tag_for_db = tag.clone();
    let created = state
        .db
        .call(move |conn| schema::insert_tag(conn, &tag_for_db))
        .await?;

    Ok(Json(json!({
        "status": if created { "created" } else { "exists" },
        "tag": tag,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteTagRequest {
    pub tag: String,
}

/// Admin removes a tag everywhere: from every video's tag array and from the
/// catalogue (e.g. to fix typos).
pub async fn delete_tag(
    Admin(admin): Admin,
    State(state): State<ApiState>,
    Json(body): Json<DeleteTagRequest>,
) -> Result<Json<Value>> {
    let tag = body.tag.trim().to_string();
    if tag.is_empty() {
        return Err(OtError::Validation("Tag cannot be empty".to_string()));
    }

    let tag_for_db = tag.clone();
    let admin_id = admin.id.clone();
    let admin_name = admin.username.clone();
    let affected = state
        .db
        .call(move |conn| {
            let affected = schema::remove_tag_from_videos(conn, &tag_for_db)?;
            schema::delete_tag(conn, &tag_for_db)?;
            audit::log_event(
                conn,
                "tag_deleted",
                json!({
                    "tag": tag_for_db,
                    "videos_affected": affected,
                    "deleted_by": admin_name,
                }),
                EventRefs {
                    user_id: Some(&admin_id),
                    ..Default::default()
                },
            )?;
            Ok(affected)
        })
        .await?;

    Ok(Json(json!({
        "status": "success",
        "tag": tag,
        "videos_affected": affected,
    })))
}
