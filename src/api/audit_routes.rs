// Audit log queries, chain verification, and the integrity report export.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::{self, AuditEntry};
use crate::db::schema;
use crate::error::Result;

use super::{Admin, ApiState};

fn entry_json(entry: &AuditEntry) -> Value {
    json!({
        "id": entry.id,
        "sequence_number": entry.sequence_number,
        "event_type": entry.event_type,
        "video_id": entry.video_id,
        "device_id": entry.device_id,
        "event_data": entry.event_data,
        "entry_hash": entry.entry_hash,
        "previous_hash": entry.previous_hash,
        "created_at": entry.created_at,
    })
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    pub event_type: Option<String>,
    pub video_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Query the audit log with optional filters, newest first.
pub async fn get_audit_log(
    State(state): State<ApiState>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let (total, entries) = state
        .db
        .call(move |conn| {
            audit::list_entries(
                conn,
                query.event_type.as_deref(),
                query.video_id.as_deref(),
                limit,
                offset,
            )
        })
        .await?;

    Ok(Json(json!({
        "total": total,
        "entries": entries.iter().map(entry_json).collect::<Vec<_>>(),
    })))
}

/// Verify the integrity of the entire audit chain.
pub async fn verify_audit_log(State(state): State<ApiState>) -> Result<Json<Value>> {
    let result = state.db.call(|conn| audit::verify_chain(conn)).await?;
    Ok(Json(serde_json::to_value(result)?))
}

/// Audit trail for one video, oldest first.
pub async fn get_video_audit_trail(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<Json<Value>> {
    let id = video_id.clone();
    let entries = state.db.call(move |conn| audit::video_trail(conn, &id)).await?;

    Ok(Json(json!({
        "video_id": video_id,
        "entries": entries
            .iter()
            .map(|e| {
                json!({
                    "id": e.id,
                    "sequence_number": e.sequence_number,
                    "event_type": e.event_type,
                    "event_data": e.event_data,
                    "entry_hash": e.entry_hash,
                    "created_at": e.created_at,
                })
            })
            .collect::<Vec<_>>(),
    })))
}

/// Admin-only integrity report: full chain verification plus the fingerprint
/// of every live file.
pub async fn export_integrity_report(
    Admin(_admin): Admin,
    State(state): State<ApiState>,
) -> Result<Json<Value>> {
    let (verification, videos) = state
        .db
        .call(|conn| Ok((audit::verify_chain(conn)?, schema::list_all_videos(conn)?)))
        .await?;

    let files: Vec<Value> = videos
        .iter()
        .map(|v| {
            json!({
                "id": v.id,
                "file_hash": v.file_hash,
                "device_id": v.device_id,
                "object_name": v.object_name,
                "media_type": v.media_type,
                "source": v.source,
                "verification_status": v.verification_status,
                "uploaded_at": v.uploaded_at,
                "timestamp": v.timestamp,
            })
        })
        .collect();

    Ok(Json(json!({
        "generated_at": crate::db::now_iso(),
        "chain_verification": serde_json::to_value(verification)?,
        "total_files": files.len(),
        "files": files,
    })))
}
