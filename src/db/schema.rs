// Database schema types and query helpers

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::now_iso;
use crate::error::Result;

// ----- Device -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_id: String,
    pub public_key_pem: String,
    pub device_info: Option<String>,
    pub registered_at: String,
    pub last_upload_at: Option<String>,
    pub crypto_version: String,
}

const DEVICE_COLS: &str =
    "id, device_id, public_key_pem, device_info, registered_at, last_upload_at, crypto_version";

fn device_from_row(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        device_id: row.get(1)?,
        public_key_pem: row.get(2)?,
        device_info: row.get(3)?,
        registered_at: row.get(4)?,
        last_upload_at: row.get(5)?,
        crypto_version: row.get(6)?,
    })
}

pub fn insert_device(
    conn: &Connection,
    device_id: &str,
    public_key_pem: &str,
    device_info: Option<&str>,
    crypto_version: &str,
) -> Result<Device> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO devices (id, device_id, public_key_pem, device_info, registered_at, crypto_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, device_id, public_key_pem, device_info, now_iso(), crypto_version],
    )?;
    Ok(get_device(conn, device_id)?.expect("device just inserted"))
}

pub fn get_device(conn: &Connection, device_id: &str) -> Result<Option<Device>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM devices WHERE device_id = ?1", DEVICE_COLS),
            params![device_id],
            device_from_row,
        )
        .optional()?;
    Ok(result)
}

pub fn update_device_crypto(
    conn: &Connection,
    device_id: &str,
    public_key_pem: &str,
    crypto_version: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE devices SET public_key_pem = ?1, crypto_version = ?2 WHERE device_id = ?3",
        params![public_key_pem, crypto_version, device_id],
    )?;
    Ok(())
}

pub fn touch_device_last_upload(conn: &Connection, device_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE devices SET last_upload_at = ?1 WHERE device_id = ?2",
        params![now_iso(), device_id],
    )?;
    Ok(())
}

// ----- Video -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub device_id: String,
    pub object_name: String,
    pub file_hash: String,
    pub timestamp: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub incident_tags: Vec<String>,
    pub source: Option<String>,
    pub media_type: String,
    pub exif_metadata: Option<serde_json::Value>,
    pub verification_status: String,
    pub metadata_json: serde_json::Value,
    pub category: Option<String>,
    pub location_description: Option<String>,
    pub notes: Option<String>,
    pub annotations_updated_at: Option<String>,
    pub annotations_updated_by: Option<String>,
    pub review_status: String,
    pub reviewed_at: Option<String>,
    pub reviewed_by: Option<String>,
    pub uploaded_at: String,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewVideo {
    pub device_id: String,
    pub object_name: String,
    pub file_hash: String,
    pub timestamp: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub incident_tags: Vec<String>,
    pub source: Option<String>,
    pub media_type: String,
    pub exif_metadata: Option<serde_json::Value>,
    pub verification_status: String,
    pub metadata_json: serde_json::Value,
}

const VIDEO_COLS: &str = "id, device_id, object_name, file_hash, timestamp, latitude, longitude, \
     incident_tags, source, media_type, exif_metadata, verification_status, metadata_json, \
     category, location_description, notes, annotations_updated_at, annotations_updated_by, \
     review_status, reviewed_at, reviewed_by, uploaded_at, deleted_at, deleted_by";

fn video_from_row(row: &rusqlite::Row) -> rusqlite::Result<Video> {
    let tags_json: String = row.get(7)?;
    let exif_json: Option<String> = row.get(10)?;
    let metadata_json: String = row.get(12)?;
    Ok(Video {
        id: row.get(0)?,
        device_id: row.get(1)?,
        object_name: row.get(2)?,
        file_hash: row.get(3)?,
        timestamp: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
        incident_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        source: row.get(8)?,
        media_type: row.get(9)?,
        exif_metadata: exif_json.and_then(|s| serde_json::from_str(&s).ok()),
        verification_status: row.get(11)?,
        metadata_json: serde_json::from_str(&metadata_json)
            .unwrap_or(serde_json::Value::Null),
        category: row.get(13)?,
        location_description: row.get(14)?,
        notes: row.get(15)?,
        annotations_updated_at: row.get(16)?,
        annotations_updated_by: row.get(17)?,
        review_status: row.get(18)?,
        reviewed_at: row.get(19)?,
        reviewed_by: row.get(20)?,
        uploaded_at: row.get(21)?,
        deleted_at: row.get(22)?,
        deleted_by: row.get(23)?,
    })
}

pub fn insert_video(conn: &Connection, video: &NewVideo) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO videos (id, device_id, object_name, file_hash, timestamp, latitude, longitude,
             incident_tags, source, media_type, exif_metadata, verification_status,
             metadata_json, uploaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            video.device_id,
            video.object_name,
            video.file_hash,
            video.timestamp,
            video.latitude,
            video.longitude,
            serde_json::to_string(&video.incident_tags)?,
            video.source,
            video.media_type,
            video
                .exif_metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            video.verification_status,
            serde_json::to_string(&video.metadata_json)?,
            now_iso(),
        ],
    )?;
    Ok(id)
}

/// Fetch a video by id. Soft-deleted rows are excluded unless asked for.
pub fn get_video(conn: &Connection, id: &str, include_deleted: bool) -> Result<Option<Video>> {
    let sql = if include_deleted {
        format!("SELECT {} FROM videos WHERE id = ?1", VIDEO_COLS)
    } else {
        format!(
            "SELECT {} FROM videos WHERE id = ?1 AND deleted_at IS NULL",
            VIDEO_COLS
        )
    };
    let result = conn
        .query_row(&sql, params![id], video_from_row)
        .optional()?;
    Ok(result)
}

/// Listing filters shared by /videos and /queue.
#[derive(Debug, Clone, Default)]
pub struct VideoFilter {
    pub device_id: Option<String>,
    pub verified_only: bool,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub search: Option<String>,
    pub media_type: Option<String>,
    pub source: Option<String>,
    pub review_status: Option<String>,
    pub sort: String,
    pub limit: i64,
    pub offset: i64,
}

fn filter_where(filter: &VideoFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["deleted_at IS NULL".to_string()];
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(ref device_id) = filter.device_id {
        values.push(SqlValue::Text(device_id.clone()));
        clauses.push(format!("device_id = ?{}", values.len()));
    }
    if filter.verified_only {
        clauses.push("verification_status = 'verified'".to_string());
    }
    for tag in &filter.tags {
        values.push(SqlValue::Text(tag.clone()));
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM json_each(videos.incident_tags) WHERE json_each.value = ?{})",
            values.len()
        ));
    }
    if let Some(ref category) = filter.category {
        values.push(SqlValue::Text(category.clone()));
        clauses.push(format!("category = ?{}", values.len()));
    }
    if let Some(ref media_type) = filter.media_type {
        values.push(SqlValue::Text(media_type.clone()));
        clauses.push(format!("media_type = ?{}", values.len()));
    }
    if let Some(ref source) = filter.source {
        values.push(SqlValue::Text(source.clone()));
        clauses.push(format!("source = ?{}", values.len()));
    }
    if let Some(ref review_status) = filter.review_status {
        values.push(SqlValue::Text(review_status.clone()));
        clauses.push(format!("review_status = ?{}", values.len()));
    }
    if let Some(ref search) = filter.search {
        let term = format!("%{}%", search);
        let base = values.len();
        values.push(SqlValue::Text(term.clone()));
        values.push(SqlValue::Text(term.clone()));
        values.push(SqlValue::Text(term));
        clauses.push(format!(
            "(notes LIKE ?{} OR location_description LIKE ?{} OR device_id LIKE ?{})",
            base + 1,
            base + 2,
            base + 3
        ));
    }

    (clauses.join(" AND "), values)
}

/// List videos matching a filter. Returns (total, page).
pub fn list_videos(conn: &Connection, filter: &VideoFilter) -> Result<(i64, Vec<Video>)> {
    let (where_sql, mut values) = filter_where(filter);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM videos WHERE {}", where_sql),
        params_from_iter(values.clone()),
        |row| row.get(0),
    )?;

    let order = match filter.sort.as_str() {
        "oldest" => "uploaded_at ASC",
        // Least-tagged first so uncategorised items surface at the top
        "tag" => "json_array_length(incident_tags) ASC, uploaded_at ASC",
        _ => "uploaded_at DESC",
    };

    values.push(SqlValue::Integer(filter.limit));
    values.push(SqlValue::Integer(filter.offset));
    let sql = format!(
        "SELECT {} FROM videos WHERE {} ORDER BY {} LIMIT ?{} OFFSET ?{}",
        VIDEO_COLS,
        where_sql,
        order,
        values.len() - 1,
        values.len()
    );

    let mut stmt = conn.prepare(&sql)?;
    let videos = stmt
        .query_map(params_from_iter(values), video_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((total, videos))
}

/// All live videos, oldest upload first. Used by the integrity report.
pub fn list_all_videos(conn: &Connection) -> Result<Vec<Video>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM videos WHERE deleted_at IS NULL ORDER BY uploaded_at ASC",
        VIDEO_COLS
    ))?;
    let videos = stmt
        .query_map([], video_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(videos)
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationChanges {
    pub category: Option<Option<String>>,
    pub location_description: Option<Option<String>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<Option<String>>,
    pub incident_tags: Option<Vec<String>>,
}

pub fn update_annotations(
    conn: &Connection,
    video_id: &str,
    changes: &AnnotationChanges,
    updated_by: &str,
) -> Result<()> {
    if let Some(ref category) = changes.category {
        conn.execute(
            "UPDATE videos SET category = ?1 WHERE id = ?2",
            params![category, video_id],
        )?;
    }
    if let Some(ref loc) = changes.location_description {
        conn.execute(
            "UPDATE videos SET location_description = ?1 WHERE id = ?2",
            params![loc, video_id],
        )?;
    }
    if let Some(lat) = changes.latitude {
        conn.execute(
            "UPDATE videos SET latitude = ?1 WHERE id = ?2",
            params![lat, video_id],
        )?;
    }
    if let Some(lon) = changes.longitude {
        conn.execute(
            "UPDATE videos SET longitude = ?1 WHERE id = ?2",
            params![lon, video_id],
        )?;
    }
    if let Some(ref notes) = changes.notes {
        conn.execute(
            "UPDATE videos SET notes = ?1 WHERE id = ?2",
            params![notes, video_id],
        )?;
    }
    if let Some(ref tags) = changes.incident_tags {
        conn.execute(
            "UPDATE videos SET incident_tags = ?1 WHERE id = ?2",
            params![serde_json::to_string(tags)?, video_id],
        )?;
    }
    conn.execute(
        "UPDATE videos SET annotations_updated_at = ?1, annotations_updated_by = ?2 WHERE id = ?3",
        params![now_iso(), updated_by, video_id],
    )?;
    Ok(())
}

pub fn update_review_status(
    conn: &Connection,
    video_id: &str,
    review_status: &str,
    reviewer: Option<&str>,
) -> Result<()> {
    match reviewer {
        Some(username) => conn.execute(
            "UPDATE videos SET review_status = ?1, reviewed_at = ?2, reviewed_by = ?3 WHERE id = ?4",
            params![review_status, now_iso(), username, video_id],
        )?,
        // Reset to pending clears the reviewer stamp
        None => conn.execute(
            "UPDATE videos SET review_status = ?1, reviewed_at = NULL, reviewed_by = NULL WHERE id = ?2",
            params![review_status, video_id],
        )?,
    };
    Ok(())
}

pub fn soft_delete_video(conn: &Connection, video_id: &str, deleted_by: &str) -> Result<()> {
    conn.execute(
        "UPDATE videos SET deleted_at = ?1, deleted_by = ?2 WHERE id = ?3",
        params![now_iso(), deleted_by, video_id],
    )?;
    Ok(())
}

/// Remove a tag from every live video's tag array. Returns videos affected.
pub fn remove_tag_from_videos(conn: &Connection, tag: &str) -> Result<i64> {
    let mut stmt = conn.prepare(
        "SELECT id, incident_tags FROM videos
         WHERE deleted_at IS NULL
           AND EXISTS (SELECT 1 FROM json_each(videos.incident_tags) WHERE json_each.value = ?1)",
    )?;
    let rows = stmt
        .query_map(params![tag], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut count = 0i64;
    for (id, tags_json) in rows {
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
        let filtered: Vec<String> = tags.into_iter().filter(|t| t != tag).collect();
        conn.execute(
            "UPDATE videos SET incident_tags = ?1 WHERE id = ?2",
            params![serde_json::to_string(&filtered)?, id],
        )?;
        count += 1;
    }
    Ok(count)
}

/// Distinct tags found on live videos (catches any that slipped past the
/// catalogue).
pub fn distinct_video_tags(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT json_each.value FROM videos, json_each(videos.incident_tags)
         WHERE videos.deleted_at IS NULL",
    )?;
    let tags = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags.into_iter().filter(|t| !t.is_empty()).collect())
}

/// Tag usage counts over live videos, descending.
pub fn tag_counts(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT json_each.value AS tag, COUNT(*) AS cnt
         FROM videos, json_each(videos.incident_tags)
         WHERE videos.deleted_at IS NULL
         GROUP BY tag ORDER BY cnt DESC",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().filter(|(t, _)| !t.is_empty()).collect())
}

pub fn category_counts(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) AS cnt FROM videos
         WHERE deleted_at IS NULL AND category IS NOT NULL
         GROUP BY category ORDER BY cnt DESC",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn review_status_counts(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT review_status, COUNT(*) FROM videos WHERE deleted_at IS NULL GROUP BY review_status",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ----- User -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_login_at: Option<String>,
}

const USER_COLS: &str =
    "id, username, password_hash, display_name, role, is_active, created_at, last_login_at";

fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        role: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        last_login_at: row.get(7)?,
    })
}

pub fn insert_user(
    conn: &Connection,
    username: &str,
    password_hash: &str,
    display_name: &str,
    role: &str,
) -> Result<User> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users (id, username, password_hash, display_name, role, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![id, username, password_hash, display_name, role, now_iso()],
    )?;
    Ok(get_user_by_username(conn, username)?.expect("user just inserted"))
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", USER_COLS),
            params![username],
            user_from_row,
        )
        .optional()?;
    Ok(result)
}

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLS),
            params![id],
            user_from_row,
        )
        .optional()?;
    Ok(result)
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users ORDER BY created_at ASC",
        USER_COLS
    ))?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

pub fn count_users(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    Ok(count)
}

pub fn update_user_fields(
    conn: &Connection,
    user_id: &str,
    display_name: Option<&str>,
    role: Option<&str>,
    is_active: Option<bool>,
) -> Result<()> {
    if let Some(display_name) = display_name {
        conn.execute(
            "UPDATE users SET display_name = ?1 WHERE id = ?2",
            params![display_name, user_id],
        )?;
    }
    if let Some(role) = role {
        conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role, user_id],
        )?;
    }
    if let Some(is_active) = is_active {
        conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![is_active as i64, user_id],
        )?;
    }
    Ok(())
}

pub fn set_user_password(conn: &Connection, user_id: &str, password_hash: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET password_hash = ?1 WHERE id = ?2",
        params![password_hash, user_id],
    )?;
    Ok(())
}

pub fn touch_user_last_login(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
        params![now_iso(), user_id],
    )?;
    Ok(())
}

// ----- Tag catalogue -----

/// Insert a tag into the catalogue. Idempotent.
pub fn insert_tag(conn: &Connection, name: &str) -> Result<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO tags (name, created_at) VALUES (?1, ?2)",
        params![name, now_iso()],
    )?;
    Ok(rows > 0)
}

/// Catalogue tags in insertion order.
pub fn list_tags(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM tags ORDER BY created_at ASC, name ASC")?;
    let tags = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
}

pub fn delete_tag(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("DELETE FROM tags WHERE name = ?1", params![name])?;
    Ok(())
}

// ----- Indexing job queue -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJob {
    pub id: String,
    pub video_id: String,
    pub object_name: String,
    pub status: String,
    pub visual_indexed: bool,
    pub transcript_indexed: bool,
    pub caption_indexed: bool,
    pub clip_indexed: bool,
    pub frame_count: Option<i64>,
    pub segment_count: Option<i64>,
    pub caption_count: Option<i64>,
    pub clip_count: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

const JOB_COLS: &str = "id, video_id, object_name, status, visual_indexed, transcript_indexed, \
     caption_indexed, clip_indexed, frame_count, segment_count, caption_count, clip_count, \
     error_message, created_at, completed_at";

fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<IndexJob> {
    Ok(IndexJob {
        id: row.get(0)?,
        video_id: row.get(1)?,
        object_name: row.get(2)?,
        status: row.get(3)?,
        visual_indexed: row.get::<_, i64>(4)? != 0,
        transcript_indexed: row.get::<_, i64>(5)? != 0,
        caption_indexed: row.get::<_, i64>(6)? != 0,
        clip_indexed: row.get::<_, i64>(7)? != 0,
        frame_count: row.get(8)?,
        segment_count: row.get(9)?,
        caption_count: row.get(10)?,
        clip_count: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

pub fn insert_index_job(conn: &Connection, video_id: &str, object_name: &str) -> Result<IndexJob> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO video_index_status (id, video_id, object_name, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![id, video_id, object_name, now_iso()],
    )?;
    Ok(get_index_job(conn, video_id)?.expect("job just inserted"))
}

pub fn get_index_job(conn: &Connection, video_id: &str) -> Result<Option<IndexJob>> {
    let result = conn
        .query_row(
            &format!(
                "SELECT {} FROM video_index_status WHERE video_id = ?1",
                JOB_COLS
            ),
            params![video_id],
            job_from_row,
        )
        .optional()?;
    Ok(result)
}

pub fn list_index_jobs(conn: &Connection) -> Result<Vec<IndexJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM video_index_status ORDER BY created_at ASC",
        JOB_COLS
    ))?;
    let jobs = stmt
        .query_map([], job_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}

/// Oldest job awaiting work (any of the three pending states).
pub fn next_pending_job(conn: &Connection) -> Result<Option<IndexJob>> {
    let result = conn
        .query_row(
            &format!(
                "SELECT {} FROM video_index_status
                 WHERE status IN ('pending', 'pending_visual', 'pending_fix')
                 ORDER BY created_at ASC LIMIT 1",
                JOB_COLS
            ),
            [],
            job_from_row,
        )
        .optional()?;
    Ok(result)
}

pub fn set_job_status(conn: &Connection, video_id: &str, status: &str) -> Result<()> {
    conn.execute(
        "UPDATE video_index_status SET status = ?1 WHERE video_id = ?2",
        params![status, video_id],
    )?;
    Ok(())
}

pub fn set_job_failed(conn: &Connection, video_id: &str, error: &str) -> Result<()> {
    let truncated: String = error
        .chars()
        .take(crate::constants::ERROR_MESSAGE_MAX_CHARS)
        .collect();
    conn.execute(
        "UPDATE video_index_status SET status = 'failed', error_message = ?1 WHERE video_id = ?2",
        params![truncated, video_id],
    )?;
    Ok(())
}

pub fn set_job_completed(conn: &Connection, video_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE video_index_status SET status = 'completed', completed_at = ?1, error_message = NULL
         WHERE video_id = ?2",
        params![now_iso(), video_id],
    )?;
    Ok(())
}

/// Modality columns updated as each pipeline stage lands.
pub fn set_job_modality(
    conn: &Connection,
    video_id: &str,
    flag_col: &str,
    count_col: &str,
    count: i64,
) -> Result<()> {
    // Column names come from a fixed internal set, never from input
    let sql = format!(
        "UPDATE video_index_status SET {} = 1, {} = ?1 WHERE video_id = ?2",
        flag_col, count_col
    );
    conn.execute(&sql, params![count, video_id])?;
    Ok(())
}

/// Reset a job for a full reindex (all modality state cleared).
pub fn reset_job_full(conn: &Connection, video_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE video_index_status SET status = 'pending',
             visual_indexed = 0, transcript_indexed = 0, caption_indexed = 0, clip_indexed = 0,
             frame_count = NULL, segment_count = NULL, caption_count = NULL, clip_count = NULL,
             error_message = NULL, completed_at = NULL
         WHERE video_id = ?1",
        params![video_id],
    )?;
    Ok(())
}

/// Reset visual state only (frames, clips, actions), keeping captions and
/// transcripts.
pub fn reset_job_visual(conn: &Connection, video_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE video_index_status SET status = 'pending_visual',
             visual_indexed = 0, frame_count = NULL,
             clip_indexed = 0, clip_count = NULL,
             error_message = NULL
         WHERE video_id = ?1",
        params![video_id],
    )?;
    Ok(())
}

pub fn set_job_fix(conn: &Connection, video_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE video_index_status SET status = 'pending_fix', error_message = NULL
         WHERE video_id = ?1",
        params![video_id],
    )?;
    Ok(())
}

pub fn job_status_counts(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM video_index_status GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Videos with no indexing job row yet (used by reindex-all back-fill).
pub fn videos_missing_index_jobs(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, object_name FROM videos
         WHERE deleted_at IS NULL
           AND id NOT IN (SELECT video_id FROM video_index_status)",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ----- Embedding rows -----

pub fn insert_frame_embedding(
    conn: &Connection,
    video_id: &str,
    frame_num: i64,
    timestamp_ms: i64,
    embedding: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO frame_embeddings (video_id, frame_num, timestamp_ms, embedding)
         VALUES (?1, ?2, ?3, ?4)",
        params![video_id, frame_num, timestamp_ms, embedding],
    )?;
    Ok(())
}

pub fn insert_transcript_embedding(
    conn: &Connection,
    video_id: &str,
    segment_text: &str,
    start_ms: i64,
    end_ms: i64,
    embedding: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO transcript_embeddings (video_id, segment_text, start_ms, end_ms, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![video_id, segment_text, start_ms, end_ms, embedding],
    )?;
    Ok(())
}

pub fn insert_caption_embedding(
    conn: &Connection,
    video_id: &str,
    frame_num: i64,
    timestamp_ms: i64,
    caption_text: &str,
    embedding: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO caption_embeddings (video_id, frame_num, timestamp_ms, caption_text, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![video_id, frame_num, timestamp_ms, caption_text, embedding],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn insert_clip_embedding(
    conn: &Connection,
    video_id: &str,
    start_ms: i64,
    end_ms: i64,
    start_frame: i64,
    end_frame: i64,
    num_frames: i64,
    embedding: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO clip_embeddings
             (video_id, start_ms, end_ms, start_frame, end_frame, num_frames, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![video_id, start_ms, end_ms, start_frame, end_frame, num_frames, embedding],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn insert_action_embedding(
    conn: &Connection,
    video_id: &str,
    start_ms: i64,
    end_ms: i64,
    start_frame: i64,
    end_frame: i64,
    num_frames: i64,
    action_text: &str,
    embedding: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO action_embeddings
             (video_id, start_ms, end_ms, start_frame, end_frame, num_frames, action_text, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            video_id, start_ms, end_ms, start_frame, end_frame, num_frames, action_text, embedding
        ],
    )?;
    Ok(())
}

/// Embedding tables addressable by modality delete/count operations.
pub const EMBEDDING_TABLES: [&str; 5] = [
    "frame_embeddings",
    "transcript_embeddings",
    "caption_embeddings",
    "clip_embeddings",
    "action_embeddings",
];

pub fn delete_embeddings_for_video(conn: &Connection, table: &str, video_id: &str) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE video_id = ?1", table),
        params![video_id],
    )?;
    Ok(())
}

pub fn delete_all_embeddings(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", table), [])?;
    Ok(())
}

pub fn count_embeddings_for_video(conn: &Connection, table: &str, video_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE video_id = ?1", table),
        params![video_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ----- Face detections and clusters -----

#[derive(Debug, Clone, Serialize)]
pub struct FaceDetectionRow {
    pub id: i64,
    pub video_id: String,
    pub frame_num: i64,
    pub timestamp_ms: i64,
    pub bbox: (i64, i64, i64, i64),
    pub detection_score: f64,
    pub cluster_id: Option<i64>,
    pub thumbnail_path: Option<String>,
}

#[allow(clippy::too_many_arguments)]
pub fn insert_face_detection(
    conn: &Connection,
    video_id: &str,
    frame_num: i64,
    timestamp_ms: i64,
    bbox: (i64, i64, i64, i64),
    detection_score: f64,
    embedding: &[u8],
    thumbnail_path: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO face_detections
             (video_id, frame_num, timestamp_ms, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
              detection_score, embedding, thumbnail_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            video_id,
            frame_num,
            timestamp_ms,
            bbox.0,
            bbox.1,
            bbox.2,
            bbox.3,
            detection_score,
            embedding,
            thumbnail_path
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Unassigned faces with embeddings for one video: (row id, embedding blob).
pub fn unassigned_faces_for_video(
    conn: &Connection,
    video_id: &str,
) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, embedding FROM face_detections
         WHERE video_id = ?1 AND cluster_id IS NULL AND embedding IS NOT NULL",
    )?;
    let rows = stmt
        .query_map(params![video_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Every face embedding in the database: (row id, embedding blob).
pub fn all_face_embeddings(conn: &Connection) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, embedding FROM face_detections WHERE embedding IS NOT NULL ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn set_face_cluster(conn: &Connection, face_id: i64, cluster_id: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE face_detections SET cluster_id = ?1 WHERE id = ?2",
        params![cluster_id, face_id],
    )?;
    Ok(())
}

pub fn clear_all_face_clusters(conn: &Connection) -> Result<()> {
    conn.execute("UPDATE face_detections SET cluster_id = NULL", [])?;
    conn.execute("DELETE FROM face_clusters", [])?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceCluster {
    pub id: i64,
    pub face_count: i64,
    pub video_count: i64,
    pub representative_face_id: Option<i64>,
    pub updated_at: Option<String>,
}

pub fn insert_face_cluster(
    conn: &Connection,
    cluster_id: i64,
    face_count: i64,
    video_count: i64,
    centroid: &[u8],
    representative_face_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO face_clusters (id, face_count, video_count, centroid, representative_face_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![cluster_id, face_count, video_count, centroid, representative_face_id, now_iso()],
    )?;
    Ok(())
}

pub fn list_face_clusters(conn: &Connection) -> Result<Vec<FaceCluster>> {
    let mut stmt = conn.prepare(
        "SELECT id, face_count, video_count, representative_face_id, updated_at
         FROM face_clusters ORDER BY face_count DESC",
    )?;
    let clusters = stmt
        .query_map([], |row| {
            Ok(FaceCluster {
                id: row.get(0)?,
                face_count: row.get(1)?,
                video_count: row.get(2)?,
                representative_face_id: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(clusters)
}

/// Cluster centroids as (cluster id, centroid blob).
pub fn cluster_centroids(conn: &Connection) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut stmt =
        conn.prepare("SELECT id, centroid FROM face_clusters WHERE centroid IS NOT NULL")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn faces_in_cluster(conn: &Connection, cluster_id: i64) -> Result<Vec<FaceDetectionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, video_id, frame_num, timestamp_ms, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
                detection_score, cluster_id, thumbnail_path
         FROM face_detections WHERE cluster_id = ?1 ORDER BY detection_score DESC",
    )?;
    let rows = stmt
        .query_map(params![cluster_id], |row| {
            Ok(FaceDetectionRow {
                id: row.get(0)?,
                video_id: row.get(1)?,
                frame_num: row.get(2)?,
                timestamp_ms: row.get(3)?,
                bbox: (row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?),
                detection_score: row.get(8)?,
                cluster_id: row.get(9)?,
                thumbnail_path: row.get(10)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Recalculate face_count / video_count for every cluster.
pub fn refresh_cluster_counts(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE face_clusters SET
             face_count = (SELECT COUNT(*) FROM face_detections
                           WHERE face_detections.cluster_id = face_clusters.id),
             video_count = (SELECT COUNT(DISTINCT video_id) FROM face_detections
                            WHERE face_detections.cluster_id = face_clusters.id),
             updated_at = ?1",
        params![now_iso()],
    )?;
    Ok(())
}

// ----- Search query log -----

pub fn insert_search_query(
    conn: &Connection,
    query_text: &str,
    search_mode: &str,
    result_count: i64,
    duration_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO search_queries (query_text, search_mode, result_count, duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![query_text, search_mode, result_count, duration_ms, now_iso()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    pub fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample_video(device_id: &str, tags: &[&str]) -> NewVideo {
        NewVideo {
            device_id: device_id.to_string(),
            object_name: format!("videos/{}/clip.mp4", device_id),
            file_hash: "ab".repeat(32),
            timestamp: "2026-05-01T12:00:00.000000".to_string(),
            latitude: Some(40.7),
            longitude: Some(-74.0),
            incident_tags: tags.iter().map(|t| t.to_string()).collect(),
            source: Some("live".to_string()),
            media_type: "video".to_string(),
            exif_metadata: None,
            verification_status: "verified".to_string(),
            metadata_json: serde_json::json!({"version": "1.0"}),
        }
    }

    #[test]
    fn test_device_round_trip() {
        let conn = test_conn();
        let device = insert_device(&conn, "dev-A", "PEM", Some("pixel 8"), "hmac").unwrap();
        assert_eq!(device.crypto_version, "hmac");

        update_device_crypto(&conn, "dev-A", "PEM2", "ecdsa").unwrap();
        let device = get_device(&conn, "dev-A").unwrap().unwrap();
        assert_eq!(device.crypto_version, "ecdsa");
        assert_eq!(device.public_key_pem, "PEM2");
    }

    #[test]
    fn test_video_tags_round_trip() {
        let conn = test_conn();
        let id = insert_video(&conn, &sample_video("dev-A", &["protest", "police"])).unwrap();
        let video = get_video(&conn, &id, false).unwrap().unwrap();
        assert_eq!(video.incident_tags, vec!["protest", "police"]);
        assert_eq!(video.review_status, "pending");
    }

    #[test]
    fn test_listing_excludes_soft_deleted() {
        let conn = test_conn();
        let keep = insert_video(&conn, &sample_video("dev-A", &[])).unwrap();
        let gone = insert_video(&conn, &sample_video("dev-A", &[])).unwrap();
        soft_delete_video(&conn, &gone, "admin-id").unwrap();

        let filter = VideoFilter {
            limit: 50,
            ..Default::default()
        };
        let (total, videos) = list_videos(&conn, &filter).unwrap();
        assert_eq!(total, 1);
        assert_eq!(videos[0].id, keep);
        assert!(get_video(&conn, &gone, false).unwrap().is_none());
        assert!(get_video(&conn, &gone, true).unwrap().is_some());
    }

    #[test]
    fn test_tags_contain_all_filter() {
        let conn = test_conn();
        insert_video(&conn, &sample_video("dev-A", &["a", "b"])).unwrap();
        insert_video(&conn, &sample_video("dev-B", &["a"])).unwrap();

        let filter = VideoFilter {
            tags: vec!["a".to_string(), "b".to_string()],
            limit: 50,
            ..Default::default()
        };
        let (total, videos) = list_videos(&conn, &filter).unwrap();
        assert_eq!(total, 1);
        assert_eq!(videos[0].device_id, "dev-A");
    }

    #[test]
    fn test_remove_tag_from_videos() {
        let conn = test_conn();
        let id = insert_video(&conn, &sample_video("dev-A", &["typo", "keep"])).unwrap();
        let affected = remove_tag_from_videos(&conn, "typo").unwrap();
        assert_eq!(affected, 1);
        let video = get_video(&conn, &id, false).unwrap().unwrap();
        assert_eq!(video.incident_tags, vec!["keep"]);
    }

    #[test]
    fn test_index_job_lifecycle() {
        let conn = test_conn();
        let job = insert_index_job(&conn, "vid-1", "videos/d/f.mp4").unwrap();
        assert_eq!(job.status, "pending");

        let next = next_pending_job(&conn).unwrap().unwrap();
        assert_eq!(next.video_id, "vid-1");

        set_job_status(&conn, "vid-1", "processing").unwrap();
        assert!(next_pending_job(&conn).unwrap().is_none());

        set_job_modality(&conn, "vid-1", "visual_indexed", "frame_count", 12).unwrap();
        set_job_completed(&conn, "vid-1").unwrap();
        let job = get_index_job(&conn, "vid-1").unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert!(job.visual_indexed);
        assert_eq!(job.frame_count, Some(12));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_job_unique_per_video() {
        let conn = test_conn();
        insert_index_job(&conn, "vid-1", "o").unwrap();
        assert!(insert_index_job(&conn, "vid-1", "o").is_err());
    }

    #[test]
    fn test_error_message_truncated() {
        let conn = test_conn();
        insert_index_job(&conn, "vid-1", "o").unwrap();
        let long = "x".repeat(5000);
        set_job_failed(&conn, "vid-1", &long).unwrap();
        let job = get_index_job(&conn, "vid-1").unwrap().unwrap();
        assert_eq!(job.error_message.unwrap().len(), 2000);
    }

    #[test]
    fn test_tag_catalogue_idempotent() {
        let conn = test_conn();
        assert!(insert_tag(&conn, "protest").unwrap());
        assert!(!insert_tag(&conn, "protest").unwrap());
        assert_eq!(list_tags(&conn).unwrap(), vec!["protest"]);
    }
}
