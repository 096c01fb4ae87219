// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;

use crate::error::{OtError, Result};

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: provenance core (devices, videos, audit chain, users, tags)
    r#"
    -- Registered capture devices and their public keys
    CREATE TABLE devices (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL UNIQUE,
        public_key_pem TEXT NOT NULL,
        device_info TEXT,
        registered_at TEXT NOT NULL,
        last_upload_at TEXT,
        crypto_version TEXT NOT NULL DEFAULT 'hmac'
    );

    -- Uploaded media with verification metadata
    CREATE TABLE videos (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        object_name TEXT NOT NULL,
        file_hash TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        latitude REAL,
        longitude REAL,
        incident_tags TEXT NOT NULL DEFAULT '[]',
        source TEXT,
        media_type TEXT NOT NULL DEFAULT 'video',
        exif_metadata TEXT,
        verification_status TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        category TEXT,
        location_description TEXT,
        notes TEXT,
        annotations_updated_at TEXT,
        annotations_updated_by TEXT,
        uploaded_at TEXT NOT NULL,
        deleted_at TEXT,
        deleted_by TEXT
    );

    CREATE INDEX idx_videos_device ON videos(device_id);
    CREATE INDEX idx_videos_timestamp ON videos(timestamp);
    CREATE INDEX idx_videos_uploaded_at ON videos(uploaded_at);
    CREATE INDEX idx_videos_verification ON videos(verification_status);

    -- Immutable hash-chained audit log
    CREATE TABLE audit_log (
        id TEXT PRIMARY KEY,
        sequence_number INTEGER NOT NULL UNIQUE,
        event_type TEXT NOT NULL,
        video_id TEXT,
        device_id TEXT,
        event_data TEXT NOT NULL,
        entry_hash TEXT NOT NULL,
        previous_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        user_id TEXT
    );

    CREATE INDEX idx_audit_sequence ON audit_log(sequence_number);
    CREATE INDEX idx_audit_event_type ON audit_log(event_type);
    CREATE INDEX idx_audit_video ON audit_log(video_id);

    -- Web operators with role-based access
    CREATE TABLE users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        display_name TEXT,
        role TEXT NOT NULL DEFAULT 'staff' CHECK (role IN ('admin', 'staff')),
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_login_at TEXT
    );

    -- Recognised tag catalogue (seeded from config, extended by staff)
    CREATE TABLE tags (
        name TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );
    "#,
    // Migration 2: review workflow
    r#"
    ALTER TABLE videos ADD COLUMN review_status TEXT NOT NULL DEFAULT 'pending';
    ALTER TABLE videos ADD COLUMN reviewed_at TEXT;
    ALTER TABLE videos ADD COLUMN reviewed_by TEXT;
    CREATE INDEX idx_videos_review_status ON videos(review_status);
    "#,
    // Migration 3: AI bridge tables (indexing queue, embeddings, search log)
    r#"
    -- One queue row per video, unique on video_id
    CREATE TABLE video_index_status (
        id TEXT PRIMARY KEY,
        video_id TEXT NOT NULL UNIQUE,
        object_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'pending_visual', 'pending_fix',
                              'processing', 'completed', 'failed')),
        visual_indexed INTEGER NOT NULL DEFAULT 0,
        transcript_indexed INTEGER NOT NULL DEFAULT 0,
        caption_indexed INTEGER NOT NULL DEFAULT 0,
        clip_indexed INTEGER NOT NULL DEFAULT 0,
        frame_count INTEGER,
        segment_count INTEGER,
        caption_count INTEGER,
        clip_count INTEGER,
        error_message TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX idx_index_status_status ON video_index_status(status);

    -- Embedding rows. Vectors are little-endian f32 blobs, L2-normalised.
    CREATE TABLE frame_embeddings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id TEXT NOT NULL,
        frame_num INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_frame_embeddings_video ON frame_embeddings(video_id);

    CREATE TABLE transcript_embeddings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id TEXT NOT NULL,
        segment_text TEXT NOT NULL,
        start_ms INTEGER NOT NULL,
        end_ms INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_transcript_embeddings_video ON transcript_embeddings(video_id);

    CREATE TABLE caption_embeddings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id TEXT NOT NULL,
        frame_num INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        caption_text TEXT NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_caption_embeddings_video ON caption_embeddings(video_id);

    CREATE TABLE clip_embeddings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id TEXT NOT NULL,
        start_ms INTEGER NOT NULL,
        end_ms INTEGER NOT NULL,
        start_frame INTEGER NOT NULL,
        end_frame INTEGER NOT NULL,
        num_frames INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_clip_embeddings_video ON clip_embeddings(video_id);

    CREATE TABLE action_embeddings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id TEXT NOT NULL,
        start_ms INTEGER NOT NULL,
        end_ms INTEGER NOT NULL,
        start_frame INTEGER NOT NULL,
        end_frame INTEGER NOT NULL,
        num_frames INTEGER NOT NULL,
        action_text TEXT NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_action_embeddings_video ON action_embeddings(video_id);

    -- Search analytics. No client IP or user-agent columns: privacy invariant.
    CREATE TABLE search_queries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        query_text TEXT NOT NULL,
        search_mode TEXT NOT NULL,
        result_count INTEGER,
        duration_ms INTEGER,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Records the vector dimension each embedding table was created with,
    -- so a config change can be detected at startup.
    CREATE TABLE embedding_dims (
        table_name TEXT PRIMARY KEY,
        dim INTEGER NOT NULL
    );
    "#,
    // Migration 4: face detection and clustering
    r#"
    CREATE TABLE face_detections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id TEXT NOT NULL,
        frame_num INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        bbox_x1 INTEGER NOT NULL,
        bbox_y1 INTEGER NOT NULL,
        bbox_x2 INTEGER NOT NULL,
        bbox_y2 INTEGER NOT NULL,
        detection_score REAL NOT NULL,
        embedding BLOB,
        cluster_id INTEGER,
        thumbnail_path TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_face_detections_video ON face_detections(video_id);
    CREATE INDEX idx_face_detections_cluster ON face_detections(cluster_id);

    CREATE TABLE face_clusters (
        id INTEGER PRIMARY KEY,
        face_count INTEGER NOT NULL DEFAULT 0,
        video_count INTEGER NOT NULL DEFAULT 0,
        centroid BLOB,
        representative_face_id INTEGER,
        updated_at TEXT
    );
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        return Err(OtError::Internal(format!(
            "Database schema version {} is newer than this build supports (max {})",
            current_version, target_version
        )));
    }

    if current_version == target_version {
        return Ok(());
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}

/// Embedding tables paired with the config setting that fixes their dimension.
/// `faces` is pinned at 512 by the detector's embedding head.
pub fn embedding_tables(vision_dim: usize, text_dim: usize) -> Vec<(&'static str, usize)> {
    vec![
        ("frame_embeddings", vision_dim),
        ("clip_embeddings", vision_dim),
        ("transcript_embeddings", text_dim),
        ("caption_embeddings", text_dim),
        ("action_embeddings", text_dim),
        ("face_detections", crate::constants::FACE_EMBEDDING_DIM),
    ]
}

/// Verify the stored vector dimension of each embedding table against the
/// configured one. On mismatch the table's rows are dropped and the recorded
/// dimension updated — embeddings are regenerated via reindex.
pub fn ensure_embedding_dims(conn: &Connection, tables: &[(&str, usize)]) -> Result<()> {
    for (table, dim) in tables {
        let recorded: Option<usize> = conn
            .query_row(
                "SELECT dim FROM embedding_dims WHERE table_name = ?1",
                [table],
                |row| row.get::<_, i64>(0).map(|d| d as usize),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match recorded {
            None => {
                conn.execute(
                    "INSERT INTO embedding_dims (table_name, dim) VALUES (?1, ?2)",
                    rusqlite::params![table, *dim as i64],
                )?;
            }
            Some(existing) if existing != *dim => {
                log::warn!(
                    "{}.embedding dimension mismatch: DB={}, config={}. \
                     Dropping rows (data will be regenerated via reindex).",
                    table,
                    existing,
                    dim
                );
                conn.execute(&format!("DELETE FROM {}", table), [])?;
                conn.execute(
                    "UPDATE embedding_dims SET dim = ?1 WHERE table_name = ?2",
                    rusqlite::params![*dim as i64, table],
                )?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = test_conn();
        let version: u32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_dim_mismatch_drops_rows() {
        let conn = test_conn();
        ensure_embedding_dims(&conn, &[("frame_embeddings", 768)]).unwrap();

        conn.execute(
            "INSERT INTO frame_embeddings (video_id, frame_num, timestamp_ms, embedding)
             VALUES ('v1', 0, 0, x'00000000')",
            [],
        )
        .unwrap();

        // Same dim: rows survive
        ensure_embedding_dims(&conn, &[("frame_embeddings", 768)]).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM frame_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);

        // Changed dim: rows dropped
        ensure_embedding_dims(&conn, &[("frame_embeddings", 1024)]).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM frame_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
