// Append-only hash-chained audit log.
//
// Every entry links to its predecessor by hash; appends are serialised by an
// immediate transaction so two writers can never share a predecessor. The
// operator id is spliced into event_data AFTER hashing (traceability without
// invalidating older entries), so verification strips it before recomputing.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::constants::{CHAIN_VERIFY_BATCH_SIZE, GENESIS_HASH};
use crate::db::now_iso;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub sequence_number: i64,
    pub event_type: String,
    pub video_id: Option<String>,
    pub device_id: Option<String>,
    pub event_data: Value,
    pub entry_hash: String,
    pub previous_hash: String,
    pub created_at: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventRefs<'a> {
    pub video_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
}

/// Serialise a JSON value with recursively sorted keys, in the exact textual
/// form `json.dumps(..., sort_keys=True)` produces (space after ':' and ',').
/// Audit hashes depend on this byte-for-byte.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&serde_json::to_string(key).expect("string serialises"));
                out.push_str(": ");
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).expect("scalar serialises")),
    }
}

fn compute_entry_hash(
    sequence_number: i64,
    event_type: &str,
    event_data: &Value,
    previous_hash: &str,
    created_at: &str,
) -> String {
    let content = canonical_json(&json!({
        "sequence_number": sequence_number,
        "event_type": event_type,
        "event_data": event_data,
        "previous_hash": previous_hash,
        "created_at": created_at,
    }));
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Append an event to the audit chain with hash linking.
///
/// The immediate transaction takes the database write lock before the tail
/// row is read, so concurrent appenders are serialised and sequence numbers
/// stay contiguous.
pub fn log_event(
    conn: &mut Connection,
    event_type: &str,
    event_data: Value,
    refs: EventRefs,
) -> Result<AuditEntry> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let last: Option<(i64, String)> = tx
        .query_row(
            "SELECT sequence_number, entry_hash FROM audit_log
             ORDER BY sequence_number DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (next_sequence, previous_hash) = match last {
        Some((seq, hash)) => (seq + 1, hash),
        None => (1, GENESIS_HASH.to_string()),
    };

    let created_at = now_iso();
    let entry_hash = compute_entry_hash(
        next_sequence,
        event_type,
        &event_data,
        &previous_hash,
        &created_at,
    );

    // Splice user_id into the stored event_data for traceability.
    // Deliberately outside the hash formula.
    let stored_data = match refs.user_id {
        Some(user_id) => {
            let mut data = event_data;
            if let Value::Object(ref mut map) = data {
                map.insert("user_id".to_string(), Value::String(user_id.to_string()));
            }
            data
        }
        None => event_data,
    };

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO audit_log
             (id, sequence_number, event_type, video_id, device_id, event_data,
              entry_hash, previous_hash, created_at, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            next_sequence,
            event_type,
            refs.video_id,
            refs.device_id,
            serde_json::to_string(&stored_data)?,
            entry_hash,
            previous_hash,
            created_at,
            refs.user_id,
        ],
    )?;
    tx.commit()?;

    Ok(AuditEntry {
        id,
        sequence_number: next_sequence,
        event_type: event_type.to_string(),
        video_id: refs.video_id.map(str::to_string),
        device_id: refs.device_id.map(str::to_string),
        event_data: stored_data,
        entry_hash,
        previous_hash,
        created_at,
        user_id: refs.user_id.map(str::to_string),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainError {
    pub sequence_number: i64,
    pub error: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: i64,
    pub errors: Vec<ChainError>,
}

fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
    let event_data: String = row.get(5)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        sequence_number: row.get(1)?,
        event_type: row.get(2)?,
        video_id: row.get(3)?,
        device_id: row.get(4)?,
        event_data: serde_json::from_str(&event_data).unwrap_or(Value::Null),
        entry_hash: row.get(6)?,
        previous_hash: row.get(7)?,
        created_at: row.get(8)?,
        user_id: row.get(9)?,
    })
}

const ENTRY_COLS: &str = "id, sequence_number, event_type, video_id, device_id, event_data, \
     entry_hash, previous_hash, created_at, user_id";

/// Walk the entire audit chain in batches and verify all hashes.
pub fn verify_chain(conn: &Connection) -> Result<ChainVerification> {
    verify_chain_batched(conn, CHAIN_VERIFY_BATCH_SIZE)
}

pub fn verify_chain_batched(conn: &Connection, batch_size: usize) -> Result<ChainVerification> {
    let mut errors = Vec::new();
    let mut expected_previous = GENESIS_HASH.to_string();
    let mut entries_checked = 0i64;
    let mut last_seq = 0i64;

    loop {
        // Batch released at the end of each pass to cap memory on long chains
        let batch: Vec<AuditEntry> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_log WHERE sequence_number > ?1
                 ORDER BY sequence_number ASC LIMIT ?2",
                ENTRY_COLS
            ))?;
            let rows = stmt
                .query_map(params![last_seq, batch_size as i64], entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if batch.is_empty() {
            break;
        }

        for entry in &batch {
            if entry.previous_hash != expected_previous {
                errors.push(ChainError {
                    sequence_number: entry.sequence_number,
                    error: "previous_hash mismatch".to_string(),
                    expected: expected_previous.clone(),
                    actual: entry.previous_hash.clone(),
                });
            }

            // Recompute without user_id: it was added after hashing. Entries
            // that never carried one verify as-is.
            let mut verify_data = entry.event_data.clone();
            if let Value::Object(ref mut map) = verify_data {
                map.remove("user_id");
            }
            let recomputed = compute_entry_hash(
                entry.sequence_number,
                &entry.event_type,
                &verify_data,
                &entry.previous_hash,
                &entry.created_at,
            );

            if recomputed != entry.entry_hash {
                errors.push(ChainError {
                    sequence_number: entry.sequence_number,
                    error: "entry_hash mismatch".to_string(),
                    expected: recomputed,
                    actual: entry.entry_hash.clone(),
                });
            }

            expected_previous = entry.entry_hash.clone();
            entries_checked += 1;
        }

        last_seq = batch.last().map(|e| e.sequence_number).unwrap_or(last_seq);
    }

    Ok(ChainVerification {
        valid: errors.is_empty(),
        entries_checked,
        errors,
    })
}

/// Query the audit log, newest first. Returns (total, page).
pub fn list_entries(
    conn: &Connection,
    event_type: Option<&str>,
    video_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<(i64, Vec<AuditEntry>)> {
    let mut clauses = vec!["1=1".to_string()];
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(event_type) = event_type {
        values.push(rusqlite::types::Value::Text(event_type.to_string()));
        clauses.push(format!("event_type = ?{}", values.len()));
    }
    if let Some(video_id) = video_id {
        values.push(rusqlite::types::Value::Text(video_id.to_string()));
        clauses.push(format!("video_id = ?{}", values.len()));
    }
    let where_sql = clauses.join(" AND ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM audit_log WHERE {}", where_sql),
        rusqlite::params_from_iter(values.clone()),
        |row| row.get(0),
    )?;

    values.push(rusqlite::types::Value::Integer(limit));
    values.push(rusqlite::types::Value::Integer(offset));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM audit_log WHERE {} ORDER BY sequence_number DESC LIMIT ?{} OFFSET ?{}",
        ENTRY_COLS,
        where_sql,
        values.len() - 1,
        values.len()
    ))?;
    let entries = stmt
        .query_map(rusqlite::params_from_iter(values), entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((total, entries))
}

/// Full trail for one video, oldest first.
pub fn video_trail(conn: &Connection, video_id: &str) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM audit_log WHERE video_id = ?1 ORDER BY sequence_number ASC",
        ENTRY_COLS
    ))?;
    let entries = stmt
        .query_map(params![video_id], entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_canonical_json_matches_python_dumps() {
        let value = json!({"b": 1, "a": [1, 2], "nested": {"z": true, "y": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a": [1, 2], "b": 1, "nested": {"y": null, "z": true}}"#
        );
    }

    #[test]
    fn test_hash_determinism() {
        let data = json!({"file_hash": "ab", "source": "live"});
        let h1 = compute_entry_hash(1, "upload", &data, GENESIS_HASH, "2026-01-01T00:00:00.000000");
        let h2 = compute_entry_hash(1, "upload", &data, GENESIS_HASH, "2026-01-01T00:00:00.000000");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let conn = test_conn();
        let result = verify_chain(&conn).unwrap();
        assert!(result.valid);
        assert_eq!(result.entries_checked, 0);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_chain_links_and_sequences() {
        let mut conn = test_conn();
        for i in 0..10 {
            log_event(&mut conn, "test_event", json!({"index": i}), EventRefs::default()).unwrap();
        }
        let result = verify_chain(&conn).unwrap();
        assert!(result.valid);
        assert_eq!(result.entries_checked, 10);

        // Sequences are exactly 1..=10
        let seqs: Vec<i64> = {
            let mut stmt = conn
                .prepare("SELECT sequence_number FROM audit_log ORDER BY sequence_number")
                .unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<rusqlite::Result<Vec<_>>>()
                .unwrap()
        };
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());

        let first: String = conn
            .query_row(
                "SELECT previous_hash FROM audit_log WHERE sequence_number = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(first, GENESIS_HASH);
    }

    #[test]
    fn test_batched_verification_spans_batches() {
        let mut conn = test_conn();
        for i in 0..25 {
            log_event(&mut conn, "bulk_event", json!({"i": i}), EventRefs::default()).unwrap();
        }
        let result = verify_chain_batched(&conn, 10).unwrap();
        assert!(result.valid);
        assert_eq!(result.entries_checked, 25);
    }

    #[test]
    fn test_tampered_entry_detected() {
        let mut conn = test_conn();
        for i in 0..10 {
            log_event(&mut conn, "test_event", json!({"index": i}), EventRefs::default()).unwrap();
        }

        conn.execute(
            "UPDATE audit_log SET event_data = ?1 WHERE sequence_number = 3",
            params![r#"{"tampered": true}"#],
        )
        .unwrap();

        let result = verify_chain(&conn).unwrap();
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.sequence_number == 3 && e.error == "entry_hash mismatch"));
        // The mechanical previous_hash links of later entries still match
        assert!(!result.errors.iter().any(|e| e.sequence_number > 3));
    }

    #[test]
    fn test_user_id_splice_outside_hash() {
        let mut conn = test_conn();
        let entry = log_event(
            &mut conn,
            "user_created",
            json!({"username": "casey"}),
            EventRefs {
                user_id: Some("admin-uuid"),
                ..Default::default()
            },
        )
        .unwrap();

        // Stored event_data carries user_id for traceability
        assert_eq!(entry.event_data["user_id"], "admin-uuid");

        // And the chain still verifies, because verification strips it
        let result = verify_chain(&conn).unwrap();
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn test_concurrent_appends_unique_sequences() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.db");
        {
            let conn = crate::db::open_connection(&path).unwrap();
            run_migrations(&conn).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..4 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut conn = crate::db::open_connection(&path).unwrap();
                for i in 0..10 {
                    log_event(
                        &mut conn,
                        "concurrent",
                        json!({"thread": t, "i": i}),
                        EventRefs::default(),
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let conn = crate::db::open_connection(&path).unwrap();
        let result = verify_chain(&conn).unwrap();
        assert!(result.valid, "errors: {:?}", result.errors);
        assert_eq!(result.entries_checked, 40);

        let distinct: i64 = conn
            .query_row("SELECT COUNT(DISTINCT sequence_number) FROM audit_log", [], |r| {
                r.get(0)
            })
            .unwrap();
        let max: i64 = conn
            .query_row("SELECT MAX(sequence_number) FROM audit_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(distinct, 40);
        assert_eq!(max, 40);
    }
}
