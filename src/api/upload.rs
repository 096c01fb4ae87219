// Signed upload and admin bulk upload.
//
// The request body streams through a spooled buffer in fixed-size chunks
// while the SHA-256 runs, so memory stays bounded at one chunk no matter the
// file size. Verification never rejects media outright: bad signatures are
// stored and tagged truthfully so curators can still examine them.

use std::io::{Seek, SeekFrom, Write};

use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::SpooledTempFile;

use crate::audit::{self, canonical_json, EventRefs};
use crate::constants::{
    PHOTO_EXTENSIONS, SPOOL_THRESHOLD, STATUS_ERROR_MVP, STATUS_FAILED, STATUS_SIGNED_UPLOAD,
    STATUS_UNVERIFIED, STATUS_VERIFIED, STATUS_VERIFIED_MVP,
};
use crate::crypto::{is_mvp_key, normalize_pem, verify_ecdsa_signature, VerifyError};
use crate::db::schema::{self, NewVideo};
use crate::db::{parse_client_timestamp, to_iso};
use crate::error::{OtError, Result};
use crate::storage::object_name_for;

use super::{Admin, ApiState};

/// One multipart file field drained into a spooled buffer with a running
/// SHA-256. Holds at most one chunk in memory; larger bodies spill to disk.
struct StreamedFile {
    buffer: SpooledTempFile,
    sha256_hex: String,
    size: u64,
    filename: String,
    content_type: Option<String>,
}

async fn drain_field(field: &mut axum::extract::multipart::Field<'_>) -> Result<StreamedFile> {
    let filename = field.file_name().unwrap_or("upload.bin").to_string();
    let content_type = field.content_type().map(str::to_string);

    let mut buffer = SpooledTempFile::new(SPOOL_THRESHOLD);
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| OtError::Validation(format!("Upload stream error: {}", e)))?
    {
        hasher.update(&chunk);
        buffer.write_all(&chunk)?;
        size += chunk.len() as u64;
    }

    Ok(StreamedFile {
        buffer,
        sha256_hex: hex::encode(hasher.finalize()),
        size,
        filename,
        content_type,
    })
}

fn required_str<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| OtError::Validation(format!("Missing required field: {}", key)))
}

/// Upload a video/photo with cryptographic verification.
///
/// The metadata part carries the signed envelope:
/// {version, auth: {device_id, public_key_pem},
///  payload: {video_hash, timestamp, location, incident_tags, source, ...},
///  signed_payload?, signature}
pub async fn upload_media(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut metadata_raw: Option<String> = None;
    let mut file: Option<StreamedFile> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| OtError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("metadata") => {
                metadata_raw = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| OtError::Validation(format!("Bad metadata field: {}", e)))?,
                );
            }
            Some("video") | Some("file") => {
                file = Some(drain_field(&mut field).await?);
            }
            _ => {}
        }
    }

    let metadata_raw =
        metadata_raw.ok_or_else(|| OtError::Validation("Missing required field: metadata".into()))?;
    let mut file =
        file.ok_or_else(|| OtError::Validation("Missing required field: video".into()))?;

    let envelope: Value = serde_json::from_str(&metadata_raw)
        .map_err(|e| OtError::Validation(format!("Invalid metadata JSON: {}", e)))?;

    let auth = envelope
        .get("auth")
        .ok_or_else(|| OtError::Validation("Missing required field: auth".into()))?;
    let device_id = required_str(auth, "device_id")?.to_string();
    let public_key_pem = required_str(auth, "public_key_pem")?.to_string();
    let payload = envelope
        .get("payload")
        .cloned()
        .ok_or_else(|| OtError::Validation("Missing required field: payload".into()))?;
    let signature_b64 = required_str(&envelope, "signature")?.to_string();

    // Step 1: device must be registered
    let device = {
        let device_id = device_id.clone();
        state
            .db
            .call(move |conn| schema::get_device(conn, &device_id))
            .await?
    };
    let device = match device {
        Some(d) => d,
        None => {
            log::error!("Upload rejected: Device not registered - {}", device_id);
            return Err(OtError::Forbidden(format!(
                "Device not registered: {}",
                device_id
            )));
        }
    };

    // Step 2: provided key must match the registered key byte-for-byte after
    // newline normalisation
    if normalize_pem(&device.public_key_pem) != normalize_pem(&public_key_pem) {
        log::warn!("Public key mismatch for device {}", device_id);
        return Err(OtError::Forbidden("Public key mismatch".to_string()));
    }

    // Step 3 happened during streaming. Step 4: hash must match the envelope.
    let expected_hash = required_str(&payload, "video_hash")?;
    if file.sha256_hex != expected_hash {
        return Err(OtError::Validation(format!(
            "File hash mismatch. Expected: {}, Got: {}",
            expected_hash, file.sha256_hex
        )));
    }

    // Step 5: signature verification. The device signed either the exact
    // signed_payload bytes or, for older clients, canonical-JSON of payload.
    let signed_bytes = envelope
        .get("signed_payload")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| canonical_json(&payload));
    let source = payload
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let mut verification_status = if is_mvp_key(&public_key_pem) {
        log::info!("MVP signature accepted for device: {}", device_id);
        STATUS_VERIFIED_MVP
    } else {
        match verify_ecdsa_signature(
            &normalize_pem(&public_key_pem),
            signed_bytes.as_bytes(),
            &signature_b64,
        ) {
            Ok(()) => {
                log::info!("ECDSA signature verified for device: {}", device_id);
                if source == "upload" {
                    STATUS_SIGNED_UPLOAD
                } else {
                    STATUS_VERIFIED
                }
            }
            Err(VerifyError::Invalid) => {
                log::warn!("Signature verification failed for device: {}", device_id);
                STATUS_FAILED
            }
            Err(VerifyError::Other(e)) => {
                log::error!("Signature verification error: {}", e);
                STATUS_ERROR_MVP
            }
        }
    };

    // Imported MVP media is provenance-weaker than live capture
    if source == "upload" && verification_status == STATUS_VERIFIED_MVP {
        verification_status = STATUS_SIGNED_UPLOAD;
    }

    // Step 6: stream the buffered body into the object store. The blob lands
    // before the row so an aborted request can only orphan a blob, never
    // strand a row without one.
    let media_type = payload
        .get("media_type")
        .and_then(Value::as_str)
        .unwrap_or("video")
        .to_string();
    let object_name = object_name_for(&media_type, &device_id, &file.filename);

    file.buffer.seek(SeekFrom::Start(0))?;
    state
        .storage
        .put_spooled(&object_name, &mut file.buffer, file.size)
        .await?;
    log::info!("Media uploaded to object store: {}", object_name);

    // Step 7: persist the media record
    let timestamp = to_iso(parse_client_timestamp(required_str(&payload, "timestamp")?)?);
    let location = payload.get("location");
    let latitude = location.and_then(|l| l.get("lat")).and_then(Value::as_f64);
    let longitude = location.and_then(|l| l.get("lon")).and_then(Value::as_f64);
    let incident_tags: Vec<String> = payload
        .get("incident_tags")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let new_video = NewVideo {
        device_id: device_id.clone(),
        object_name: object_name.clone(),
        file_hash: file.sha256_hex.clone(),
        timestamp,
        latitude,
        longitude,
        incident_tags,
        source: Some(source.clone()),
        media_type: media_type.clone(),
        exif_metadata: payload.get("exif_metadata").cloned().filter(|v| !v.is_null()),
        verification_status: verification_status.to_string(),
        metadata_json: envelope.clone(),
    };

    let status_for_audit = verification_status.to_string();
    let file_hash = file.sha256_hex.clone();
    let audit_device_id = device_id.clone();
    let audit_media_type = media_type.clone();
    let audit_source = source.clone();
    let video_id = state
        .db
        .call(move |conn| {
            let video_id = schema::insert_video(conn, &new_video)?;
            schema::touch_device_last_upload(conn, &audit_device_id)?;

            // Step 8: audit entry
            audit::log_event(
                conn,
                "upload",
                json!({
                    "file_hash": file_hash,
                    "source": audit_source,
                    "media_type": audit_media_type,
                    "verification_status": status_for_audit,
                }),
                EventRefs {
                    video_id: Some(&video_id),
                    device_id: Some(&audit_device_id),
                    ..Default::default()
                },
            )?;
            Ok(video_id)
        })
        .await?;

    log::info!("Video record created with ID: {}", video_id);

    // Step 9: notify the bridge for AI indexing. Photos skip the hook.
    if media_type == "video" {
        super::notify_bridge(&state, &video_id, &object_name).await;
    }

    Ok(Json(json!({
        "status": "success",
        "video_id": video_id,
        "verification_status": verification_status,
        "message": "Media uploaded and processed successfully",
    })))
}

/// Determine if a file is a video or photo based on name/content-type.
fn detect_media_type(filename: &str, content_type: Option<&str>) -> &'static str {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if PHOTO_EXTENSIONS.contains(&ext.as_str())
        || content_type.map(|c| c.starts_with("image/")).unwrap_or(false)
    {
        "photo"
    } else {
        "video"
    }
}

/// Admin bulk upload. Every file lands as `unverified` with source
/// `bulk-upload`; EXIF GPS and DateTime override the envelope when present.
/// Per-file outcomes are independent.
pub async fn bulk_upload(
    Admin(admin): Admin,
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut results: Vec<Value> = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| OtError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some("files") {
            continue;
        }

        let outcome = process_bulk_file(&state, &admin, &mut field).await;
        match outcome {
            Ok(record) => results.push(record),
            Err((filename, e)) => {
                log::error!("Bulk upload error for {}: {}", filename, e);
                results.push(json!({
                    "filename": filename,
                    "status": "error",
                    "detail": e.to_string(),
                }));
            }
        }
    }

    let succeeded = results
        .iter()
        .filter(|r| r["status"] == "success")
        .count();
    let failed = results.len() - succeeded;
    let status = if failed == 0 {
        "success"
    } else if succeeded > 0 {
        "partial"
    } else {
        "error"
    };

    Ok(Json(json!({
        "status": status,
        "total": results.len(),
        "succeeded": succeeded,
        "failed": failed,
        "results": results,
    })))
}

async fn process_bulk_file(
    state: &ApiState,
    admin: &schema::User,
    field: &mut axum::extract::multipart::Field<'_>,
) -> std::result::Result<Value, (String, OtError)> {
    let mut file = drain_field(field)
        .await
        .map_err(|e| ("<stream>".to_string(), e))?;
    let filename = file.filename.clone();
    let fail = |e: OtError| (filename.clone(), e);

    if file.size == 0 {
        return Ok(json!({
            "filename": filename,
            "status": "error",
            "detail": "Empty file",
        }));
    }

    let media_type = detect_media_type(&file.filename, file.content_type.as_deref()).to_string();

    // EXIF wins over anything the operator typed in
    file.buffer.seek(SeekFrom::Start(0)).map_err(|e| fail(e.into()))?;
    let exif = crate::exif::extract(&mut file.buffer);

    let timestamp = match exif.datetime {
        Some(dt) => to_iso(dt),
        None => crate::db::now_iso(),
    };

    let object_name = object_name_for(&media_type, "bulk", &file.filename);
    file.buffer.seek(SeekFrom::Start(0)).map_err(|e| fail(e.into()))?;
    state
        .storage
        .put_spooled(&object_name, &mut file.buffer, file.size)
        .await
        .map_err(fail)?;

    let has_exif_location = exif.has_location();
    let new_video = NewVideo {
        device_id: "bulk-upload".to_string(),
        object_name: object_name.clone(),
        file_hash: file.sha256_hex.clone(),
        timestamp,
        latitude: exif.lat,
        longitude: exif.lon,
        incident_tags: Vec::new(),
        source: Some("bulk-upload".to_string()),
        media_type: media_type.clone(),
        exif_metadata: exif.raw.clone(),
        verification_status: STATUS_UNVERIFIED.to_string(),
        metadata_json: json!({
            "source": "bulk-upload",
            "uploaded_by": admin.username,
            "original_filename": filename,
            "exif_location": if has_exif_location {
                json!({ "lat": exif.lat, "lon": exif.lon })
            } else {
                Value::Null
            },
        }),
    };

    let file_hash = file.sha256_hex.clone();
    let admin_id = admin.id.clone();
    let audit_filename = filename.clone();
    let audit_media_type = media_type.clone();
    let video_id = state
        .db
        .call(move |conn| {
            let video_id = schema::insert_video(conn, &new_video)?;
            audit::log_event(
                conn,
                "bulk_upload",
                json!({
                    "file_hash": file_hash,
                    "media_type": audit_media_type,
                    "original_filename": audit_filename,
                    "verification_status": STATUS_UNVERIFIED,
                    "has_exif_location": has_exif_location,
                }),
                EventRefs {
                    video_id: Some(&video_id),
                    user_id: Some(&admin_id),
                    ..Default::default()
                },
            )?;
            Ok(video_id)
        })
        .await
        .map_err(fail)?;

    // Bulk-uploaded photos are indexed too
    super::notify_bridge(state, &video_id, &object_name).await;

    log::info!(
        "Bulk upload: {} -> {} ({}, exif={})",
        filename,
        video_id,
        media_type,
        if exif.raw.is_some() { "yes" } else { "no" }
    );

    Ok(json!({
        "filename": filename,
        "status": "success",
        "video_id": video_id,
        "media_type": media_type,
        "verification_status": STATUS_UNVERIFIED,
        "has_exif": exif.raw.is_some(),
        "location": { "lat": exif.lat, "lon": exif.lon },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_media_type_by_extension() {
        assert_eq!(detect_media_type("a.JPG", None), "photo");
        assert_eq!(detect_media_type("a.heic", None), "photo");
        assert_eq!(detect_media_type("a.mp4", None), "video");
        assert_eq!(detect_media_type("a.mov", Some("video/quicktime")), "video");
    }

    #[test]
    fn test_detect_media_type_by_content_type() {
        assert_eq!(detect_media_type("noext", Some("image/png")), "photo");
        assert_eq!(detect_media_type("noext", Some("video/mp4")), "video");
    }

    #[test]
    fn test_required_str_missing_field() {
        let payload = json!({ "present": "x" });
        assert!(required_str(&payload, "present").is_ok());
        let err = required_str(&payload, "video_hash").unwrap_err();
        assert!(err.to_string().contains("video_hash"));
    }
}
