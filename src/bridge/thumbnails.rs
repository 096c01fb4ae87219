// Thumbnail serving with nearest-timestamp fallback.
//
// Frame timestamps drift from AI-indexed timestamps by up to a second, so an
// exact miss falls back to the closest available thumbnail. That fallback is
// a feature, not a bug.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::error::{OtError, Result};

use super::BridgeState;

fn parse_ids(video_id: &str, filename: &str) -> Result<(String, i64)> {
    // UUID validation doubles as path-traversal protection
    let video_id = Uuid::parse_str(video_id)
        .map(|u| u.to_string())
        .map_err(|_| OtError::Validation("Invalid video_id format".to_string()))?;
    let timestamp_ms: i64 = filename
        .strip_suffix(".jpg")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| OtError::NotFound("Thumbnail not found".to_string()))?;
    Ok((video_id, timestamp_ms))
}

/// Find `<dir>/<timestamp_ms>.jpg`, or the nearest `<ts>.jpg` in the same
/// directory.
fn find_nearest(dir: &FsPath, timestamp_ms: i64) -> Option<PathBuf> {
    let exact = dir.join(format!("{}.jpg", timestamp_ms));
    if exact.exists() {
        return Some(exact);
    }

    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(i64, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(ts) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".jpg"))
            .and_then(|n| n.parse::<i64>().ok())
        else {
            continue;
        };
        let distance = (ts - timestamp_ms).abs();
        if best.as_ref().map(|(d, _)| distance < *d).unwrap_or(true) {
            best = Some((distance, path));
        }
    }
    best.map(|(_, path)| path)
}

async fn serve_jpeg(path: PathBuf) -> Result<Response> {
    let bytes = tokio::fs::read(&path).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response())
}

/// Frame thumbnail for a video at (approximately) a timestamp.
pub async fn get_thumbnail(
    State(state): State<BridgeState>,
    Path((video_id, filename)): Path<(String, String)>,
) -> Result<Response> {
    let (video_id, timestamp_ms) = parse_ids(&video_id, &filename)?;
    let dir = state.settings.thumbnail_dir.join(&video_id);
    let path = find_nearest(&dir, timestamp_ms)
        .ok_or_else(|| OtError::NotFound("Thumbnail not found".to_string()))?;
    serve_jpeg(path).await
}

/// Cropped face thumbnail. Face files are named `<ts>_<idx>.jpg`, so the
/// lookup is exact.
pub async fn get_face_thumbnail(
    State(state): State<BridgeState>,
    Path((video_id, filename)): Path<(String, String)>,
) -> Result<Response> {
    let video_id = Uuid::parse_str(&video_id)
        .map(|u| u.to_string())
        .map_err(|_| OtError::Validation("Invalid video_id format".to_string()))?;
    if !filename.ends_with(".jpg") || filename.contains(['/', '\\']) {
        return Err(OtError::NotFound("Thumbnail not found".to_string()));
    }

    let path = state.settings.face_thumbnail_dir.join(&video_id).join(&filename);
    if !path.exists() {
        return Err(OtError::NotFound("Thumbnail not found".to_string()));
    }
    serve_jpeg(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids_rejects_traversal() {
        assert!(parse_ids("../../etc", "1000.jpg").is_err());
        assert!(parse_ids("7c9e6679-7425-40de-944b-e07fc1f90ae7", "x.jpg").is_err());
        let (vid, ts) = parse_ids("7c9e6679-7425-40de-944b-e07fc1f90ae7", "1500.jpg").unwrap();
        assert_eq!(vid, "7c9e6679-7425-40de-944b-e07fc1f90ae7");
        assert_eq!(ts, 1500);
    }

    #[test]
    fn test_find_nearest_prefers_exact_then_closest() {
        let dir = tempfile::TempDir::new().unwrap();
        for ts in [0i64, 2000, 4000] {
            std::fs::write(dir.path().join(format!("{}.jpg", ts)), b"jpeg").unwrap();
        }

        let exact = find_nearest(dir.path(), 2000).unwrap();
        assert!(exact.ends_with("2000.jpg"));

        // 2900 is closer to 2000 than 4000
        let near = find_nearest(dir.path(), 2900).unwrap();
        assert!(near.ends_with("2000.jpg"));

        let near = find_nearest(dir.path(), 3200).unwrap();
        assert!(near.ends_with("4000.jpg"));
    }

    #[test]
    fn test_find_nearest_empty_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(find_nearest(dir.path(), 1000).is_none());
    }
}
