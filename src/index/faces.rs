// Face detection, embedding, thumbnails, and incremental cluster assignment.

use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use rusqlite::Connection;

use crate::config::Settings;
use crate::constants::{FACE_EMBEDDING_DIM, FACE_THUMB_JPEG_QUALITY, FACE_THUMB_SIZE};
use crate::db::schema;
use crate::error::{OtError, Result};
use crate::index::frames::ExtractedFrame;
use crate::models::FaceDetector;
use crate::vector::{decode_blob, dot, encode_blob, l2_normalize};

#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub frame_num: i64,
    pub timestamp_ms: i64,
    pub bbox: (i64, i64, i64, i64),
    pub score: f64,
    pub embedding: Vec<f32>,
    pub thumbnail_name: Option<String>,
}

/// Clamp a detector bbox to image bounds and drop it if it shrinks below the
/// minimum usable size.
pub fn clamp_bbox(
    bbox: [f32; 4],
    width: u32,
    height: u32,
    min_size: u32,
) -> Option<(i64, i64, i64, i64)> {
    let x1 = (bbox[0].max(0.0) as i64).min(width as i64);
    let y1 = (bbox[1].max(0.0) as i64).min(height as i64);
    let x2 = (bbox[2].max(0.0) as i64).min(width as i64);
    let y2 = (bbox[3].max(0.0) as i64).min(height as i64);
    if x2 - x1 < min_size as i64 || y2 - y1 < min_size as i64 {
        return None;
    }
    Some((x1, y1, x2, y2))
}

fn save_face_thumbnail(
    frame_jpeg: &[u8],
    bbox: (i64, i64, i64, i64),
    out_path: &Path,
) -> Result<()> {
    let img = image::load_from_memory(frame_jpeg)
        .map_err(|e| OtError::Internal(format!("frame decode failed: {}", e)))?;
    let (x1, y1, x2, y2) = bbox;
    let crop = img.crop_imm(
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    );
    let thumb = crop.resize_exact(FACE_THUMB_SIZE, FACE_THUMB_SIZE, FilterType::Lanczos3);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, FACE_THUMB_JPEG_QUALITY);
    thumb
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| OtError::Internal(format!("thumbnail encode failed: {}", e)))?;
    std::fs::write(out_path, out)?;
    Ok(())
}

/// Run the detector over extracted frames. Keeps detections above the
/// confidence floor and minimum pixel size, normalises embeddings, and saves
/// a cropped thumbnail per face.
pub async fn detect_faces(
    detector: Arc<dyn FaceDetector>,
    frames: &[ExtractedFrame],
    video_id: &str,
    settings: &Settings,
) -> Result<Vec<FaceObservation>> {
    let thumb_dir = settings.face_thumbnail_dir.join(video_id);
    let mut observations = Vec::new();

    for frame in frames {
        let faces = match detector.detect(&frame.jpeg).await {
            Ok(faces) => faces,
            Err(e) => {
                log::warn!("Face detection failed for frame {}: {}", frame.frame_num, e);
                continue;
            }
        };

        for (i, face) in faces.into_iter().enumerate() {
            if face.score < settings.face_detection_threshold {
                continue;
            }
            let Some(bbox) =
                clamp_bbox(face.bbox, frame.width, frame.height, settings.face_min_size)
            else {
                continue;
            };
            if face.embedding.len() != FACE_EMBEDDING_DIM {
                log::warn!(
                    "Detector returned {}-dim face embedding, expected {}",
                    face.embedding.len(),
                    FACE_EMBEDDING_DIM
                );
                continue;
            }

            let mut embedding = face.embedding;
            l2_normalize(&mut embedding);

            let thumb_name = format!("{}_{}.jpg", frame.timestamp_ms, i);
            let thumbnail_name =
                match save_face_thumbnail(&frame.jpeg, bbox, &thumb_dir.join(&thumb_name)) {
                    Ok(()) => Some(thumb_name),
                    Err(e) => {
                        log::warn!("Failed to save face thumbnail: {}", e);
                        None
                    }
                };

            observations.push(FaceObservation {
                frame_num: frame.frame_num,
                timestamp_ms: frame.timestamp_ms,
                bbox,
                score: face.score as f64,
                embedding,
                thumbnail_name,
            });
        }
    }

    log::info!(
        "Detected {} faces in {} frames for {}",
        observations.len(),
        frames.len(),
        video_id
    );
    Ok(observations)
}

pub fn store_observations(
    conn: &Connection,
    video_id: &str,
    observations: &[FaceObservation],
) -> Result<usize> {
    for obs in observations {
        schema::insert_face_detection(
            conn,
            video_id,
            obs.frame_num,
            obs.timestamp_ms,
            obs.bbox,
            obs.score,
            &encode_blob(&obs.embedding),
            obs.thumbnail_name.as_deref(),
        )?;
    }
    Ok(observations.len())
}

/// Pick the nearest centroid by cosine similarity. Returns the cluster id if
/// the best match clears the similarity threshold (expressed as a distance:
/// similarity must exceed 1 - threshold).
pub fn nearest_cluster(
    embedding: &[f32],
    centroids: &[(i64, Vec<f32>)],
    distance_threshold: f32,
) -> Option<i64> {
    let mut best: Option<(i64, f32)> = None;
    for (cluster_id, centroid) in centroids {
        let similarity = dot(embedding, centroid);
        if best.map(|(_, s)| similarity > s).unwrap_or(true) {
            best = Some((*cluster_id, similarity));
        }
    }
    best.and_then(|(cluster_id, similarity)| {
        (similarity > 1.0 - distance_threshold).then_some(cluster_id)
    })
}

/// Assign this video's unassigned faces to existing clusters by nearest
/// centroid. Faces with no close-enough cluster stay unassigned until the
/// next full re-cluster.
pub fn assign_faces_incremental(
    conn: &Connection,
    video_id: &str,
    distance_threshold: f32,
) -> Result<usize> {
    let unassigned = schema::unassigned_faces_for_video(conn, video_id)?;
    if unassigned.is_empty() {
        return Ok(0);
    }

    let centroids: Vec<(i64, Vec<f32>)> = schema::cluster_centroids(conn)?
        .into_iter()
        .filter_map(|(id, blob)| {
            decode_blob(&blob).ok().map(|mut v| {
                l2_normalize(&mut v);
                (id, v)
            })
        })
        .collect();
    if centroids.is_empty() {
        log::info!(
            "No existing clusters - skipping incremental assignment for {}",
            video_id
        );
        return Ok(0);
    }

    let mut assigned = 0usize;
    for (face_id, blob) in &unassigned {
        let mut embedding = decode_blob(blob)?;
        l2_normalize(&mut embedding);
        if let Some(cluster_id) = nearest_cluster(&embedding, &centroids, distance_threshold) {
            schema::set_face_cluster(conn, *face_id, Some(cluster_id))?;
            assigned += 1;
        }
    }

    if assigned > 0 {
        schema::refresh_cluster_counts(conn)?;
    }

    log::info!(
        "Incremental assignment: {}/{} faces assigned for {}",
        assigned,
        unassigned.len(),
        video_id
    );
    Ok(assigned)
}
