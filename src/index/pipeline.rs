// Per-video indexing pipeline.
//
// Each modality flushes per batch in its own transaction: a crash mid-run
// leaves a partial but consistent set of embedding rows that the fix path
// can complete. Model forward passes go through the shared per-model locks;
// decode and transcription work runs on blocking threads.

use std::path::PathBuf;
use std::sync::Arc;

use image::imageops::FilterType;

use crate::config::Settings;
use crate::db::schema::{self, IndexJob};
use crate::db::Db;
use crate::error::{OtError, Result};
use crate::index::actions::{self, ClipWindow};
use crate::index::captions;
use crate::index::faces;
use crate::index::frames::{self, ExtractedFrame};
use crate::models::Models;
use crate::storage::ObjectStorage;
use crate::vector::{encode_blob, mean_pool};

const THUMBNAIL_MAX_WIDTH: u32 = 480;

/// Which pipeline stages to run for a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageSet {
    pub visual: bool,
    pub transcript: bool,
    pub captions: bool,
    pub clips: bool,
    pub actions: bool,
    pub faces: bool,
}

impl StageSet {
    /// Full index: every enabled modality.
    pub fn full(settings: &Settings) -> Self {
        StageSet {
            visual: true,
            transcript: true,
            captions: settings.caption_enabled,
            clips: settings.clip_enabled,
            actions: settings.clip_enabled && settings.caption_enabled,
            faces: settings.face_enabled,
        }
    }

    /// Visual-only reindex: frames, clips and actions all depend on the
    /// vision model; captions and transcripts are preserved.
    pub fn visual_only(settings: &Settings) -> Self {
        StageSet {
            visual: true,
            clips: settings.clip_enabled,
            actions: settings.clip_enabled && settings.caption_enabled,
            ..Default::default()
        }
    }

    /// Fix mode: inspect which modality tables are empty for this video and
    /// enable only the missing stages. Deletes nothing.
    pub fn fix(conn: &rusqlite::Connection, video_id: &str, settings: &Settings) -> Result<Self> {
        let empty = |table: &str| -> Result<bool> {
            Ok(schema::count_embeddings_for_video(conn, table, video_id)? == 0)
        };
        Ok(StageSet {
            visual: empty("frame_embeddings")?,
            transcript: empty("transcript_embeddings")?,
            captions: settings.caption_enabled && empty("caption_embeddings")?,
            clips: settings.clip_enabled && empty("clip_embeddings")?,
            actions: settings.clip_enabled
                && settings.caption_enabled
                && empty("action_embeddings")?,
            faces: settings.face_enabled && empty("face_detections")?,
        })
    }

    pub fn any(&self) -> bool {
        self.visual || self.transcript || self.captions || self.clips || self.actions || self.faces
    }
}

pub struct PipelineContext {
    pub db: Db,
    pub storage: Arc<ObjectStorage>,
    pub models: Arc<Models>,
    pub settings: Arc<Settings>,
}

/// Run the indexing pipeline for one claimed job. The caller owns job status
/// transitions; an Err here becomes `failed` with the message truncated onto
/// the job row. The downloaded temp file is always removed.
pub async fn index_video(ctx: &PipelineContext, job: &IndexJob, stages: StageSet) -> Result<()> {
    let local_path = ctx
        .storage
        .download_to_temp(&job.object_name, &job.video_id, &ctx.settings.temp_dir)
        .await?;

    let result = run_stages(ctx, job, stages, &local_path).await;

    if let Err(e) = tokio::fs::remove_file(&local_path).await {
        log::warn!("Failed to remove temp file {}: {}", local_path.display(), e);
    } else {
        log::info!("Cleaned up temp file: {}", local_path.display());
    }

    result
}

async fn run_stages(
    ctx: &PipelineContext,
    job: &IndexJob,
    stages: StageSet,
    local_path: &PathBuf,
) -> Result<()> {
    let video_id = job.video_id.clone();

    // Interval frames are shared by the visual, caption, and face stages;
    // extract them once, lazily.
    let mut interval_frames: Option<Arc<Vec<ExtractedFrame>>> = None;

    // A. Visual embeddings
    if stages.visual {
        log::info!("Extracting frames for {}", video_id);
        let frames = extract_interval_cached(ctx, local_path, &video_id, true).await?;
        interval_frames = Some(frames.clone());

        for chunk in frames.chunks(ctx.settings.batch_size.max(1)) {
            let jpegs: Vec<Vec<u8>> = chunk.iter().map(|f| f.jpeg.clone()).collect();
            let embeddings = ctx.models.encode_images(&jpegs).await?;

            let rows: Vec<(i64, i64, Vec<u8>)> = chunk
                .iter()
                .zip(embeddings.iter())
                .map(|(f, e)| (f.frame_num, f.timestamp_ms, encode_blob(e)))
                .collect();
            let vid = video_id.clone();
            ctx.db
                .call(move |conn| {
                    for (frame_num, timestamp_ms, blob) in &rows {
                        schema::insert_frame_embedding(conn, &vid, *frame_num, *timestamp_ms, blob)?;
                    }
                    Ok(())
                })
                .await?;
        }

        let count = update_modality(ctx, &video_id, "frame_embeddings", "visual_indexed", "frame_count").await?;
        log::info!("Indexed {} frames for {}", count, video_id);
    } else if stages.captions || stages.faces {
        interval_frames = Some(extract_interval_cached(ctx, local_path, &video_id, false).await?);
    }

    // B. Transcription + transcript embeddings
    if stages.transcript {
        let transcriber = Arc::clone(&ctx.models.transcriber);
        let path = local_path.clone();
        let segments = tokio::task::spawn_blocking(move || transcriber.transcribe(&path))
            .await
            .map_err(|e| OtError::Internal(format!("transcription panicked: {}", e)))??;

        // Centisecond ticks from the binding; milliseconds in the store
        let segments: Vec<(String, i64, i64)> = segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| (s.text.trim().to_string(), s.t0_cs * 10, s.t1_cs * 10))
            .collect();
        log::info!("Transcribed {} segments for {}", segments.len(), video_id);

        for chunk in segments.chunks(ctx.settings.batch_size.max(1)) {
            let texts: Vec<String> = chunk.iter().map(|(t, _, _)| t.clone()).collect();
            let embeddings = ctx.models.encode_texts(&texts).await?;

            let rows: Vec<(String, i64, i64, Vec<u8>)> = chunk
                .iter()
                .zip(embeddings.iter())
                .map(|((t, s, e), emb)| (t.clone(), *s, *e, encode_blob(emb)))
                .collect();
            let vid = video_id.clone();
            ctx.db
                .call(move |conn| {
                    for (text, start_ms, end_ms, blob) in &rows {
                        schema::insert_transcript_embedding(conn, &vid, text, *start_ms, *end_ms, blob)?;
                    }
                    Ok(())
                })
                .await?;
        }

        update_modality(ctx, &video_id, "transcript_embeddings", "transcript_indexed", "segment_count").await?;
    }

    // C. Frame captions + caption embeddings
    if stages.captions {
        if let Some(captioner) = ctx.models.captioner.clone() {
            let frames = interval_frames
                .clone()
                .expect("frames extracted for caption stage");
            let frame_captions = captions::caption_frames(
                captioner,
                &frames,
                &ctx.settings.caption_prompt,
                ctx.settings.caption_batch_size,
            )
            .await?;
            log::info!("Captioned {} frames for {}", frame_captions.len(), video_id);

            for chunk in frame_captions.chunks(ctx.settings.batch_size.max(1)) {
                let texts: Vec<String> = chunk.iter().map(|c| c.text.clone()).collect();
                let embeddings = ctx.models.encode_texts(&texts).await?;

                let rows: Vec<(i64, i64, String, Vec<u8>)> = chunk
                    .iter()
                    .zip(embeddings.iter())
                    .map(|(c, e)| (c.frame_num, c.timestamp_ms, c.text.clone(), encode_blob(e)))
                    .collect();
                let vid = video_id.clone();
                ctx.db
                    .call(move |conn| {
                        for (frame_num, timestamp_ms, text, blob) in &rows {
                            schema::insert_caption_embedding(
                                conn, &vid, *frame_num, *timestamp_ms, text, blob,
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
            }

            update_modality(ctx, &video_id, "caption_embeddings", "caption_indexed", "caption_count").await?;
        }
    }

    // D. Clip windows (mean-pooled visual) and action captions
    if stages.clips || stages.actions {
        let path = local_path.clone();
        let clip_fps = ctx.settings.clip_fps;
        let clip_frames = tokio::task::spawn_blocking(move || {
            // Uniform resample, no dark-frame skip: windows must stay contiguous
            frames::extract_frames(&path, clip_fps, false)
        })
        .await
        .map_err(|e| OtError::Internal(format!("clip extraction panicked: {}", e)))??;

        let windows = actions::build_windows(
            &clip_frames,
            ctx.settings.clip_window_frames,
            ctx.settings.clip_window_stride,
        );
        log::info!(
            "Built {} clip windows over {} resampled frames for {}",
            windows.len(),
            clip_frames.len(),
            video_id
        );

        if stages.clips && !windows.is_empty() {
            index_clip_windows(ctx, &video_id, &clip_frames, &windows).await?;
            update_modality(ctx, &video_id, "clip_embeddings", "clip_indexed", "clip_count").await?;
        }

        if stages.actions && !windows.is_empty() {
            if let Some(captioner) = ctx.models.captioner.clone() {
                let action_captions = actions::caption_windows(
                    captioner,
                    &clip_frames,
                    &windows,
                    &ctx.settings.clip_action_prompt,
                )
                .await?;

                for chunk in action_captions.chunks(ctx.settings.batch_size.max(1)) {
                    let texts: Vec<String> = chunk.iter().map(|c| c.text.clone()).collect();
                    let embeddings = ctx.models.encode_texts(&texts).await?;

                    let rows: Vec<(ClipWindow, String, Vec<u8>)> = chunk
                        .iter()
                        .zip(embeddings.iter())
                        .map(|(c, e)| (c.window.clone(), c.text.clone(), encode_blob(e)))
                        .collect();
                    let vid = video_id.clone();
                    ctx.db
                        .call(move |conn| {
                            for (w, text, blob) in &rows {
                                schema::insert_action_embedding(
                                    conn,
                                    &vid,
                                    w.start_ms,
                                    w.end_ms,
                                    w.start_frame,
                                    w.end_frame,
                                    w.num_frames,
                                    text,
                                    blob,
                                )?;
                            }
                            Ok(())
                        })
                        .await?;
                }
            }
        }
    }

    // E. Faces: detect, embed, thumbnail, incremental cluster assignment
    if stages.faces {
        if let Some(detector) = ctx.models.face.clone() {
            let frames = interval_frames
                .clone()
                .expect("frames extracted for face stage");
            let observations =
                faces::detect_faces(detector, &frames, &video_id, &ctx.settings).await?;

            let vid = video_id.clone();
            let threshold = ctx.settings.face_similarity_threshold;
            ctx.db
                .call(move |conn| {
                    faces::store_observations(conn, &vid, &observations)?;
                    faces::assign_faces_incremental(conn, &vid, threshold)?;
                    Ok(())
                })
                .await?;
        }
    }

    Ok(())
}

/// Decode interval frames on a blocking thread, optionally writing frame
/// thumbnails as a side effect of the visual stage.
async fn extract_interval_cached(
    ctx: &PipelineContext,
    local_path: &PathBuf,
    video_id: &str,
    write_thumbs: bool,
) -> Result<Arc<Vec<ExtractedFrame>>> {
    let path = local_path.clone();
    let interval = ctx.settings.frame_interval_sec;
    let thumb_dir = ctx.settings.thumbnail_dir.join(video_id);

    let frames = tokio::task::spawn_blocking(move || -> Result<Vec<ExtractedFrame>> {
        let frames = frames::extract_interval_frames(&path, interval)?;
        if write_thumbs {
            for frame in &frames {
                if let Err(e) = write_thumbnail(frame, &thumb_dir) {
                    log::warn!("Thumbnail write failed: {}", e);
                }
            }
        }
        Ok(frames)
    })
    .await
    .map_err(|e| OtError::Internal(format!("frame extraction panicked: {}", e)))??;

    Ok(Arc::new(frames))
}

async fn index_clip_windows(
    ctx: &PipelineContext,
    video_id: &str,
    clip_frames: &[ExtractedFrame],
    windows: &[ClipWindow],
) -> Result<()> {
    // Windows overlap under stride < window, so encode each resampled frame
    // exactly once and pool by index.
    let mut frame_embeddings: Vec<Vec<f32>> = Vec::with_capacity(clip_frames.len());
    for chunk in clip_frames.chunks(ctx.settings.batch_size.max(1)) {
        let jpegs: Vec<Vec<u8>> = chunk.iter().map(|f| f.jpeg.clone()).collect();
        frame_embeddings.extend(ctx.models.encode_images(&jpegs).await?);
    }

    let rows: Vec<(ClipWindow, Vec<u8>)> = windows
        .iter()
        .filter_map(|w| {
            let member_vecs: Vec<Vec<f32>> =
                frame_embeddings[w.start_idx..=w.end_idx].to_vec();
            mean_pool(&member_vecs).map(|pooled| (w.clone(), encode_blob(&pooled)))
        })
        .collect();

    let vid = video_id.to_string();
    ctx.db
        .call(move |conn| {
            for (w, blob) in &rows {
                schema::insert_clip_embedding(
                    conn,
                    &vid,
                    w.start_ms,
                    w.end_ms,
                    w.start_frame,
                    w.end_frame,
                    w.num_frames,
                    blob,
                )?;
            }
            Ok(())
        })
        .await?;
    Ok(())
}

async fn update_modality(
    ctx: &PipelineContext,
    video_id: &str,
    table: &'static str,
    flag_col: &'static str,
    count_col: &'static str,
) -> Result<i64> {
    let vid = video_id.to_string();
    ctx.db
        .call(move |conn| {
            let count = schema::count_embeddings_for_video(conn, table, &vid)?;
            schema::set_job_modality(conn, &vid, flag_col, count_col, count)?;
            Ok(count)
        })
        .await
}

fn write_thumbnail(frame: &ExtractedFrame, thumb_dir: &std::path::Path) -> Result<()> {
    let out_path = thumb_dir.join(format!("{}.jpg", frame.timestamp_ms));
    if out_path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(thumb_dir)?;

    let img = image::load_from_memory(&frame.jpeg)
        .map_err(|e| OtError::Internal(format!("frame decode failed: {}", e)))?;
    let thumb = if img.width() > THUMBNAIL_MAX_WIDTH {
        img.resize(THUMBNAIL_MAX_WIDTH, u32::MAX, FilterType::Triangle)
    } else {
        img
    };

    let tmp_path = out_path.with_extension("tmp.jpg");
    thumb
        .to_rgb8()
        .save_with_format(&tmp_path, image::ImageFormat::Jpeg)
        .map_err(|e| OtError::Internal(format!("thumbnail save failed: {}", e)))?;
    std::fs::rename(&tmp_path, &out_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    fn settings_with(caption: bool, clip: bool, face: bool) -> Settings {
        let mut s = Settings::from_env();
        s.caption_enabled = caption;
        s.clip_enabled = clip;
        s.face_enabled = face;
        s
    }

    #[test]
    fn test_full_stageset_respects_feature_toggles() {
        let all = StageSet::full(&settings_with(true, true, true));
        assert!(all.visual && all.transcript && all.captions && all.clips && all.actions && all.faces);

        let minimal = StageSet::full(&settings_with(false, false, false));
        assert!(minimal.visual && minimal.transcript);
        assert!(!minimal.captions && !minimal.clips && !minimal.actions && !minimal.faces);
    }

    #[test]
    fn test_visual_only_preserves_text_modalities() {
        let stages = StageSet::visual_only(&settings_with(true, true, true));
        assert!(stages.visual && stages.clips && stages.actions);
        assert!(!stages.transcript && !stages.captions && !stages.faces);
    }

    #[test]
    fn test_fix_enables_only_missing_modalities() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        // Frames exist, transcripts do not
        schema::insert_frame_embedding(&conn, "vid", 0, 0, &[0u8; 4]).unwrap();

        let stages = StageSet::fix(&conn, "vid", &settings_with(true, true, true)).unwrap();
        assert!(!stages.visual);
        assert!(stages.transcript);
        assert!(stages.captions);
        assert!(stages.clips);
        assert!(stages.actions);
        assert!(stages.faces);
    }

    #[test]
    fn test_fix_nothing_missing_is_noop() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        schema::insert_frame_embedding(&conn, "vid", 0, 0, &[0u8; 4]).unwrap();
        schema::insert_transcript_embedding(&conn, "vid", "hi", 0, 100, &[0u8; 4]).unwrap();

        let stages = StageSet::fix(&conn, "vid", &settings_with(false, false, false)).unwrap();
        assert!(!stages.any());
    }
}
