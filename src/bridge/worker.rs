// Background indexing worker -- polls for pending jobs and processes them.
//
// Exactly one polling worker runs per bridge process, so accelerator use is
// never contended between indexing jobs; search requests interleave through
// the per-model locks. Shutdown aborts the task; an in-flight job stays
// `processing` until an admin reopens it.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::db::schema;
use crate::error::Result;
use crate::index::pipeline::{self, PipelineContext, StageSet};

use super::BridgeState;

pub fn spawn_worker(state: BridgeState) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!(
            "Indexing worker started, polling every {}s",
            state.settings.worker_poll_interval_secs
        );
        worker_loop(state).await;
    })
}

async fn worker_loop(state: BridgeState) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        state.settings.worker_poll_interval_secs.max(1),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        loop {
            // Drain the queue before sleeping again
            match poll_once(&state).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    log::error!("Worker error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Claim and process at most one job. Returns true if a job was processed.
pub async fn poll_once(state: &BridgeState) -> Result<bool> {
    let job = state.db.call(|conn| schema::next_pending_job(conn)).await?;
    let Some(job) = job else {
        return Ok(false);
    };

    // Advisory per-video lock: admin fix/reindex admission can't race the
    // modality inspection below. If an admin holds it, try again next tick.
    let Some(_guard) = state.video_locks.try_acquire(&job.video_id) else {
        return Ok(false);
    };

    log::info!(
        "Processing indexing job: video_id={}, object_name={}, status={}",
        job.video_id,
        job.object_name,
        job.status
    );

    let stages = {
        let status = job.status.clone();
        let video_id = job.video_id.clone();
        let settings = Arc::clone(&state.settings);
        state
            .db
            .call(move |conn| match status.as_str() {
                "pending_visual" => Ok(StageSet::visual_only(&settings)),
                "pending_fix" => StageSet::fix(conn, &video_id, &settings),
                _ => Ok(StageSet::full(&settings)),
            })
            .await?
    };

    {
        let video_id = job.video_id.clone();
        state
            .db
            .call(move |conn| schema::set_job_status(conn, &video_id, "processing"))
            .await?;
    }

    if !stages.any() {
        // Fix mode with nothing missing: mark complete and move on
        let video_id = job.video_id.clone();
        state
            .db
            .call(move |conn| schema::set_job_completed(conn, &video_id))
            .await?;
        return Ok(true);
    }

    let ctx = PipelineContext {
        db: state.db.clone(),
        storage: Arc::clone(&state.storage),
        models: Arc::clone(&state.models),
        settings: Arc::clone(&state.settings),
    };

    match pipeline::index_video(&ctx, &job, stages).await {
        Ok(()) => {
            let video_id = job.video_id.clone();
            state
                .db
                .call(move |conn| schema::set_job_completed(conn, &video_id))
                .await?;
            log::info!("Indexing complete for {}", job.video_id);
        }
        Err(e) => {
            log::error!("Indexing failed for {}: {}", job.video_id, e);
            let video_id = job.video_id.clone();
            let message = e.to_string();
            state
                .db
                .call(move |conn| schema::set_job_failed(conn, &video_id, &message))
                .await?;
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::Db;

    // Storage-free slice of poll_once: claim ordering against the queue
    #[tokio::test]
    async fn test_oldest_pending_claimed_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("bridge.db")).unwrap();

        db.call(|conn| {
            schema::insert_index_job(conn, "11111111-1111-4111-8111-111111111111", "videos/a.mp4")?;
            schema::insert_index_job(conn, "22222222-2222-4222-8222-222222222222", "videos/b.mp4")?;
            // First job is already done; second should be claimed
            schema::set_job_status(conn, "11111111-1111-4111-8111-111111111111", "completed")?;
            Ok(())
        })
        .await
        .unwrap();

        let next = db
            .call(|conn| schema::next_pending_job(conn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.video_id, "22222222-2222-4222-8222-222222222222");
    }

    #[tokio::test]
    async fn test_fix_with_nothing_missing_completes_without_pipeline() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("bridge.db")).unwrap();
        let vid = "33333333-3333-4333-8333-333333333333";

        db.call(move |conn| {
            schema::insert_index_job(conn, vid, "videos/c.mp4")?;
            schema::set_job_fix(conn, vid)?;
            // Both core modalities present
            schema::insert_frame_embedding(conn, vid, 0, 0, &[0u8; 4])?;
            schema::insert_transcript_embedding(conn, vid, "t", 0, 100, &[0u8; 4])?;
            Ok(())
        })
        .await
        .unwrap();

        let mut settings = Settings::from_env();
        settings.caption_enabled = false;
        settings.clip_enabled = false;
        settings.face_enabled = false;
        let storage = crate::storage::ObjectStorage::from_settings(&settings).unwrap();
        let models = crate::models::testing::stub_models(8, 8);
        let state = BridgeState::new(db.clone(), storage, settings, models);

        let processed = poll_once(&state).await.unwrap();
        assert!(processed);

        let job = db
            .call(move |conn| schema::get_index_job(conn, vid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, "completed");
    }
}
