// Per-frame caption generation.
//
// Two provider shapes: external APIs fan out parallel single-image calls,
// local VLMs take batched forward passes with a one-at-a-time fallback when
// a batch fails.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::index::frames::ExtractedFrame;
use crate::models::Captioner;

#[derive(Debug, Clone)]
pub struct FrameCaption {
    pub frame_num: i64,
    pub timestamp_ms: i64,
    pub text: String,
}

/// Caption every extracted frame. Failures drop individual frames rather
/// than aborting the stage.
pub async fn caption_frames(
    captioner: Arc<dyn Captioner>,
    frames: &[ExtractedFrame],
    prompt: &str,
    batch_size: usize,
) -> Result<Vec<FrameCaption>> {
    if frames.is_empty() {
        return Ok(Vec::new());
    }

    if captioner.max_concurrency() > 1 {
        caption_parallel(captioner, frames, prompt).await
    } else {
        caption_batched(captioner, frames, prompt, batch_size).await
    }
}

/// API provider path: up to max_concurrency single-image calls in flight.
async fn caption_parallel(
    captioner: Arc<dyn Captioner>,
    frames: &[ExtractedFrame],
    prompt: &str,
) -> Result<Vec<FrameCaption>> {
    let semaphore = Arc::new(Semaphore::new(captioner.max_concurrency()));
    let mut tasks = JoinSet::new();

    for frame in frames {
        let captioner = Arc::clone(&captioner);
        let semaphore = Arc::clone(&semaphore);
        let prompt = prompt.to_string();
        let jpeg = frame.jpeg.clone();
        let frame_num = frame.frame_num;
        let timestamp_ms = frame.timestamp_ms;

        tasks.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore open");
            match captioner.caption_images(&[jpeg], &prompt).await {
                Ok(mut captions) => captions.pop().map(|text| FrameCaption {
                    frame_num,
                    timestamp_ms,
                    text,
                }),
                Err(e) => {
                    log::warn!("Caption failed for frame {}: {}", frame_num, e);
                    None
                }
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(caption)) = joined {
            results.push(caption);
        }
    }
    results.sort_by_key(|c| c.frame_num);
    Ok(results)
}

/// Local VLM path: batched forward passes, falling back to one-at-a-time for
/// a chunk whose batch call fails.
async fn caption_batched(
    captioner: Arc<dyn Captioner>,
    frames: &[ExtractedFrame],
    prompt: &str,
    batch_size: usize,
) -> Result<Vec<FrameCaption>> {
    let batch_size = batch_size.max(1);
    let mut results = Vec::new();

    for chunk in frames.chunks(batch_size) {
        let jpegs: Vec<Vec<u8>> = chunk.iter().map(|f| f.jpeg.clone()).collect();

        match captioner.caption_images(&jpegs, prompt).await {
            Ok(captions) => {
                for (frame, text) in chunk.iter().zip(captions) {
                    results.push(FrameCaption {
                        frame_num: frame.frame_num,
                        timestamp_ms: frame.timestamp_ms,
                        text,
                    });
                }
            }
            Err(e) => {
                log::warn!(
                    "Caption batch failed at frame {}: {}",
                    chunk[0].frame_num,
                    e
                );
                for frame in chunk {
                    match captioner
                        .caption_images(std::slice::from_ref(&frame.jpeg), prompt)
                        .await
                    {
                        Ok(mut captions) => {
                            if let Some(text) = captions.pop() {
                                results.push(FrameCaption {
                                    frame_num: frame.frame_num,
                                    timestamp_ms: frame.timestamp_ms,
                                    text,
                                });
                            }
                        }
                        Err(e2) => {
                            log::warn!("Caption failed for frame {}: {}", frame.frame_num, e2)
                        }
                    }
                }
            }
        }
    }

    Ok(results)
}
