// Temporal clip windows and action captioning.
//
// A window is a contiguous span of uniformly resampled frames. For visual
// clip search the window's frame embeddings are mean-pooled; for action
// search up to eight evenly spaced frames go to the captioner together with
// an action-focused prompt.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::constants::{ACTION_CAPTION_MAX_FRAMES, NO_ACTION_MARKER};
use crate::error::Result;
use crate::index::frames::ExtractedFrame;
use crate::models::Captioner;

const ACTION_CAPTION_CONCURRENCY: usize = 8;

/// One clip window over the resampled frame list. Indices address the
/// resampled frames slice; frame numbers and timestamps come from it.
#[derive(Debug, Clone)]
pub struct ClipWindow {
    pub start_idx: usize,
    pub end_idx: usize, // inclusive
    pub start_ms: i64,
    pub end_ms: i64,
    pub start_frame: i64,
    pub end_frame: i64,
    pub num_frames: i64,
}

/// Slide a window of `window_frames` with `stride` over the resampled frames.
/// A final partial window is kept if it covers at least half a window.
pub fn build_windows(
    frames: &[ExtractedFrame],
    window_frames: usize,
    stride: usize,
) -> Vec<ClipWindow> {
    let window_frames = window_frames.max(1);
    let stride = stride.max(1);
    let mut windows = Vec::new();

    let mut start = 0usize;
    while start < frames.len() {
        let end = (start + window_frames - 1).min(frames.len() - 1);
        let count = end - start + 1;
        if count < window_frames && count < window_frames.div_ceil(2) {
            break;
        }
        windows.push(ClipWindow {
            start_idx: start,
            end_idx: end,
            start_ms: frames[start].timestamp_ms,
            end_ms: frames[end].timestamp_ms,
            start_frame: frames[start].frame_num,
            end_frame: frames[end].frame_num,
            num_frames: count as i64,
        });
        if end + 1 >= frames.len() {
            break;
        }
        start += stride;
    }

    windows
}

/// Sample up to `max_frames` evenly spaced indices from a window span.
pub fn sample_indices(len: usize, max_frames: usize) -> Vec<usize> {
    if len <= max_frames {
        return (0..len).collect();
    }
    (0..max_frames)
        .map(|i| i * (len - 1) / (max_frames - 1))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ActionCaption {
    pub window: ClipWindow,
    pub text: String,
}

/// Caption each window's motion. Responses reporting no significant action
/// are discarded, as are per-window failures.
pub async fn caption_windows(
    captioner: Arc<dyn Captioner>,
    frames: &[ExtractedFrame],
    windows: &[ClipWindow],
    prompt: &str,
) -> Result<Vec<ActionCaption>> {
    let concurrency = if captioner.max_concurrency() > 1 {
        ACTION_CAPTION_CONCURRENCY
    } else {
        1
    };
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    for (win_idx, window) in windows.iter().enumerate() {
        let span = &frames[window.start_idx..=window.end_idx];
        let jpegs: Vec<Vec<u8>> = sample_indices(span.len(), ACTION_CAPTION_MAX_FRAMES)
            .into_iter()
            .map(|i| span[i].jpeg.clone())
            .collect();

        let captioner = Arc::clone(&captioner);
        let semaphore = Arc::clone(&semaphore);
        let prompt = prompt.to_string();
        let window = window.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore open");
            match captioner.caption_sequence(&jpegs, &prompt).await {
                Ok(text) => {
                    if text.is_empty() || text.to_lowercase().contains(NO_ACTION_MARKER) {
                        None
                    } else {
                        Some((win_idx, ActionCaption { window, text }))
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Action caption failed for window {}-{}ms: {}",
                        window.start_ms,
                        window.end_ms,
                        e
                    );
                    None
                }
            }
        });
    }

    let mut indexed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(result)) = joined {
            indexed.push(result);
        }
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, c)| c).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_frames(n: usize) -> Vec<ExtractedFrame> {
        (0..n)
            .map(|i| ExtractedFrame {
                frame_num: i as i64,
                timestamp_ms: (i * 500) as i64,
                width: 8,
                height: 8,
                jpeg: vec![i as u8; 8],
            })
            .collect()
    }

    #[test]
    fn test_build_windows_stride_and_bounds() {
        let frames = fake_frames(40);
        let windows = build_windows(&frames, 16, 8);
        assert!(!windows.is_empty());
        assert_eq!(windows[0].start_idx, 0);
        assert_eq!(windows[0].end_idx, 15);
        assert_eq!(windows[0].num_frames, 16);
        assert_eq!(windows[1].start_idx, 8);
        assert_eq!(windows[0].start_ms, 0);
        assert_eq!(windows[0].end_ms, 15 * 500);
        // Every window stays in bounds
        assert!(windows.iter().all(|w| w.end_idx < frames.len()));
    }

    #[test]
    fn test_build_windows_short_video_single_window() {
        let frames = fake_frames(10);
        let windows = build_windows(&frames, 16, 8);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].num_frames, 10);
    }

    #[test]
    fn test_sample_indices_even_spacing() {
        assert_eq!(sample_indices(5, 8), vec![0, 1, 2, 3, 4]);
        let sampled = sample_indices(16, 8);
        assert_eq!(sampled.len(), 8);
        assert_eq!(sampled[0], 0);
        assert_eq!(*sampled.last().unwrap(), 15);
    }

    struct NoActionCaptioner;

    #[async_trait::async_trait]
    impl Captioner for NoActionCaptioner {
        async fn caption_images(&self, _: &[Vec<u8>], _: &str) -> Result<Vec<String>> {
            unreachable!()
        }
        async fn caption_sequence(&self, jpegs: &[Vec<u8>], _: &str) -> Result<String> {
            // First frame byte 0 -> idle window
            if jpegs[0][0] == 0 {
                Ok("No significant action detected.".to_string())
            } else {
                Ok("a person pushes through a doorway".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_no_action_windows_discarded() {
        let frames = fake_frames(32);
        let windows = build_windows(&frames, 16, 16);
        assert_eq!(windows.len(), 2);

        let captions = caption_windows(Arc::new(NoActionCaptioner), &frames, &windows, "p")
            .await
            .unwrap();
        assert_eq!(captions.len(), 1);
        assert_eq!(captions[0].window.start_idx, 16);
        assert!(captions[0].text.contains("pushes"));
    }
}
