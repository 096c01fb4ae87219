// Frame extraction via ffmpeg rawvideo piping.
//
// Frames are sampled at a fixed interval, decoded to RGB24 on ffmpeg's
// stdout, luminance-checked (black frames at scene boundaries are skipped),
// and re-encoded as JPEG for the model sidecar and thumbnails.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use image::codecs::jpeg::JpegEncoder;
use serde::Deserialize;

use crate::constants::DARK_FRAME_LUMA_THRESHOLD;
use crate::error::{OtError, Result};
use crate::tools::{ffmpeg_path, ffprobe_path};

const FRAME_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    pub frame_num: i64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    pub duration_ms: Option<i64>,
    pub fps: Option<f64>,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
}

/// Run ffprobe on a media file and extract stream geometry.
pub fn probe(path: &Path) -> Result<MediaProbe> {
    let output = Command::new(ffprobe_path())
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .output()
        .map_err(|e| OtError::Internal(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OtError::Internal(format!("ffprobe failed: {}", stderr)));
    }

    let parsed: FFprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| OtError::Internal(format!("Failed to parse ffprobe output: {}", e)))?;

    let mut meta = MediaProbe::default();
    for stream in parsed.streams.unwrap_or_default() {
        match stream.codec_type.as_deref() {
            Some("video") => {
                meta.width = stream.width.unwrap_or(0);
                meta.height = stream.height.unwrap_or(0);
                meta.fps = parse_frame_rate(stream.r_frame_rate.as_deref());
                if meta.duration_ms.is_none() {
                    meta.duration_ms = parse_duration_ms(stream.duration.as_deref());
                }
            }
            Some("audio") => meta.has_audio = true,
            _ => {}
        }
    }
    if meta.duration_ms.is_none() {
        meta.duration_ms =
            parse_duration_ms(parsed.format.and_then(|f| f.duration).as_deref());
    }

    if meta.width == 0 || meta.height == 0 {
        return Err(OtError::Internal(format!(
            "no decodable video stream in {}",
            path.display()
        )));
    }
    Ok(meta)
}

/// Parse frame rate string like "30000/1001" to f64
fn parse_frame_rate(rate_str: Option<&str>) -> Option<f64> {
    let rate_str = rate_str?;
    if let Some((num, den)) = rate_str.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}

fn parse_duration_ms(duration: Option<&str>) -> Option<i64> {
    duration?.parse::<f64>().ok().map(|s| (s * 1000.0) as i64)
}

/// Mean luminance (Rec. 601) of an RGB24 buffer, 0-255.
pub fn mean_luminance(rgb: &[u8]) -> f64 {
    if rgb.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut count = 0u64;
    for px in rgb.chunks_exact(3) {
        sum += 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
        count += 1;
    }
    sum / count as f64
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, FRAME_JPEG_QUALITY);
    encoder
        .encode(rgb, width, height, image::ExtendedColorType::Rgb8)
        .map_err(|e| OtError::Internal(format!("JPEG encode failed: {}", e)))?;
    Ok(out)
}

/// Decode frames at `fps` from a media file, reading raw RGB24 off ffmpeg's
/// stdout one frame at a time (memory stays bounded at one frame).
///
/// `skip_dark` applies the black-frame luminance filter; frame ordinals count
/// only kept frames, so consumers must not rely on dense ordinals.
pub fn extract_frames(path: &Path, fps: f64, skip_dark: bool) -> Result<Vec<ExtractedFrame>> {
    let meta = probe(path)?;
    let (width, height) = (meta.width, meta.height);
    let frame_bytes = (width * height * 3) as usize;

    let mut child = Command::new(ffmpeg_path())
        .args(["-v", "error", "-i"])
        .arg(path)
        .args([
            "-vf",
            &format!("fps={}", fps),
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "pipe:1",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OtError::Internal(format!("Failed to run ffmpeg: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| OtError::Internal("ffmpeg stdout unavailable".to_string()))?;

    let interval_ms = 1000.0 / fps;
    let mut frames = Vec::new();
    let mut raw = vec![0u8; frame_bytes];
    let mut source_idx: i64 = 0;
    let mut kept: i64 = 0;

    loop {
        match read_exact_or_eof(&mut stdout, &mut raw)? {
            false => break,
            true => {}
        }

        let timestamp_ms = (source_idx as f64 * interval_ms) as i64;
        source_idx += 1;

        if skip_dark && mean_luminance(&raw) < DARK_FRAME_LUMA_THRESHOLD {
            continue;
        }

        frames.push(ExtractedFrame {
            frame_num: kept,
            timestamp_ms,
            width,
            height,
            jpeg: encode_jpeg(&raw, width, height)?,
        });
        kept += 1;
    }

    let status = child
        .wait()
        .map_err(|e| OtError::Internal(format!("ffmpeg wait failed: {}", e)))?;
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }
        return Err(OtError::Internal(format!("ffmpeg decode failed: {}", stderr)));
    }

    Ok(frames)
}

/// Interval-based sampling for the main visual pipeline: one frame every
/// `interval_sec`, dark frames skipped.
pub fn extract_interval_frames(path: &Path, interval_sec: f64) -> Result<Vec<ExtractedFrame>> {
    extract_frames(path, 1.0 / interval_sec.max(0.01), true)
}

/// Read one full frame. Returns false on clean EOF at a frame boundary.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            // Truncated trailing frame: drop it
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate_forms() {
        assert_eq!(parse_frame_rate(Some("30000/1001")).map(|f| (f * 100.0).round()), Some(2997.0));
        assert_eq!(parse_frame_rate(Some("25")), Some(25.0));
        assert_eq!(parse_frame_rate(Some("0/0")), None);
        assert_eq!(parse_frame_rate(None), None);
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms(Some("12.5")), Some(12500));
        assert_eq!(parse_duration_ms(Some("nope")), None);
    }

    #[test]
    fn test_mean_luminance_black_and_white() {
        let black = vec![0u8; 30];
        assert!(mean_luminance(&black) < 1.0);

        let white = vec![255u8; 30];
        assert!((mean_luminance(&white) - 255.0).abs() < 1.0);

        // Mid grey sits above the dark-frame threshold
        let grey = vec![128u8; 30];
        assert!(mean_luminance(&grey) > DARK_FRAME_LUMA_THRESHOLD);
    }

    #[test]
    fn test_jpeg_encode_produces_jfif() {
        let rgb = vec![200u8; 8 * 8 * 3];
        let jpeg = encode_jpeg(&rgb, 8, 8).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "missing JPEG SOI marker");
    }

    #[test]
    fn test_read_exact_or_eof_truncated_frame_dropped() {
        let data = vec![1u8; 10];
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = vec![0u8; 8];
        assert!(read_exact_or_eof(&mut cursor, &mut buf).unwrap());
        // Only 2 bytes remain: a truncated frame reads as EOF
        assert!(!read_exact_or_eof(&mut cursor, &mut buf).unwrap());
    }
}
