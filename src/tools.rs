// External tool resolver for ffmpeg/ffprobe/whisper binaries.
//
// Resolution order:
// 1) Environment variable override (OT_FFMPEG_PATH, etc.)
// 2) Sidecar next to the executable (or its bin/ subdirectory)
// 3) PATH fallback

use std::env;
use std::path::PathBuf;

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve a bundled sidecar tool path.
fn resolve_tool(env_key: &str, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.exists() {
            return candidate;
        }
        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.exists() {
            return bin_candidate;
        }
    }

    // PATH fallback
    PathBuf::from(filename)
}

pub fn ffmpeg_path() -> PathBuf {
    resolve_tool("OT_FFMPEG_PATH", "ffmpeg")
}

pub fn ffprobe_path() -> PathBuf {
    resolve_tool("OT_FFPROBE_PATH", "ffprobe")
}

pub fn whisper_path(configured: &str) -> PathBuf {
    if configured != "whisper-cli" {
        return PathBuf::from(configured);
    }
    resolve_tool("OT_WHISPER_PATH", "whisper-cli")
}
