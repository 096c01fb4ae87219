// Environment-driven configuration shared by both services.
//
// Every tunable is an environment variable; binaries load `.env` via dotenvy
// before calling `Settings::from_env()`.

use std::env;
use std::path::PathBuf;

fn var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn var_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Settings {
    // Database (shared by both services)
    pub database_path: PathBuf,

    // Object store (MinIO or any S3-compatible endpoint)
    pub minio_endpoint: String,
    pub minio_external_endpoint: String,
    pub minio_external_scheme: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub minio_bucket: String,
    pub minio_secure: bool,

    // Tag catalogue seed
    pub default_tags_file: Option<PathBuf>,

    // Auth (secret shared by both services)
    pub jwt_secret_key: String,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub admin_display_name: String,

    // Service addresses
    pub api_port: u16,
    pub bridge_port: u16,
    pub bridge_url: String,
    pub geocode_country_codes: Option<String>,

    // Inference sidecar and model identity
    pub inference_url: String,
    pub vision_model_family: String,
    pub vision_model_name: String,
    pub vision_embedding_dim: usize,
    pub transcript_model_name: String,
    pub transcript_embedding_dim: usize,
    pub device: String,
    pub use_fp16: bool,

    // Whisper transcription
    pub whisper_bin: String,
    pub whisper_model: String,

    // Frame extraction and batching
    pub frame_interval_sec: f64,
    pub batch_size: usize,
    pub temp_dir: PathBuf,
    pub worker_poll_interval_secs: u64,

    // Captioning
    pub caption_enabled: bool,
    pub caption_provider: String, // "gemini" | "local"
    pub caption_model_name: String,
    pub caption_prompt: String,
    pub caption_batch_size: usize,
    pub caption_max_tokens: usize,
    pub gemini_api_key: Option<String>,

    // Temporal clip windows
    pub clip_enabled: bool,
    pub clip_window_frames: usize,
    pub clip_window_stride: usize,
    pub clip_fps: f64,
    pub clip_action_prompt: String,

    // Faces
    pub face_enabled: bool,
    pub face_detection_threshold: f32,
    pub face_min_size: u32,
    pub face_similarity_threshold: f32,
    pub face_cluster_min_size: usize,

    // Thumbnails (bridge-local filesystem)
    pub thumbnail_dir: PathBuf,
    pub face_thumbnail_dir: PathBuf,

    // Search analytics
    pub search_log_query_text: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            database_path: PathBuf::from(var("DATABASE_PATH", "/data/opentestimony.db")),

            minio_endpoint: var("MINIO_ENDPOINT", "minio:9000"),
            minio_external_endpoint: var("MINIO_EXTERNAL_ENDPOINT", "localhost/video-stream"),
            minio_external_scheme: var("MINIO_EXTERNAL_SCHEME", "http"),
            minio_access_key: var("MINIO_ACCESS_KEY", "admin"),
            minio_secret_key: var("MINIO_SECRET_KEY", "supersecret"),
            minio_bucket: var("MINIO_BUCKET", "opentestimony-videos"),
            minio_secure: var_bool("MINIO_SECURE", false),

            default_tags_file: var_opt("DEFAULT_TAGS_FILE").map(PathBuf::from),

            jwt_secret_key: var("JWT_SECRET_KEY", "change-me-in-production"),
            admin_username: var_opt("ADMIN_USERNAME"),
            admin_password: var_opt("ADMIN_PASSWORD"),
            admin_display_name: var("ADMIN_DISPLAY_NAME", "Admin"),

            api_port: var_parse("API_PORT", 8000),
            bridge_port: var_parse("BRIDGE_PORT", 8003),
            bridge_url: var("BRIDGE_URL", "http://bridge:8003"),
            geocode_country_codes: var_opt("GEOCODE_COUNTRY_CODES"),

            inference_url: var("INFERENCE_URL", "http://localhost:8501"),
            vision_model_family: var("VISION_MODEL_FAMILY", "open_clip"),
            vision_model_name: var("VISION_MODEL_NAME", "ViT-L-14"),
            vision_embedding_dim: var_parse("VISION_EMBEDDING_DIM", 768),
            transcript_model_name: var("TRANSCRIPT_MODEL_NAME", "Qwen/Qwen3-Embedding-8B"),
            transcript_embedding_dim: var_parse("TRANSCRIPT_EMBEDDING_DIM", 4096),
            device: var("DEVICE", "cpu"),
            use_fp16: var_bool("USE_FP16", false),

            whisper_bin: var("WHISPER_BIN", "whisper-cli"),
            whisper_model: var("WHISPER_MODEL", "base"),

            frame_interval_sec: var_parse("FRAME_INTERVAL_SEC", 2.0),
            batch_size: var_parse("BATCH_SIZE", 16),
            temp_dir: PathBuf::from(var("TEMP_DIR", "/data/temp")),
            worker_poll_interval_secs: var_parse("WORKER_POLL_INTERVAL", 10),

            caption_enabled: var_bool("CAPTION_ENABLED", false),
            caption_provider: var("CAPTION_PROVIDER", "local"),
            caption_model_name: var("CAPTION_MODEL_NAME", "Qwen/Qwen3-VL-4B-Instruct"),
            caption_prompt: var(
                "CAPTION_PROMPT",
                "Describe this video frame in one short sentence. Focus on people, \
                 actions, and objects. Be specific and factual.",
            ),
            caption_batch_size: var_parse("CAPTION_BATCH_SIZE", 4),
            caption_max_tokens: var_parse("CAPTION_MAX_TOKENS", 64),
            gemini_api_key: var_opt("GEMINI_API_KEY"),

            clip_enabled: var_bool("CLIP_ENABLED", false),
            clip_window_frames: var_parse("CLIP_WINDOW_FRAMES", 16),
            clip_window_stride: var_parse("CLIP_WINDOW_STRIDE", 8),
            clip_fps: var_parse("CLIP_FPS", 2.0),
            clip_action_prompt: var(
                "CLIP_ACTION_PROMPT",
                "These are consecutive frames from a video, in chronological order. \
                 Describe the action or motion taking place in one short sentence. \
                 If nothing notable happens, answer exactly: no significant action.",
            ),

            face_enabled: var_bool("FACE_ENABLED", false),
            face_detection_threshold: var_parse("FACE_DETECTION_THRESHOLD", 0.5),
            face_min_size: var_parse("FACE_MIN_SIZE", 40),
            face_similarity_threshold: var_parse("FACE_SIMILARITY_THRESHOLD", 0.35),
            face_cluster_min_size: var_parse("FACE_CLUSTER_MIN_SIZE", 5),

            thumbnail_dir: PathBuf::from(var("THUMBNAIL_DIR", "/data/thumbnails")),
            face_thumbnail_dir: PathBuf::from(var("FACE_THUMBNAIL_DIR", "/data/face-thumbnails")),

            search_log_query_text: var_bool("SEARCH_LOG_QUERY_TEXT", true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let settings = Settings::from_env();
        assert!(settings.frame_interval_sec > 0.0);
        assert!(settings.vision_embedding_dim > 0);
        assert_eq!(settings.minio_external_scheme, "http");
    }
}
