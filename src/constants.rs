// Open Testimony constants
// Wire-format values here are load-bearing: changing them breaks existing
// audit chains and stored envelopes.

// Audit chain
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
pub const CHAIN_VERIFY_BATCH_SIZE: usize = 1000;
pub const ERROR_MESSAGE_MAX_CHARS: usize = 2000;

// Upload streaming
pub const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8 MiB
pub const SPOOL_THRESHOLD: usize = 8 * 1024 * 1024; // spill to disk above this

// Verification statuses, strongest to weakest provenance
pub const STATUS_VERIFIED: &str = "verified";
pub const STATUS_VERIFIED_MVP: &str = "verified-mvp";
pub const STATUS_SIGNED_UPLOAD: &str = "signed-upload";
pub const STATUS_UNVERIFIED: &str = "unverified";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_ERROR_MVP: &str = "error-mvp";

// Annotation categories accepted from devices and the web UI
pub const CATEGORIES: [&str; 4] = ["interview", "incident", "documentation", "other"];

// Review statuses
pub const REVIEW_STATUSES: [&str; 3] = ["pending", "reviewed", "flagged"];

// Sessions
pub const ACCESS_TOKEN_EXPIRE_HOURS: i64 = 8;
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

// Presigned playback URLs
pub const PRESIGN_EXPIRE_SECS: u64 = 3600;

// Webhook client
pub const WEBHOOK_TIMEOUT_SECS: u64 = 5;

// Indexing job statuses
pub const JOB_PENDING: &str = "pending";
pub const JOB_PENDING_VISUAL: &str = "pending_visual";
pub const JOB_PENDING_FIX: &str = "pending_fix";
pub const JOB_PROCESSING: &str = "processing";
pub const JOB_COMPLETED: &str = "completed";
pub const JOB_FAILED: &str = "failed";

// Frame extraction
pub const DARK_FRAME_LUMA_THRESHOLD: f64 = 15.0; // of 255

// Face pipeline
pub const FACE_EMBEDDING_DIM: usize = 512;
pub const FACE_THUMB_SIZE: u32 = 112;
pub const FACE_THUMB_JPEG_QUALITY: u8 = 80;

// Action captioning
pub const ACTION_CAPTION_MAX_FRAMES: usize = 8;
pub const NO_ACTION_MARKER: &str = "no significant action";

// Photo extensions for bulk-upload media type detection
pub const PHOTO_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "heic", "heif", "webp", "tiff", "bmp", "gif",
];
