// Model access for the bridge service.
//
// The encoders, captioner, and face detector are traits so the pipeline and
// search code never know where a forward pass runs. Production wiring talks
// to a co-located inference sidecar over HTTP; transcription shells out to a
// whisper.cpp binary. The vision and text models each get their own lock so
// a transcript search can run while indexing is inside the vision model, and
// vice versa — but no model ever runs two forward passes at once.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::config::Settings;
use crate::error::{OtError, Result};
use crate::vector::l2_normalize;

// ----- Traits -----

#[async_trait]
pub trait VisionEncoder: Send + Sync {
    fn dim(&self) -> usize;
    /// Encode a batch of JPEG frames. Returns one L2-normalised vector each.
    async fn encode_images(&self, jpegs: &[Vec<u8>]) -> Result<Vec<Vec<f32>>>;
    /// Encode a text query with the vision model's text branch.
    async fn encode_text(&self, query: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait TextEncoder: Send + Sync {
    fn dim(&self) -> usize;
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait Captioner: Send + Sync {
    /// One caption per image.
    async fn caption_images(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<Vec<String>>;
    /// One caption describing a chronological frame sequence.
    async fn caption_sequence(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<String>;
    /// How many caption requests may be in flight at once.
    fn max_concurrency(&self) -> usize {
        1
    }
}

#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: [f32; 4], // x1, y1, x2, y2 in pixels
    pub score: f32,
    pub embedding: Vec<f32>, // 512-dim, normalised by the detector
}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<DetectedFace>>;
}

/// Raw transcript segment as reported by the whisper binding. Timestamps are
/// centisecond ticks; consumers multiply by 10 to get milliseconds.
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub text: String,
    pub t0_cs: i64,
    pub t1_cs: i64,
}

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, media_path: &Path) -> Result<Vec<RawSegment>>;
}

// ----- Model set with per-model locks -----

pub struct Models {
    vision: Arc<dyn VisionEncoder>,
    text: Arc<dyn TextEncoder>,
    pub captioner: Option<Arc<dyn Captioner>>,
    pub face: Option<Arc<dyn FaceDetector>>,
    pub transcriber: Arc<dyn Transcriber>,
    vision_lock: tokio::sync::Mutex<()>,
    text_lock: tokio::sync::Mutex<()>,
}

impl Models {
    pub fn new(
        vision: Arc<dyn VisionEncoder>,
        text: Arc<dyn TextEncoder>,
        captioner: Option<Arc<dyn Captioner>>,
        face: Option<Arc<dyn FaceDetector>>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Models {
            vision,
            text,
            captioner,
            face,
            transcriber,
            vision_lock: tokio::sync::Mutex::new(()),
            text_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let client = Arc::new(InferenceClient::new(settings));

        let captioner: Option<Arc<dyn Captioner>> = if settings.caption_enabled {
            if settings.caption_provider == "gemini" {
                Some(Arc::new(GeminiCaptioner::new(settings)))
            } else {
                Some(client.clone() as Arc<dyn Captioner>)
            }
        } else {
            None
        };

        let face: Option<Arc<dyn FaceDetector>> = if settings.face_enabled {
            Some(client.clone() as Arc<dyn FaceDetector>)
        } else {
            None
        };

        Models::new(
            client.clone() as Arc<dyn VisionEncoder>,
            client as Arc<dyn TextEncoder>,
            captioner,
            face,
            Arc::new(WhisperCli::new(settings)),
        )
    }

    pub fn vision_dim(&self) -> usize {
        self.vision.dim()
    }

    pub fn text_dim(&self) -> usize {
        self.text.dim()
    }

    /// Vision forward pass over a frame batch. Holds the vision lock.
    pub async fn encode_images(&self, jpegs: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        let _guard = self.vision_lock.lock().await;
        self.vision.encode_images(jpegs).await
    }

    /// Vision text-branch encoding for visual search. Holds the vision lock.
    pub async fn encode_visual_text(&self, query: &str) -> Result<Vec<f32>> {
        let _guard = self.vision_lock.lock().await;
        self.vision.encode_text(query).await
    }

    /// Text model forward pass. Holds the text lock.
    pub async fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _guard = self.text_lock.lock().await;
        self.text.encode(texts).await
    }

    pub async fn encode_text_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vecs = self.encode_texts(&[query.to_string()]).await?;
        vecs.pop()
            .ok_or_else(|| OtError::Model("text model returned no embedding".to_string()))
    }
}

// ----- Inference sidecar client -----

/// HTTP client for the co-located inference sidecar that hosts the vision
/// model, text embedder, local VLM, and face detector.
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
    vision_model: String,
    text_model: String,
    caption_model: String,
    caption_max_tokens: usize,
    vision_dim: usize,
    text_dim: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct CaptionsResponse {
    captions: Vec<String>,
}

#[derive(Deserialize)]
struct CaptionResponse {
    caption: String,
}

#[derive(Deserialize)]
struct FacesResponse {
    faces: Vec<FaceJson>,
}

#[derive(Deserialize)]
struct FaceJson {
    bbox: [f32; 4],
    score: f32,
    embedding: Vec<f32>,
}

impl InferenceClient {
    pub fn new(settings: &Settings) -> Self {
        InferenceClient {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .expect("reqwest client"),
            base_url: settings.inference_url.trim_end_matches('/').to_string(),
            vision_model: settings.vision_model_name.clone(),
            text_model: settings.transcript_model_name.clone(),
            caption_model: settings.caption_model_name.clone(),
            caption_max_tokens: settings.caption_max_tokens,
            vision_dim: settings.vision_embedding_dim,
            text_dim: settings.transcript_embedding_dim,
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(OtError::Model(format!(
                "inference sidecar {} returned {}: {}",
                endpoint, status, detail
            )));
        }
        Ok(response.json::<T>().await?)
    }

    fn check_dims(&self, vectors: &mut Vec<Vec<f32>>, expected: usize) -> Result<()> {
        for v in vectors.iter_mut() {
            if v.len() != expected {
                return Err(OtError::Model(format!(
                    "sidecar returned {}-dim embedding, expected {}",
                    v.len(),
                    expected
                )));
            }
            l2_normalize(v);
        }
        Ok(())
    }
}

#[async_trait]
impl VisionEncoder for InferenceClient {
    fn dim(&self) -> usize {
        self.vision_dim
    }

    async fn encode_images(&self, jpegs: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        let images: Vec<String> = jpegs.iter().map(|j| B64.encode(j)).collect();
        let mut response: EmbeddingsResponse = self
            .post_json(
                "/v1/embed/image",
                json!({ "model": self.vision_model, "images": images }),
            )
            .await?;
        self.check_dims(&mut response.embeddings, self.vision_dim)?;
        Ok(response.embeddings)
    }

    async fn encode_text(&self, query: &str) -> Result<Vec<f32>> {
        let mut response: EmbeddingsResponse = self
            .post_json(
                "/v1/embed/text",
                json!({ "model": self.vision_model, "texts": [query] }),
            )
            .await?;
        self.check_dims(&mut response.embeddings, self.vision_dim)?;
        response
            .embeddings
            .pop()
            .ok_or_else(|| OtError::Model("vision text branch returned no embedding".to_string()))
    }
}

#[async_trait]
impl TextEncoder for InferenceClient {
    fn dim(&self) -> usize {
        self.text_dim
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut response: EmbeddingsResponse = self
            .post_json(
                "/v1/embed/text",
                json!({ "model": self.text_model, "texts": texts }),
            )
            .await?;
        self.check_dims(&mut response.embeddings, self.text_dim)?;
        Ok(response.embeddings)
    }
}

#[async_trait]
impl Captioner for InferenceClient {
    async fn caption_images(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<Vec<String>> {
        let images: Vec<String> = jpegs.iter().map(|j| B64.encode(j)).collect();
        let response: CaptionsResponse = self
            .post_json(
                "/v1/caption",
                json!({
                    "model": self.caption_model,
                    "images": images,
                    "prompt": prompt,
                    "max_tokens": self.caption_max_tokens,
                }),
            )
            .await?;
        if response.captions.len() != jpegs.len() {
            return Err(OtError::Model(format!(
                "sidecar returned {} captions for {} images",
                response.captions.len(),
                jpegs.len()
            )));
        }
        Ok(response.captions)
    }

    async fn caption_sequence(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<String> {
        let images: Vec<String> = jpegs.iter().map(|j| B64.encode(j)).collect();
        let response: CaptionResponse = self
            .post_json(
                "/v1/caption/sequence",
                json!({
                    "model": self.caption_model,
                    "images": images,
                    "prompt": prompt,
                    "max_tokens": self.caption_max_tokens,
                }),
            )
            .await?;
        Ok(response.caption.trim().to_string())
    }
}

#[async_trait]
impl FaceDetector for InferenceClient {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<DetectedFace>> {
        let response: FacesResponse = self
            .post_json("/v1/faces", json!({ "image": B64.encode(jpeg) }))
            .await?;
        Ok(response
            .faces
            .into_iter()
            .map(|f| DetectedFace {
                bbox: f.bbox,
                score: f.score,
                embedding: f.embedding,
            })
            .collect())
    }
}

// ----- Gemini captioner -----

/// External caption provider. Each call sends the prompt plus inline JPEG
/// data; multi-image calls carry the whole frame sequence.
pub struct GeminiCaptioner {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiCaptioner {
    pub fn new(settings: &Settings) -> Self {
        GeminiCaptioner {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("reqwest client"),
            api_key: settings.gemini_api_key.clone().unwrap_or_default(),
            model: settings.caption_model_name.clone(),
        }
    }

    async fn generate(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<String> {
        let mut parts = vec![json!({ "text": prompt })];
        for jpeg in jpegs {
            parts.push(json!({
                "inline_data": { "mime_type": "image/jpeg", "data": B64.encode(jpeg) }
            }));
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&json!({ "contents": [{ "parts": parts }] }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(OtError::Model(format!("caption API returned {}", status)));
        }
        let body: serde_json::Value = response.json().await?;
        let text = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| OtError::Model("caption API response missing text".to_string()))?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl Captioner for GeminiCaptioner {
    async fn caption_images(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<Vec<String>> {
        // One request per image; the call site fans out under max_concurrency
        let mut captions = Vec::with_capacity(jpegs.len());
        for jpeg in jpegs {
            captions.push(self.generate(std::slice::from_ref(jpeg), prompt).await?);
        }
        Ok(captions)
    }

    async fn caption_sequence(&self, jpegs: &[Vec<u8>], prompt: &str) -> Result<String> {
        self.generate(jpegs, prompt).await
    }

    fn max_concurrency(&self) -> usize {
        4
    }
}

// ----- Whisper CLI transcriber -----

/// Shells out to a whisper.cpp binary. Audio is first remuxed to 16 kHz mono
/// WAV with ffmpeg, then transcribed with JSON output.
pub struct WhisperCli {
    bin: std::path::PathBuf,
    model: String,
}

impl WhisperCli {
    pub fn new(settings: &Settings) -> Self {
        WhisperCli {
            bin: crate::tools::whisper_path(&settings.whisper_bin),
            model: settings.whisper_model.clone(),
        }
    }
}

#[derive(Deserialize)]
struct WhisperOutput {
    transcription: Vec<WhisperSegment>,
}

#[derive(Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

/// Parse whisper.cpp JSON output into centisecond-tick segments.
pub fn parse_whisper_json(raw: &str) -> Result<Vec<RawSegment>> {
    let output: WhisperOutput = serde_json::from_str(raw)
        .map_err(|e| OtError::Model(format!("cannot parse whisper output: {}", e)))?;
    Ok(output
        .transcription
        .into_iter()
        .map(|seg| RawSegment {
            text: seg.text,
            // whisper.cpp offsets are milliseconds; the segment contract is
            // centisecond ticks
            t0_cs: seg.offsets.from / 10,
            t1_cs: seg.offsets.to / 10,
        })
        .collect())
}

impl Transcriber for WhisperCli {
    fn transcribe(&self, media_path: &Path) -> Result<Vec<RawSegment>> {
        let workdir = tempfile::TempDir::new()?;
        let wav_path = workdir.path().join("audio.wav");

        // Remux to the 16 kHz mono WAV whisper expects
        let ffmpeg = Command::new(crate::tools::ffmpeg_path())
            .args(["-y", "-v", "quiet", "-i"])
            .arg(media_path)
            .args(["-vn", "-ar", "16000", "-ac", "1", "-f", "wav"])
            .arg(&wav_path)
            .output()
            .map_err(|e| OtError::Model(format!("failed to run ffmpeg: {}", e)))?;
        if !ffmpeg.status.success() {
            // No audio stream is common for silent footage; treat as empty
            log::warn!(
                "audio extraction failed for {}: {}",
                media_path.display(),
                String::from_utf8_lossy(&ffmpeg.stderr)
            );
            return Ok(Vec::new());
        }

        let out_prefix = workdir.path().join("transcript");
        let output = Command::new(&self.bin)
            .arg("-m")
            .arg(&self.model)
            .args(["-oj", "-np", "-of"])
            .arg(&out_prefix)
            .arg("-f")
            .arg(&wav_path)
            .output()
            .map_err(|e| OtError::Model(format!("failed to run whisper: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OtError::Model(format!("whisper failed: {}", stderr)));
        }

        let json_path = out_prefix.with_extension("json");
        let raw = std::fs::read_to_string(&json_path)?;
        parse_whisper_json(&raw)
    }
}

// ----- Deterministic stubs for tests -----

#[doc(hidden)]
pub mod testing {
    use super::*;
    use sha2::{Digest, Sha256};

    /// Deterministic pseudo-embedding seeded from input bytes. The same
    /// input always encodes to the same unit vector, and nearby calls with
    /// identical content are exactly equal — enough to exercise ranking.
    pub fn pseudo_embedding(seed_bytes: &[u8], dim: usize) -> Vec<f32> {
        let digest = Sha256::digest(seed_bytes);
        let mut state = u64::from_le_bytes(digest[..8].try_into().unwrap()) | 1;
        let mut v: Vec<f32> = (0..dim)
            .map(|_| {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ((state % 2000) as f32 / 1000.0) - 1.0
            })
            .collect();
        l2_normalize(&mut v);
        v
    }

    pub struct StubVision {
        pub dim: usize,
    }

    #[async_trait]
    impl VisionEncoder for StubVision {
        fn dim(&self) -> usize {
            self.dim
        }
        async fn encode_images(&self, jpegs: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
            Ok(jpegs.iter().map(|j| pseudo_embedding(j, self.dim)).collect())
        }
        async fn encode_text(&self, query: &str) -> Result<Vec<f32>> {
            Ok(pseudo_embedding(query.as_bytes(), self.dim))
        }
    }

    pub struct StubText {
        pub dim: usize,
    }

    #[async_trait]
    impl TextEncoder for StubText {
        fn dim(&self) -> usize {
            self.dim
        }
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| pseudo_embedding(t.as_bytes(), self.dim))
                .collect())
        }
    }

    pub struct StubCaptioner;

    #[async_trait]
    impl Captioner for StubCaptioner {
        async fn caption_images(&self, jpegs: &[Vec<u8>], _prompt: &str) -> Result<Vec<String>> {
            Ok((0..jpegs.len()).map(|i| format!("caption {}", i)).collect())
        }
        async fn caption_sequence(&self, _jpegs: &[Vec<u8>], _prompt: &str) -> Result<String> {
            Ok("a person walks across the frame".to_string())
        }
    }

    pub struct StubTranscriber {
        pub segments: Vec<RawSegment>,
    }

    impl Transcriber for StubTranscriber {
        fn transcribe(&self, _media_path: &Path) -> Result<Vec<RawSegment>> {
            Ok(self.segments.clone())
        }
    }

    pub fn stub_models(vision_dim: usize, text_dim: usize) -> Models {
        Models::new(
            Arc::new(StubVision { dim: vision_dim }),
            Arc::new(StubText { dim: text_dim }),
            Some(Arc::new(StubCaptioner)),
            None,
            Arc::new(StubTranscriber { segments: vec![] }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whisper_json_centiseconds() {
        let raw = r#"{
            "transcription": [
                {"offsets": {"from": 0, "to": 3200}, "text": " hello there"},
                {"offsets": {"from": 3200, "to": 5000}, "text": " second segment"}
            ]
        }"#;
        let segments = parse_whisper_json(raw).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].t0_cs, 0);
        assert_eq!(segments[0].t1_cs, 320);
        assert_eq!(segments[1].t1_cs, 500);
    }

    #[test]
    fn test_parse_whisper_json_rejects_garbage() {
        assert!(parse_whisper_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_pseudo_embedding_deterministic() {
        let a = testing::pseudo_embedding(b"query", 64);
        let b = testing::pseudo_embedding(b"query", 64);
        let c = testing::pseudo_embedding(b"other", 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
