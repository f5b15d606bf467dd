//! Recording upload backends.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parley_core::config::RecordingConfig;
use thiserror::Error;
use tracing::debug;

use crate::recording::Recording;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Storage misconfigured: {0}")]
    Config(String),
}

/// Destination for finished recordings.
///
/// Takes the recording by value: once handed over, the session keeps no copy.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn name(&self) -> &str;

    /// Store the recording in `bucket`, returning a locator for the stored object.
    async fn upload(&self, recording: Recording, bucket: &str) -> Result<String, StorageError>;
}

/// Writes recordings to `{root}/{bucket}/{key}.wav`.
pub struct FileUploader {
    root: PathBuf,
}

impl FileUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Uploader for FileUploader {
    fn name(&self) -> &str {
        "file"
    }

    async fn upload(&self, recording: Recording, bucket: &str) -> Result<String, StorageError> {
        let dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(recording.object_key());
        let wav = recording.to_wav();
        debug!(path = %path.display(), bytes = wav.len(), "Writing recording");
        tokio::fs::write(&path, wav).await?;

        Ok(format!("file://{}", path.display()))
    }
}

/// PUTs recordings to `{endpoint}/{bucket}/{key}.wav`.
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, recording: Recording, bucket: &str) -> Result<String, StorageError> {
        let url = self.object_url(bucket, &recording.object_key());
        let wav = recording.to_wav();
        debug!(url, bytes = wav.len(), "Uploading recording");

        let mut request = self
            .client
            .put(&url)
            .header("content-type", "audio/wav")
            .body(wav);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(url)
    }
}

/// Build the uploader selected by the recording config.
pub fn from_config(config: &RecordingConfig) -> Result<Arc<dyn Uploader>, StorageError> {
    match config.uploader.as_str() {
        "file" => Ok(Arc::new(FileUploader::new(config.dir()))),
        "http" => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                StorageError::Config("recording.endpoint is required for the http uploader".into())
            })?;
            Ok(Arc::new(HttpUploader::new(endpoint, config.resolve_token())))
        }
        other => Err(StorageError::Config(format!("unknown uploader '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBuffer;

    fn sample_recording() -> Recording {
        let mut buffer = RecordingBuffer::new();
        buffer.append_inbound(&[1, 0, 2, 0]);
        buffer.append_outbound(&[3, 0]);
        buffer.finish("MZ123", 8000, 1)
    }

    #[tokio::test]
    async fn test_file_uploader_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = FileUploader::new(dir.path());

        let locator = uploader.upload(sample_recording(), "calls").await.unwrap();
        let path = dir.path().join("calls").join("MZ123.wav");
        assert_eq!(locator, format!("file://{}", path.display()));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(bytes.len(), crate::wav::HEADER_LEN + 6);
    }

    #[test]
    fn test_http_object_url() {
        let uploader = HttpUploader::new("https://storage.example.com/", None);
        assert_eq!(
            uploader.object_url("calls", "MZ123.wav"),
            "https://storage.example.com/calls/MZ123.wav"
        );
    }

    #[test]
    fn test_from_config() {
        let config = RecordingConfig::default();
        assert_eq!(from_config(&config).unwrap().name(), "file");

        let http = RecordingConfig {
            uploader: "http".into(),
            ..RecordingConfig::default()
        };
        assert!(matches!(from_config(&http), Err(StorageError::Config(_))));

        let s3 = RecordingConfig {
            uploader: "s3".into(),
            ..RecordingConfig::default()
        };
        assert!(from_config(&s3).is_err());
    }
}
