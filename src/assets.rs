#![forbid(unsafe_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mime_guess::MimeGuess;
use mime_guess::mime::{self, Mime};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on a downloaded asset.
const MAX_ASSET_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{mime} is not an image type")]
    NotAnImage { mime: String },
    #[error("cannot tell the file type of {path}")]
    UnknownFileType { path: String },
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("download failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("writing asset failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Response of a plain GET.
#[derive(Debug, Clone, Default)]
pub struct FetchedBody {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedBody, String>;
}

#[derive(Clone)]
pub struct UreqFetch {
    agent: ureq::Agent,
}

impl UreqFetch {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn get_blocking(&self, url: &str) -> Result<FetchedBody, String> {
        let response = self.agent.get(url).call().map_err(|err| err.to_string())?;
        let content_type = response
            .header("Content-Type")
            .map(|value| value.to_owned());
        let bytes = read_capped(response.into_reader(), MAX_ASSET_BYTES)?;
        Ok(FetchedBody {
            content_type,
            bytes,
        })
    }
}

/// Reads the whole body, failing once it grows past `limit` bytes.
fn read_capped(reader: impl Read, limit: u64) -> Result<Vec<u8>, String> {
    let mut bytes = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| err.to_string())?;
    if bytes.len() as u64 > limit {
        return Err(format!("response body exceeds {limit} bytes"));
    }
    Ok(bytes)
}

#[async_trait]
impl HttpFetch for UreqFetch {
    async fn get(&self, url: &str) -> Result<FetchedBody, String> {
        let fetch = self.clone();
        let url = url.to_owned();
        tokio::task::spawn_blocking(move || fetch.get_blocking(&url))
            .await
            .map_err(|err| format!("download task failed: {err}"))?
    }
}

/// Where the thumbnail of `video_id` is stored. The extension comes from
/// the image URL and defaults to `jpg`.
pub fn thumbnail_path(dir: &Path, video_id: &str, image_url: &str) -> PathBuf {
    let name = image_url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "jpg".to_owned());
    dir.join(format!("{video_id}.{ext}"))
}

fn ensure_image(mime: &Mime) -> Result<(), ValidationError> {
    if mime.type_() == mime::IMAGE {
        Ok(())
    } else {
        Err(ValidationError::NotAnImage {
            mime: mime.essence_str().to_owned(),
        })
    }
}

/// Checks that `dest` names an image file.
pub fn validate_destination(dest: &Path) -> Result<(), ValidationError> {
    let guessed = MimeGuess::from_path(dest)
        .first()
        .ok_or_else(|| ValidationError::UnknownFileType {
            path: dest.display().to_string(),
        })?;
    ensure_image(&guessed)
}

/// Checks the response `Content-Type`, when the server sent one.
pub fn validate_content_type(content_type: Option<&str>) -> Result<(), ValidationError> {
    let Some(raw) = content_type else {
        return Ok(());
    };
    match raw.parse::<Mime>() {
        Ok(parsed) => ensure_image(&parsed),
        Err(_) => Err(ValidationError::NotAnImage {
            mime: raw.to_owned(),
        }),
    }
}

/// Downloads remote images to disk.
#[derive(Clone)]
pub struct AssetDownloader {
    fetch: Arc<dyn HttpFetch>,
}

impl AssetDownloader {
    pub fn new(fetch: Arc<dyn HttpFetch>) -> Self {
        Self { fetch }
    }

    /// Stores the image at `url` as `dest`. Any failure is logged and
    /// reported as `false`; nothing is written in that case.
    pub async fn save(&self, url: &str, dest: &Path) -> bool {
        match self.try_save(url, dest).await {
            Ok(()) => {
                debug!(url, dest = %dest.display(), "asset saved");
                true
            }
            Err(err) => {
                warn!(url, dest = %dest.display(), error = %err, "asset not saved");
                false
            }
        }
    }

    async fn try_save(&self, url: &str, dest: &Path) -> Result<(), AssetError> {
        validate_destination(dest)?;
        let body = self.fetch.get(url).await.map_err(AssetError::Fetch)?;
        if body.bytes.is_empty() {
            return Err(AssetError::Fetch("empty response body".into()));
        }
        validate_content_type(body.content_type.as_deref())?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body.bytes).await?;
        Ok(())
    }
}
