//! Asset capture for card images.
//!
//! Normalizers hand asset URLs (avatars, card images, expression packs) to an
//! [`AssetStore`], which fetches the bytes, runs a caller-supplied transform
//! and writes the result to an [`ObjectStore`] under
//! `{record id}/{asset role}/{filename}`. Image conversion itself lives
//! outside this crate; [`identity_transform`] passes bytes through.
//!
//! Capture is best-effort: [`capture_assets`] logs each failure and never
//! fails the record it belongs to.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::http::{HttpError, build_http_client};

/// Fallback MIME type when the source does not declare one.
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Timeout for a single asset download.
const ASSET_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised while capturing an asset.
#[derive(Debug, Error)]
pub enum AssetError {
    /// Downloading the source failed.
    #[error("failed to fetch asset: {0}")]
    Fetch(#[from] HttpError),

    /// The transform rejected the payload.
    #[error("asset transform failed for {filename}: {message}")]
    Transform {
        /// Name of the file being transformed.
        filename: String,
        /// Reason given by the transform.
        message: String,
    },

    /// Writing to or reading from the object store failed.
    #[error("object store IO error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The object key would escape the store root.
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// Bytes plus the metadata a transform may rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

/// Rewrites a fetched payload before it is stored.
pub type AssetTransform =
    Arc<dyn Fn(AssetPayload) -> Result<AssetPayload, AssetError> + Send + Sync>;

/// Transform that stores bytes unchanged.
#[must_use]
pub fn identity_transform() -> AssetTransform {
    Arc::new(Ok)
}

/// Fetches a remote asset and persists it under a key prefix.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Stores the asset at `source_url` below `destination_prefix`.
    ///
    /// Returns the object key written.
    async fn store_asset(
        &self,
        source_url: &str,
        destination_prefix: &str,
        transform: AssetTransform,
    ) -> Result<String, AssetError>;
}

/// Key/value blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `bytes` at `key`, replacing any previous object.
    async fn put_object(&self, key: &str, bytes: &[u8], mime_type: &str)
    -> Result<(), AssetError>;

    /// Reads the object at `key`, or `None` if absent.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, AssetError>;
}

/// Object store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, AssetError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(AssetError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<(), AssetError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AssetError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| AssetError::Io { path, source })
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, AssetError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AssetError::Io { path, source }),
        }
    }
}

/// Asset store that downloads over HTTP and writes to an [`ObjectStore`].
#[derive(Clone)]
pub struct HttpAssetStore {
    client: Client,
    objects: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for HttpAssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAssetStore").finish_non_exhaustive()
    }
}

impl HttpAssetStore {
    /// Creates a store writing into `objects`.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::Fetch`] if the HTTP client cannot be built.
    pub fn new(objects: Arc<dyn ObjectStore>) -> Result<Self, AssetError> {
        Ok(Self {
            client: build_http_client(ASSET_TIMEOUT)?,
            objects,
        })
    }

    async fn fetch(&self, source_url: &str) -> Result<AssetPayload, AssetError> {
        let url = Url::parse(source_url).map_err(|_| HttpError::invalid_url(source_url))?;
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::timeout(source_url)
            } else {
                HttpError::network(source_url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::http_status(source_url, status.as_u16()).into());
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or_else(|| DEFAULT_MIME_TYPE.to_string(), ToString::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpError::network(source_url, e))?;

        Ok(AssetPayload {
            bytes: bytes.to_vec(),
            mime_type,
            filename: filename_from_url(&url),
        })
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    #[instrument(skip(self, transform))]
    async fn store_asset(
        &self,
        source_url: &str,
        destination_prefix: &str,
        transform: AssetTransform,
    ) -> Result<String, AssetError> {
        let payload = transform(self.fetch(source_url).await?)?;
        let key = format!(
            "{}/{}",
            destination_prefix.trim_end_matches('/'),
            payload.filename
        );
        self.objects
            .put_object(&key, &payload.bytes, &payload.mime_type)
            .await?;
        debug!(key, bytes = payload.bytes.len(), "stored asset");
        Ok(key)
    }
}

/// Last non-empty path segment of `url`, or `asset` when there is none.
fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|segment| {
            urlencoding::decode(segment)
                .map_or_else(|_| segment.to_string(), std::borrow::Cow::into_owned)
        })
        .filter(|name| !name.contains('/') && name != "..")
        .unwrap_or_else(|| "asset".to_string())
}

/// One asset a normalizer wants captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    /// Role name, used as the second key segment.
    pub role: &'static str,
    /// Where to download from.
    pub source_url: String,
}

impl AssetRequest {
    #[must_use]
    pub fn new(role: &'static str, source_url: impl Into<String>) -> Self {
        Self {
            role,
            source_url: source_url.into(),
        }
    }
}

/// Captures every requested asset concurrently and waits for all of them.
///
/// Failures are logged per role; the return value is the number stored.
#[instrument(skip(store, requests), fields(count = requests.len()))]
pub async fn capture_assets(
    store: &dyn AssetStore,
    record_id: &str,
    requests: Vec<AssetRequest>,
) -> usize {
    let outcomes = join_all(requests.iter().map(|request| {
        let prefix = format!("{record_id}/{}", request.role);
        async move {
            let result = store
                .store_asset(&request.source_url, &prefix, identity_transform())
                .await;
            (request, result)
        }
    }))
    .await;

    outcomes
        .into_iter()
        .filter(|(request, result)| match result {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    record_id,
                    role = request.role,
                    url = %request.source_url,
                    error = %e,
                    "asset capture failed"
                );
                false
            }
        })
        .count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    // ==================== FsObjectStore Tests ====================

    #[tokio::test]
    async fn test_fs_object_store_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store
            .put_object("chub-1/avatar/a.png", b"png", "image/png")
            .await
            .unwrap();

        let bytes = store.get_object("chub-1/avatar/a.png").await.unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"png"[..]));
        assert!(dir.path().join("chub-1/avatar/a.png").exists());
    }

    #[tokio::test]
    async fn test_fs_object_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert_eq!(store.get_object("nope/x.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_object_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for key in ["../x", "/etc/passwd", "a/../../b", ""] {
            let result = store.put_object(key, b"x", "text/plain").await;
            assert!(matches!(result, Err(AssetError::InvalidKey(_))), "{key}");
        }
    }

    // ==================== Filename Tests ====================

    #[test]
    fn test_filename_from_url() {
        let url = Url::parse("https://pics.example/bot-avatars/a%20b.webp?x=1").unwrap();
        assert_eq!(filename_from_url(&url), "a b.webp");
        let url = Url::parse("https://pics.example/").unwrap();
        assert_eq!(filename_from_url(&url), "asset");
    }

    // ==================== HttpAssetStore Tests ====================

    #[tokio::test]
    async fn test_http_asset_store_fetches_transforms_and_stores() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/avatars/card.webp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/webp")
                    .set_body_bytes(b"webp-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(FsObjectStore::new(dir.path()));
        let store = HttpAssetStore::new(objects.clone()).unwrap();

        let to_png: AssetTransform = Arc::new(|payload: AssetPayload| {
            assert_eq!(payload.mime_type, "image/webp");
            Ok(AssetPayload {
                filename: payload.filename.replace(".webp", ".png"),
                mime_type: "image/png".to_string(),
                bytes: payload.bytes,
            })
        });

        let key = store
            .store_asset(
                &format!("{}/avatars/card.webp", server.uri()),
                "chub-7/avatar",
                to_png,
            )
            .await
            .unwrap();

        assert_eq!(key, "chub-7/avatar/card.png");
        assert_eq!(
            objects.get_object(&key).await.unwrap().as_deref(),
            Some(&b"webp-bytes"[..])
        );
    }

    #[tokio::test]
    async fn test_capture_assets_counts_successes_and_tolerates_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = HttpAssetStore::new(Arc::new(FsObjectStore::new(dir.path()))).unwrap();

        let stored = capture_assets(
            &store,
            "janitor-x",
            vec![
                AssetRequest::new("avatars", format!("{}/ok.png", server.uri())),
                AssetRequest::new("cards", format!("{}/missing.png", server.uri())),
            ],
        )
        .await;

        assert_eq!(stored, 1);
        assert!(dir.path().join("janitor-x/avatars/ok.png").exists());
    }
}
