//! Image catalog client.
//!
//! The catalog stores base VM artifacts, overlays and handoff residues. The
//! agent only needs a handful of operations from it:
//! - Show an image record (properties describe cloudlet artifacts)
//! - Reserve a new image entry that is filled in later
//! - Download an image's bytes into a local file
//! - Upload a local file into a reserved entry and attach properties
//!
//! [`HttpCatalog`] speaks the catalog's v2 HTTP API. [`MemoryCatalog`] keeps
//! everything in memory and counts transfers, for tests and development.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Header carrying the catalog auth token.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Free-form image properties.
pub type ImageProperties = serde_json::Map<String, serde_json::Value>;

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Catalog returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Image {image_id} is not a cloudlet artifact: {reason}")]
    NotCloudlet { image_id: String, reason: String },
}

/// An image entry as returned by the catalog.
///
/// The catalog flattens custom properties into the top-level object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub properties: ImageProperties,
}

impl ImageRecord {
    /// String property lookup.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

/// Anything that can materialize an artifact's bytes into a local file.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Write the artifact identified by `image_id` to `dest`, returning the size.
    async fn download(&self, image_id: &str, dest: &Path) -> Result<u64, CatalogError>;
}

/// Image catalog operations used by the agent.
#[async_trait]
pub trait ImageCatalog: ArtifactSource {
    /// Fetch an image record.
    async fn show(&self, image_id: &str) -> Result<ImageRecord, CatalogError>;

    /// Reserve a new, empty image entry.
    async fn create_image(
        &self,
        name: &str,
        properties: ImageProperties,
    ) -> Result<ImageRecord, CatalogError>;

    /// Upload `path` into a reserved entry and attach `properties`.
    async fn upload(
        &self,
        image_id: &str,
        path: &Path,
        properties: ImageProperties,
    ) -> Result<u64, CatalogError>;
}

/// Configuration for the HTTP catalog client.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Catalog URL (e.g., "http://controller:9292").
    pub base_url: String,
    /// Optional auth token.
    pub auth_token: Option<String>,
    /// Timeout for metadata requests.
    pub request_timeout: Duration,
    /// Timeout for artifact transfers.
    pub transfer_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9292".to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(3600),
        }
    }
}

/// Catalog client for the v2 images API.
pub struct HttpCatalog {
    config: CatalogConfig,
    client: Client,
}

impl HttpCatalog {
    /// Create a new catalog client.
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder().timeout(config.transfer_timeout).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.header(AUTH_HEADER, token),
            None => request,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        image_id: &str,
    ) -> Result<T, CatalogError> {
        let response = self
            .authorized(request)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = check_status(response, image_id).await?;
        Ok(response.json().await?)
    }
}

/// Map catalog status codes onto [`CatalogError`].
async fn check_status(response: Response, image_id: &str) -> Result<Response, CatalogError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(CatalogError::NotFound(image_id.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CatalogError::Unauthorized),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ArtifactSource for HttpCatalog {
    async fn download(&self, image_id: &str, dest: &Path) -> Result<u64, CatalogError> {
        let url = self.url(&format!("/v2/images/{image_id}/file"));
        debug!(url = %url, dest = %dest.display(), "Downloading artifact");

        let response = self.authorized(self.client.get(&url)).send().await?;
        let mut response = check_status(response, image_id).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.sync_all().await?;

        info!(image_id = %image_id, size = total, "Artifact downloaded");
        Ok(total)
    }
}

#[async_trait]
impl ImageCatalog for HttpCatalog {
    async fn show(&self, image_id: &str) -> Result<ImageRecord, CatalogError> {
        let url = self.url(&format!("/v2/images/{image_id}"));
        self.send_json(self.client.get(&url), image_id).await
    }

    async fn create_image(
        &self,
        name: &str,
        properties: ImageProperties,
    ) -> Result<ImageRecord, CatalogError> {
        let mut body = properties;
        body.insert("name".to_string(), name.into());
        body.insert("disk_format".to_string(), "raw".into());
        body.insert("container_format".to_string(), "bare".into());
        body.insert("visibility".to_string(), "private".into());

        let url = self.url("/v2/images");
        let record: ImageRecord = self
            .send_json(self.client.post(&url).json(&body), name)
            .await?;
        info!(image_id = %record.id, name = %name, "Reserved catalog entry");
        Ok(record)
    }

    async fn upload(
        &self,
        image_id: &str,
        path: &Path,
        properties: ImageProperties,
    ) -> Result<u64, CatalogError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let url = self.url(&format!("/v2/images/{image_id}/file"));
        debug!(url = %url, src = %path.display(), size, "Uploading artifact");
        let response = self
            .authorized(self.client.put(&url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(Body::from(file))
            .send()
            .await?;
        check_status(response, image_id).await?;

        if !properties.is_empty() {
            let patch: Vec<serde_json::Value> = properties
                .into_iter()
                .map(|(key, value)| {
                    serde_json::json!({ "op": "add", "path": format!("/{key}"), "value": value })
                })
                .collect();
            let url = self.url(&format!("/v2/images/{image_id}"));
            let response = self
                .authorized(self.client.patch(&url))
                .header(CONTENT_TYPE, "application/openstack-images-v2.1-json-patch")
                .timeout(self.config.request_timeout)
                .body(serde_json::to_vec(&patch)?)
                .send()
                .await?;
            check_status(response, image_id).await?;
        }

        info!(image_id = %image_id, size, "Artifact uploaded");
        Ok(size)
    }
}

#[derive(Debug, Clone)]
struct StoredImage {
    record: ImageRecord,
    data: Option<Vec<u8>>,
}

/// In-memory catalog for testing and development.
#[derive(Default)]
pub struct MemoryCatalog {
    images: RwLock<HashMap<String, StoredImage>>,
    id_counter: AtomicU64,
    downloads: AtomicU64,
    uploads: AtomicU64,
    fail_uploads: AtomicBool,
    download_delay: Option<Duration>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog whose downloads take at least `delay`.
    pub fn with_download_delay(delay: Duration) -> Self {
        Self {
            download_delay: Some(delay),
            ..Self::default()
        }
    }

    fn next_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("img-{n:04}")
    }

    /// Store an artifact with its bytes, returning the generated image id.
    pub async fn insert(&self, name: &str, properties: ImageProperties, data: Vec<u8>) -> String {
        let id = self.next_id();
        let record = ImageRecord {
            id: id.clone(),
            name: name.to_string(),
            size: Some(data.len() as u64),
            properties,
        };
        self.images.write().await.insert(
            id.clone(),
            StoredImage {
                record,
                data: Some(data),
            },
        );
        id
    }

    /// Bytes stored under an image id, if uploaded.
    pub async fn data(&self, image_id: &str) -> Option<Vec<u8>> {
        self.images
            .read()
            .await
            .get(image_id)
            .and_then(|image| image.data.clone())
    }

    /// All records whose name matches.
    pub async fn find_by_name(&self, name: &str) -> Vec<ImageRecord> {
        self.images
            .read()
            .await
            .values()
            .filter(|image| image.record.name == name)
            .map(|image| image.record.clone())
            .collect()
    }

    /// Overwrite one property of a stored record.
    pub async fn set_property(&self, image_id: &str, key: &str, value: serde_json::Value) {
        if let Some(image) = self.images.write().await.get_mut(image_id) {
            image.record.properties.insert(key.to_string(), value);
        }
    }

    /// Make subsequent uploads fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Number of completed downloads.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Number of completed uploads.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for MemoryCatalog {
    async fn download(&self, image_id: &str, dest: &Path) -> Result<u64, CatalogError> {
        let data = self
            .data(image_id)
            .await
            .ok_or_else(|| CatalogError::NotFound(image_id.to_string()))?;

        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }

        tokio::fs::write(dest, &data).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl ImageCatalog for MemoryCatalog {
    async fn show(&self, image_id: &str) -> Result<ImageRecord, CatalogError> {
        self.images
            .read()
            .await
            .get(image_id)
            .map(|image| image.record.clone())
            .ok_or_else(|| CatalogError::NotFound(image_id.to_string()))
    }

    async fn create_image(
        &self,
        name: &str,
        properties: ImageProperties,
    ) -> Result<ImageRecord, CatalogError> {
        let record = ImageRecord {
            id: self.next_id(),
            name: name.to_string(),
            size: None,
            properties,
        };
        self.images.write().await.insert(
            record.id.clone(),
            StoredImage {
                record: record.clone(),
                data: None,
            },
        );
        Ok(record)
    }

    async fn upload(
        &self,
        image_id: &str,
        path: &Path,
        properties: ImageProperties,
    ) -> Result<u64, CatalogError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(CatalogError::Status {
                status: 503,
                body: "upload rejected".to_string(),
            });
        }

        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;

        let mut images = self.images.write().await;
        let image = images
            .get_mut(image_id)
            .ok_or_else(|| CatalogError::NotFound(image_id.to_string()))?;
        image.record.properties.extend(properties);
        image.record.size = Some(size);
        image.data = Some(data);

        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_bytes, body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_catalog(server: &MockServer) -> HttpCatalog {
        HttpCatalog::new(CatalogConfig {
            base_url: server.uri(),
            auth_token: Some("secret".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_image_record_flattens_properties() {
        let record: ImageRecord = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "base-disk",
            "cloudlet_type": "cloudlet_base_disk",
            "is_cloudlet": true
        }))
        .unwrap();
        assert_eq!(record.id, "abc");
        assert_eq!(record.property_str("cloudlet_type"), Some("cloudlet_base_disk"));
        assert_eq!(record.properties.get("is_cloudlet"), Some(&true.into()));
    }

    #[tokio::test]
    async fn test_http_show_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/images/img-1"))
            .and(header(AUTH_HEADER, "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "img-1",
                "name": "base-mem",
            })))
            .mount(&server)
            .await;

        let record = http_catalog(&server).show("img-1").await.unwrap();
        assert_eq!(record.name, "base-mem");
    }

    #[tokio::test]
    async fn test_http_show_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/images/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = http_catalog(&server).show("missing").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_http_download_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/images/img-2/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact");
        let size = http_catalog(&server).download("img-2", &dest).await.unwrap();
        assert_eq!(size, 4096);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn test_http_upload_patches_properties() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/images/img-3/file"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v2/images/img-3"))
            .and(body_json(serde_json::json!([
                { "op": "add", "path": "/cloudlet_type", "value": "cloudlet_overlay" }
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "img-3"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("overlay.zip");
        std::fs::write(&src, b"overlay").unwrap();

        let mut props = ImageProperties::new();
        props.insert("cloudlet_type".to_string(), "cloudlet_overlay".into());
        let size = http_catalog(&server)
            .upload("img-3", &src, props)
            .await
            .unwrap();
        assert_eq!(size, 7);
    }

    #[tokio::test]
    async fn test_http_upload_streams_file_with_length() {
        let server = MockServer::start().await;
        let payload = vec![3u8; 3 * 1024 * 1024 + 17];
        Mock::given(method("PUT"))
            .and(path("/v2/images/img-4/file"))
            .and(header("content-length", payload.len().to_string().as_str()))
            .and(body_bytes(payload.clone()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("base-disk");
        std::fs::write(&src, &payload).unwrap();

        let size = http_catalog(&server)
            .upload("img-4", &src, ImageProperties::new())
            .await
            .unwrap();
        assert_eq!(size, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_memory_catalog_roundtrip() {
        let catalog = MemoryCatalog::new();
        let record = catalog
            .create_image("overlay", ImageProperties::new())
            .await
            .unwrap();
        assert!(catalog.data(&record.id).await.is_none());

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();
        catalog
            .upload(&record.id, &src, ImageProperties::new())
            .await
            .unwrap();

        let dest = dir.path().join("dest");
        catalog.download(&record.id, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert_eq!(catalog.upload_count(), 1);
        assert_eq!(catalog.download_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_catalog_failing_upload() {
        let catalog = MemoryCatalog::new();
        let record = catalog
            .create_image("overlay", ImageProperties::new())
            .await
            .unwrap();
        catalog.fail_uploads(true);

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();
        let err = catalog
            .upload(&record.id, &src, ImageProperties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Status { status: 503, .. }));
    }
}
