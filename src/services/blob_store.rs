//! Evidence file storage.
//!
//! Files are addressed by storage-relative keys (`{attempt_id}/{kind}/{uuid}.{ext}`).
//! Keys are persisted; URLs are minted on every read and expire.

use crate::error::{Error, Result};
use crate::services::clock::Clock;
use crate::utils::url_signing;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `folder` with a fresh name and returns the new key.
    async fn put(&self, folder: &str, extension: &str, bytes: Bytes) -> Result<String>;
    async fn get(&self, key: &str) -> Result<Bytes>;
    /// Time-limited URL for `key`. Absolute `http(s)` values pass through untouched.
    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
    fn verify(&self, key: &str, expires: i64, signature: &str) -> bool;
}

pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
    secret: String,
    clock: Arc<dyn Clock>,
}

impl LocalBlobStore {
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        secret: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
            clock,
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(Error::BadRequest(format!("Invalid storage key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn sanitize_folder(raw: &str) -> String {
    raw.split('/')
        .filter(|s| !s.is_empty())
        .map(sanitize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, folder: &str, extension: &str, bytes: Bytes) -> Result<String> {
        let key = format!(
            "{}/{}.{}",
            sanitize_folder(folder),
            Uuid::new_v4().simple(),
            sanitize_segment(extension)
        );
        let path = self.resolve(&key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;
        tracing::debug!(key = %key, size = bytes.len(), "stored evidence file");
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Evidence file {} not found", key)))
            }
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if key.starts_with("http://") || key.starts_with("https://") {
            return Ok(key.to_string());
        }
        self.resolve(key)?;
        let expires = self.clock.now().timestamp() + ttl.as_secs() as i64;
        let signature = url_signing::sign_path(&self.secret, key, expires)
            .ok_or_else(|| Error::Internal("URL signing key is unusable".to_string()))?;
        Ok(format!(
            "{}/api/evidence/{}?expires={}&sig={}",
            self.base_url, key, expires, signature
        ))
    }

    fn verify(&self, key: &str, expires: i64, signature: &str) -> bool {
        url_signing::verify_path(&self.secret, key, expires, signature, self.clock.now().timestamp())
    }
}

/// Process-local blob store for tests and `STORE=memory` runs.
pub struct MemoryBlobStore {
    files: std::sync::RwLock<std::collections::HashMap<String, Bytes>>,
    secret: String,
    clock: Arc<dyn Clock>,
}

impl MemoryBlobStore {
    pub fn new(secret: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            files: Default::default(),
            secret: secret.into(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.files.read().map(|f| f.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, folder: &str, extension: &str, bytes: Bytes) -> Result<String> {
        let key = format!(
            "{}/{}.{}",
            sanitize_folder(folder),
            Uuid::new_v4().simple(),
            sanitize_segment(extension)
        );
        self.files
            .write()
            .map_err(|_| Error::Storage("Blob map lock poisoned".to_string()))?
            .insert(key.clone(), bytes);
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.files
            .read()
            .map_err(|_| Error::Storage("Blob map lock poisoned".to_string()))?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Evidence file {} not found", key)))
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if key.starts_with("http://") || key.starts_with("https://") {
            return Ok(key.to_string());
        }
        let expires = self.clock.now().timestamp() + ttl.as_secs() as i64;
        let signature = url_signing::sign_path(&self.secret, key, expires)
            .ok_or_else(|| Error::Internal("URL signing key is unusable".to_string()))?;
        Ok(format!("/api/evidence/{}?expires={}&sig={}", key, expires, signature))
    }

    fn verify(&self, key: &str, expires: i64, signature: &str) -> bool {
        url_signing::verify_path(&self.secret, key, expires, signature, self.clock.now().timestamp())
    }
}

/// Blob store whose writes always fail; exercises the storage-degraded paths.
#[derive(Debug, Default)]
pub struct UnavailableBlobStore;

#[async_trait]
impl BlobStore for UnavailableBlobStore {
    async fn put(&self, _folder: &str, _extension: &str, _bytes: Bytes) -> Result<String> {
        Err(Error::Storage("Evidence storage is unavailable".to_string()))
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        Err(Error::NotFound(format!("Evidence file {} not found", key)))
    }

    fn signed_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        Ok(key.to_string())
    }

    fn verify(&self, _key: &str, _expires: i64, _signature: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn store(dir: &Path, clock: Arc<ManualClock>) -> LocalBlobStore {
        LocalBlobStore::new(dir, "http://localhost:8080/", "secret", clock)
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_under_attempt_folder() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()));
        let blobs = store(dir.path(), clock);

        let key = blobs
            .put("attempt-1/identity_document", "png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert!(key.starts_with("attempt-1/identity_document/"));
        assert!(key.ends_with(".png"));
        assert_eq!(blobs.get(&key).await.unwrap(), Bytes::from_static(b"png"));
    }

    #[tokio::test]
    async fn signed_url_verifies_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()));
        let blobs = store(dir.path(), clock.clone());

        let url = blobs.signed_url("a/b.jpg", Duration::from_secs(60)).unwrap();
        assert!(url.starts_with("http://localhost:8080/api/evidence/a/b.jpg?"));
        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let sig = query_param(&url, "sig").to_string();

        assert!(blobs.verify("a/b.jpg", expires, &sig));
        assert!(!blobs.verify("a/c.jpg", expires, &sig));
        clock.advance_secs(61);
        assert!(!blobs.verify("a/b.jpg", expires, &sig));
    }

    #[tokio::test]
    async fn rejects_traversal_and_passes_absolute_urls() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let blobs = store(dir.path(), clock);

        assert!(matches!(blobs.get("../etc/passwd").await, Err(Error::BadRequest(_))));
        assert!(blobs.signed_url("/abs/path", Duration::from_secs(5)).is_err());
        assert_eq!(
            blobs.signed_url("https://cdn.example/x.jpg", Duration::from_secs(5)).unwrap(),
            "https://cdn.example/x.jpg"
        );
    }
}
