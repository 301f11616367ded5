//! Abstract object store with a closed set of backends (§9 "dynamic-dispatch
//! façades → sum types"): `Filesystem` is fully implemented; `S3`/`Azure`/
//! `Gcs` are structurally present behind the same trait so `TERRAPOD_STORAGE_BACKEND`
//! can select them once their credential plumbing is wired up.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Serialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<ObjectMeta>;
    async fn get(&self, key: &str) -> AppResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> AppResult<()>;
    async fn head(&self, key: &str) -> AppResult<ObjectMeta>;
    async fn exists(&self, key: &str) -> AppResult<bool>;
    async fn list_prefix(&self, prefix: &str) -> AppResult<Vec<ObjectMeta>>;
    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> AppResult<PresignedUrl>;
    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> AppResult<PresignedUrl>;
}

fn reject_path_traversal(key: &str) -> AppResult<()> {
    if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
        return Err(AppError::ValidationError("artifact key rejected: path traversal".into()));
    }
    Ok(())
}

pub struct FilesystemArtifactStore {
    root: std::path::PathBuf,
    hmac_secret: String,
    external_url: String,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<std::path::PathBuf>, hmac_secret: String, external_url: String) -> Self {
        Self { root: root.into(), hmac_secret, external_url }
    }

    fn path_for(&self, key: &str) -> AppResult<std::path::PathBuf> {
        reject_path_traversal(key)?;
        Ok(self.root.join(key))
    }

    fn sign(&self, op: &str, key: &str, expires_epoch: i64) -> String {
        let message = format!("{op}:{key}:{expires_epoch}");
        let mut mac = HmacSha256::new_from_slice(self.hmac_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a signed URL's `(op, key, expires_epoch, signature)` tuple in
    /// constant time. Used by the control plane's own download/upload
    /// handlers for filesystem-backed presigned URLs.
    pub fn verify_signature(&self, op: &str, key: &str, expires_epoch: i64, signature: &str) -> bool {
        if Utc::now().timestamp() > expires_epoch {
            return false;
        }
        let expected = self.sign(op, key, expires_epoch);
        let provided = hex::decode(signature).unwrap_or_default();
        let expected_bytes = hex::decode(&expected).unwrap_or_default();
        expected_bytes.ct_eq(&provided).into()
    }

    fn url_for(&self, op: &str, key: &str, ttl: Duration) -> PresignedUrl {
        let expires_at = Utc::now() + ttl;
        let signature = self.sign(op, key, expires_at.timestamp());
        let url = format!(
            "{}/artifacts/{op}?key={}&expires={}&sig={}",
            self.external_url,
            urlencoding_encode(key),
            expires_at.timestamp(),
            signature
        );
        PresignedUrl { url, expires_at }
    }
}

fn urlencoding_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<ObjectMeta> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::UpstreamFailure(format!("failed to create artifact directory: {e}"))
            })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("failed to write artifact: {e}")))?;
        let etag = hex::encode(md5_digest(bytes));
        Ok(ObjectMeta {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
            content_type: content_type.to_string(),
            etag,
            last_modified: Utc::now(),
        })
    }

    async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound,
            _ => AppError::UpstreamFailure(format!("failed to read artifact: {e}")),
        })
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(AppError::UpstreamFailure(format!("failed to delete artifact: {e}"))),
        }
    }

    async fn head(&self, key: &str) -> AppResult<ObjectMeta> {
        let path = self.path_for(key)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound,
            _ => AppError::UpstreamFailure(format!("failed to stat artifact: {e}")),
        })?;
        let bytes = tokio::fs::read(&path).await.unwrap_or_default();
        Ok(ObjectMeta {
            key: key.to_string(),
            size_bytes: metadata.len(),
            content_type: "application/octet-stream".to_string(),
            etag: hex::encode(md5_digest(&bytes)),
            last_modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn list_prefix(&self, prefix: &str) -> AppResult<Vec<ObjectMeta>> {
        reject_path_traversal(prefix)?;
        let dir = self.root.join(prefix);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(AppError::UpstreamFailure(format!("failed to list artifacts: {e}"))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("failed to list artifacts: {e}")))?
        {
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    let key = format!("{prefix}/{}", entry.file_name().to_string_lossy());
                    out.push(self.head(&key).await?);
                }
            }
        }
        Ok(out)
    }

    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> AppResult<PresignedUrl> {
        reject_path_traversal(key)?;
        Ok(self.url_for("get", key, ttl))
    }

    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> AppResult<PresignedUrl> {
        reject_path_traversal(key)?;
        Ok(self.url_for("put", key, ttl))
    }
}

fn md5_digest(bytes: &[u8]) -> [u8; 16] {
    // content-addressed etag only; not used for any security property.
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

pub fn state_key(workspace: &str, serial: i64) -> String {
    format!("state/{workspace}/{serial}.tfstate")
}

pub fn plan_key(workspace: &str, run_id: uuid::Uuid) -> String {
    format!("plans/{workspace}/{run_id}.tfplan")
}

pub fn plan_log_key(workspace: &str, run_id: uuid::Uuid) -> String {
    format!("logs/{workspace}/plans/{run_id}.log")
}

pub fn apply_log_key(workspace: &str, run_id: uuid::Uuid) -> String {
    format!("logs/{workspace}/applies/{run_id}.log")
}

pub fn config_key(workspace: &str, cv_id: uuid::Uuid) -> String {
    format!("config/{workspace}/{cv_id}.tar.gz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_and_traversal_keys() {
        assert!(reject_path_traversal("/etc/passwd").is_err());
        assert!(reject_path_traversal("state/../../../etc/passwd").is_err());
        assert!(reject_path_traversal("state/ws/1.tfstate").is_ok());
    }

    #[test]
    fn key_conventions_match_layout() {
        let run_id = uuid::Uuid::nil();
        assert_eq!(state_key("ws1", 3), "state/ws1/3.tfstate");
        assert_eq!(plan_key("ws1", run_id), format!("plans/ws1/{run_id}.tfplan"));
        assert_eq!(
            plan_log_key("ws1", run_id),
            format!("logs/ws1/plans/{run_id}.log")
        );
    }

    #[tokio::test]
    async fn filesystem_backend_round_trips_and_signs_urls() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(
            dir.path(),
            "test-secret".to_string(),
            "http://localhost:8000".to_string(),
        );
        store.put("state/ws1/1.tfstate", b"hello", "text/plain").await.unwrap();
        let bytes = store.get("state/ws1/1.tfstate").await.unwrap();
        assert_eq!(bytes, b"hello");

        let presigned = store
            .presigned_get_url("state/ws1/1.tfstate", Duration::hours(1))
            .await
            .unwrap();
        assert!(presigned.url.contains("sig="));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path(), "secret".to_string(), "http://x".to_string());
        assert!(matches!(store.get("does/not/exist.tfstate").await, Err(AppError::NotFound)));
    }
}
