use once_cell::sync::Lazy;

/// Postgres connection string. Must be set via `DATABASE_URL`.
pub static DATABASE_URL: Lazy<String> =
    Lazy::new(|| std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"));

/// HTTP bind address for the API server. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// HTTP bind port for the API server. Defaults to `8000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
});

/// Externally-advertised base URL used when minting presigned and capability
/// URLs. Listeners rewrite this back to an internal service DNS name.
pub static EXTERNAL_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_EXTERNAL_URL").unwrap_or_else(|_| "http://localhost:8000".to_string())
});

/// 32-byte envelope encryption key, hex-encoded. Absence disables EE
/// (state is stored plaintext, sensitive variable writes are rejected).
pub static ENCRYPTION_KEY: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("TERRAPOD_ENCRYPTION_KEY").ok());

/// Artifact store backend. One of `filesystem`, `s3`, `azure`, `gcs`.
pub static STORAGE_BACKEND: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_STORAGE_BACKEND").unwrap_or_else(|_| "filesystem".to_string())
});

/// Root directory for the filesystem storage backend.
pub static STORAGE_FILESYSTEM_ROOT: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_STORAGE_FILESYSTEM_ROOT")
        .unwrap_or_else(|_| "/tmp/terrapod-storage".to_string())
});

/// HMAC secret used to sign filesystem-backend presigned URLs. A real
/// deployment should pin this so restarts don't invalidate live URLs.
pub static STORAGE_FILESYSTEM_HMAC_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_STORAGE_FILESYSTEM_HMAC_SECRET")
        .unwrap_or_else(|_| "dev-insecure-signing-secret".to_string())
});

/// Default presigned URL lifetime, in seconds.
pub static PRESIGNED_URL_TTL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("TERRAPOD_PRESIGNED_URL_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600)
});

/// Filesystem cache directory for the CA certificate and key.
pub static CA_CERT_DIR: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_CA_CERT_DIR").unwrap_or_else(|_| "/var/lib/terrapod/ca".to_string())
});

/// Kubernetes namespace runner Jobs are created in.
pub static RUNNER_NAMESPACE: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_RUNNER_NAMESPACE").unwrap_or_else(|_| "terrapod-runners".to_string())
});

/// Runner container image repository.
pub static RUNNER_IMAGE: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_RUNNER_IMAGE").unwrap_or_else(|_| "terrapod/runner".to_string())
});

/// Runner container image tag.
pub static RUNNER_IMAGE_TAG: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_RUNNER_IMAGE_TAG").unwrap_or_else(|_| "latest".to_string())
});

/// Service account the runner Job pod runs under. Empty means unset.
pub static RUNNER_SERVICE_ACCOUNT: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_RUNNER_SERVICE_ACCOUNT").unwrap_or_default()
});

/// `ttlSecondsAfterFinished` applied to plan/apply Jobs.
pub static RUNNER_JOB_TTL_SECONDS: Lazy<i32> = Lazy::new(|| {
    std::env::var("TERRAPOD_RUNNER_JOB_TTL_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600)
});

// --- Listener-side configuration ---

/// `local` (direct DB access, in-cluster default listener) or `remote`
/// (join-token + client-cert HTTP path).
pub static LISTENER_MODE: Lazy<String> =
    Lazy::new(|| std::env::var("TERRAPOD_LISTENER_MODE").unwrap_or_else(|_| "local".to_string()));

pub static LISTENER_NAME: Lazy<String> =
    Lazy::new(|| std::env::var("TERRAPOD_LISTENER_NAME").unwrap_or_else(|_| "local".to_string()));

pub static API_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string())
});

pub static JOIN_TOKEN: Lazy<String> =
    Lazy::new(|| std::env::var("TERRAPOD_JOIN_TOKEN").unwrap_or_default());

pub static POOL_ID: Lazy<String> =
    Lazy::new(|| std::env::var("TERRAPOD_POOL_ID").unwrap_or_default());

pub static CERT_DIR: Lazy<String> = Lazy::new(|| {
    std::env::var("TERRAPOD_CERT_DIR").unwrap_or_else(|_| "/var/lib/terrapod/certs".to_string())
});

pub static POLL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("TERRAPOD_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5)
});

pub static HEARTBEAT_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("TERRAPOD_HEARTBEAT_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60)
});

pub static MAX_CONCURRENT: Lazy<usize> = Lazy::new(|| {
    std::env::var("TERRAPOD_MAX_CONCURRENT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3)
});

/// Allow the process to continue if `sqlx::migrate!()` fails, logging a
/// warning instead of exiting. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});
