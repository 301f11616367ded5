use std::sync::Arc;

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use terrapod_run_orchestrator::artifact_store::{ArtifactStore, FilesystemArtifactStore};
use terrapod_run_orchestrator::config;
use terrapod_run_orchestrator::join_protocol;
use terrapod_run_orchestrator::listener_controller::{recover_orphaned_runs, JobsClient, ListenerController, LocalUrlBroker, RemoteUrlBroker, UrlBroker};

#[derive(Deserialize)]
struct JoinResponsePayload {
    listener_id: Uuid,
    certificate_pem: String,
    private_key_pem: String,
    ca_certificate_pem: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();
    dotenvy::dotenv().ok();

    let pool = PgPoolOptions::new()
        .max_connections(3)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    let (listener_id, pool_ref, broker, http): (Uuid, Uuid, Arc<dyn UrlBroker>, reqwest::Client) =
        match config::LISTENER_MODE.as_str() {
            "remote" => {
                let pool_id: Uuid = config::POOL_ID.parse()?;
                let http = reqwest::Client::new();
                let response: JoinResponsePayload = http
                    .post(format!("{}/agent-pools/{}/listeners/join", config::API_URL.as_str(), pool_id))
                    .json(&serde_json::json!({
                        "pool_id": pool_id,
                        "join_token": config::JOIN_TOKEN.as_str(),
                        "listener_name": config::LISTENER_NAME.as_str(),
                        "runner_definitions": [],
                    }))
                    .send()
                    .await?
                    .json()
                    .await?;

                tokio::fs::create_dir_all(config::CERT_DIR.as_str()).await?;
                write_private(&format!("{}/cert.pem", *config::CERT_DIR), &response.certificate_pem).await?;
                write_private(&format!("{}/key.pem", *config::CERT_DIR), &response.private_key_pem).await?;
                write_private(&format!("{}/ca.pem", *config::CERT_DIR), &response.ca_certificate_pem).await?;

                use base64::{engine::general_purpose::STANDARD, Engine as _};
                let cert_b64 = STANDARD.encode(response.certificate_pem.as_bytes());
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert("X-Terrapod-Client-Cert", cert_b64.parse()?);
                let authed_client = reqwest::Client::builder().default_headers(headers).build()?;

                let broker: Arc<dyn UrlBroker> =
                    Arc::new(RemoteUrlBroker::new(authed_client.clone(), config::API_URL.clone(), response.listener_id));
                (response.listener_id, Uuid::nil(), broker, authed_client)
            }
            _ => {
                let listener_id = join_protocol::register_local_listener(&pool).await?;
                let store: Arc<dyn ArtifactStore> = Arc::new(FilesystemArtifactStore::new(
                    config::STORAGE_FILESYSTEM_ROOT.as_str(),
                    config::STORAGE_FILESYSTEM_HMAC_SECRET.clone(),
                    config::EXTERNAL_URL.clone(),
                ));
                let pool_ref: Uuid = sqlx::query_scalar("SELECT pool_ref FROM runner_listeners WHERE id = $1")
                    .bind(listener_id)
                    .fetch_one(&pool)
                    .await?;
                let broker: Arc<dyn UrlBroker> = Arc::new(LocalUrlBroker::new(pool.clone(), store));
                (listener_id, pool_ref, broker, reqwest::Client::new())
            }
        };

    let jobs = Arc::new(JobsClient::new_in_cluster().await?);
    recover_orphaned_runs(&pool, &jobs, listener_id).await?;

    let controller = Arc::new(ListenerController::new(pool, jobs, broker, listener_id, pool_ref));

    let heartbeat = tokio::spawn({
        let controller = controller.clone();
        let http = http.clone();
        async move { controller.heartbeat_loop(http).await }
    });
    let poll = tokio::spawn({
        let controller = controller.clone();
        async move { controller.poll_loop().await }
    });

    controller.clone().shutdown_waiter().await;
    heartbeat.abort();
    poll.abort();

    tracing::info!("listener shut down");
    Ok(())
}

async fn write_private(path: &str, contents: &str) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, permissions).await?;
    }
    Ok(())
}
