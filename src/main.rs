use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use terrapod_run_orchestrator::artifact_store::{ArtifactStore, FilesystemArtifactStore};
use terrapod_run_orchestrator::ca::CertificateAuthorityService;
use terrapod_run_orchestrator::config;
use terrapod_run_orchestrator::encryption::Envelope;
use terrapod_run_orchestrator::join_protocol;
use terrapod_run_orchestrator::lwq::LivenessStore;
use terrapod_run_orchestrator::routes::api_routes;

async fn root() -> &'static str {
    "Terrapod run orchestrator"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(?error, "database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE");
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let ca = CertificateAuthorityService::load_or_init(pool.clone()).await?;
    let envelope = Envelope::from_config()?;
    if !envelope.is_configured() {
        tracing::warn!("TERRAPOD_ENCRYPTION_KEY not set; state will be stored unencrypted");
    }

    // Only the filesystem backend is wired up; s3/azure/gcs are named in
    // config but fall back here until their credential plumbing lands.
    let store: Arc<dyn ArtifactStore> = Arc::new(FilesystemArtifactStore::new(
        config::STORAGE_FILESYSTEM_ROOT.as_str(),
        config::STORAGE_FILESYSTEM_HMAC_SECRET.clone(),
        config::EXTERNAL_URL.clone(),
    ));

    let liveness = LivenessStore::new();

    let local_listener_id = join_protocol::register_local_listener(&pool).await?;
    tracing::info!(listener_id = %local_listener_id, "default in-cluster listener registered");

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(ca.clone()))
        .layer(Extension(envelope.clone()))
        .layer(Extension(store.clone()))
        .layer(Extension(liveness.clone()));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "listening for incoming connections");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}
