use axum::extract::{Extension, Path, Query};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::artifact_store::{apply_log_key, config_key, plan_log_key, state_key, ArtifactStore};
use crate::ca::CertificateAuthorityService;
use crate::encryption::Envelope;
use crate::error::{AppError, AppResult};
use crate::extractor::ListenerIdentity;
use crate::join_protocol::{self, JoinRequest, JoinResponse};
use crate::listener_controller::{JobPhase, LocalUrlBroker, UrlBroker};
use crate::log_framing::{self, LogPhase};
use crate::lwq::{ListenerHeartbeat, LivenessStore};
use crate::models::{ConfigurationVersion, ConfigurationVersionStatus, Run, RunStatus, StateVersion, Workspace};
use crate::run_service::{self, CreateRunRequest};

pub fn api_routes() -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/runs/:id", get(get_run))
        .route("/workspaces/:id/runs", get(list_workspace_runs))
        .route("/runs/:id/actions/confirm", post(confirm_run))
        .route("/runs/:id/actions/discard", post(discard_run))
        .route("/runs/:id/actions/cancel", post(cancel_run))
        .route("/runs/:id/plan", get(run_plan_view))
        .route("/runs/:id/apply", get(run_apply_view))
        .route("/workspaces/:id/configuration-versions", post(create_configuration_version))
        .route("/configuration-versions/:id", get(get_configuration_version))
        .route("/configuration-versions/:id/upload", put(upload_configuration_version))
        .route("/workspaces/:id/state-versions", post(create_state_version))
        .route("/state-versions/:id/content", put(upload_state_version_content))
        .route("/state-versions/:id/download", get(download_state_version))
        .route("/agent-pools/:pool/listeners/join", post(listener_join))
        .route("/listeners/:id/heartbeat", post(listener_heartbeat))
        .route("/listeners/:id/renew", post(listener_renew))
        .route("/listeners/:id/runs/next", get(listener_next_run))
        .route("/listeners/:id/runs/:run", patch(listener_patch_run))
        .route("/listeners/:id/runs/:run/:phase_urls", get(listener_run_urls))
        .route("/plans/:id/log", get(plan_log))
        .route("/applies/:id/log", get(apply_log))
}

// --- Run lifecycle ---

#[derive(Debug, Deserialize)]
struct CreateRunPayload {
    workspace: Uuid,
    cv: Option<Uuid>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    is_destroy: bool,
    #[serde(default)]
    auto_apply: bool,
    #[serde(default)]
    plan_only: bool,
    terraform_version: Option<String>,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "api".to_string()
}

async fn create_run(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<CreateRunPayload>,
) -> AppResult<Json<Run>> {
    let workspace: Workspace = sqlx::query_as("SELECT * FROM workspaces WHERE id = $1")
        .bind(payload.workspace)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;

    let cv_uploaded = match payload.cv {
        Some(cv_id) => {
            let cv: ConfigurationVersion = sqlx::query_as("SELECT * FROM configuration_versions WHERE id = $1")
                .bind(cv_id)
                .fetch_optional(&pool)
                .await?
                .ok_or(AppError::NotFound)?;
            cv.status() == ConfigurationVersionStatus::Uploaded
        }
        None => true,
    };

    let run = run_service::create_run(
        &pool,
        CreateRunRequest {
            workspace_ref: workspace.id,
            cv_ref: payload.cv,
            message: payload.message,
            is_destroy: payload.is_destroy,
            auto_apply: payload.auto_apply || workspace.auto_apply,
            plan_only: payload.plan_only,
            source: payload.source,
            terraform_version: payload.terraform_version.unwrap_or(workspace.terraform_version),
            resource_cpu: workspace.resource_cpu,
            resource_memory: workspace.resource_memory,
            pool_ref: workspace.pool_ref,
            vcs_commit_sha: None,
            vcs_branch: None,
            vcs_pr_number: None,
            created_by: "api".to_string(),
        },
        cv_uploaded,
    )
    .await?;

    Ok(Json(run))
}

async fn get_run(Extension(pool): Extension<PgPool>, Path(id): Path<Uuid>) -> AppResult<Json<Run>> {
    Ok(Json(run_service::get_run(&pool, id).await?))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(rename = "page[number]")]
    #[allow(dead_code)]
    number: Option<u32>,
    #[serde(rename = "page[size]")]
    #[allow(dead_code)]
    size: Option<u32>,
}

async fn list_workspace_runs(
    Extension(pool): Extension<PgPool>,
    Path(workspace_id): Path<Uuid>,
    Query(_page): Query<PageParams>,
) -> AppResult<Json<Vec<Run>>> {
    let runs: Vec<Run> = sqlx::query_as("SELECT * FROM runs WHERE workspace_ref = $1 ORDER BY created_at DESC")
        .bind(workspace_id)
        .fetch_all(&pool)
        .await?;
    Ok(Json(runs))
}

async fn confirm_run(Extension(pool): Extension<PgPool>, Path(id): Path<Uuid>) -> AppResult<Json<Run>> {
    Ok(Json(run_service::confirm_run(&pool, id).await?))
}

async fn discard_run(Extension(pool): Extension<PgPool>, Path(id): Path<Uuid>) -> AppResult<Json<Run>> {
    Ok(Json(run_service::discard_run(&pool, id).await?))
}

async fn cancel_run(Extension(pool): Extension<PgPool>, Path(id): Path<Uuid>) -> AppResult<Json<Run>> {
    Ok(Json(run_service::cancel_run(&pool, id).await?))
}

async fn run_plan_view(Extension(pool): Extension<PgPool>, Path(id): Path<Uuid>) -> AppResult<Json<serde_json::Value>> {
    let run = run_service::get_run(&pool, id).await?;
    let projection = run_service::phase_projection(&run);
    Ok(Json(json!({
        "status": projection.plan,
        "log-read-url": format!("{}/plans/{}/log", crate::config::EXTERNAL_URL.as_str(), run.id),
    })))
}

async fn run_apply_view(Extension(pool): Extension<PgPool>, Path(id): Path<Uuid>) -> AppResult<Json<serde_json::Value>> {
    let run = run_service::get_run(&pool, id).await?;
    let projection = run_service::phase_projection(&run);
    Ok(Json(json!({
        "status": projection.apply,
        "log-read-url": format!("{}/applies/{}/log", crate::config::EXTERNAL_URL.as_str(), run.id),
    })))
}

// --- Configuration versions ---

#[derive(Debug, Deserialize)]
struct CreateCvPayload {
    #[serde(default)]
    auto_queue_runs: bool,
    #[serde(default)]
    speculative: bool,
}

async fn create_configuration_version(
    Extension(pool): Extension<PgPool>,
    Path(workspace_id): Path<Uuid>,
    Json(payload): Json<CreateCvPayload>,
) -> AppResult<Json<serde_json::Value>> {
    let id = Uuid::new_v4();
    let cv: ConfigurationVersion = sqlx::query_as(
        "INSERT INTO configuration_versions (id, workspace_ref, source, status, auto_queue_runs, speculative, created_at)
         VALUES ($1, $2, 'api', 'pending', $3, $4, now()) RETURNING *",
    )
    .bind(id)
    .bind(workspace_id)
    .bind(payload.auto_queue_runs)
    .bind(payload.speculative)
    .fetch_one(&pool)
    .await?;

    let mut body = serde_json::to_value(&cv).map_err(|e| AppError::UpstreamFailure(e.to_string()))?;
    body["upload-url"] = json!(format!(
        "{}/configuration-versions/{}/upload",
        crate::config::EXTERNAL_URL.as_str(),
        cv.id
    ));
    Ok(Json(body))
}

async fn get_configuration_version(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ConfigurationVersion>> {
    let cv: ConfigurationVersion = sqlx::query_as("SELECT * FROM configuration_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(cv))
}

async fn upload_configuration_version(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    Path(id): Path<Uuid>,
    body: axum::body::Bytes,
) -> AppResult<Json<ConfigurationVersion>> {
    let mut tx = pool.begin().await?;
    let cv: ConfigurationVersion = sqlx::query_as("SELECT * FROM configuration_versions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;
    if cv.status() == ConfigurationVersionStatus::Uploaded {
        return Err(AppError::Conflict("configuration version already uploaded".into()));
    }

    let workspace: Workspace = sqlx::query_as("SELECT * FROM workspaces WHERE id = $1")
        .bind(cv.workspace_ref)
        .fetch_one(&mut *tx)
        .await?;
    store.put(&config_key(&workspace.name, cv.id), &body, "application/gzip").await?;

    let updated: ConfigurationVersion = sqlx::query_as(
        "UPDATE configuration_versions SET status = 'uploaded' WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE runs SET status = 'queued' WHERE status = 'pending' AND cv_ref = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Json(updated))
}

// --- State versions ---

#[derive(Debug, Deserialize)]
struct CreateStateVersionPayload {
    serial: i64,
    lineage: String,
    md5: String,
    #[serde(default)]
    force: bool,
}

async fn create_state_version(
    Extension(pool): Extension<PgPool>,
    Path(workspace_id): Path<Uuid>,
    Json(payload): Json<CreateStateVersionPayload>,
) -> AppResult<Json<serde_json::Value>> {
    let existing: Option<StateVersion> = sqlx::query_as(
        "SELECT * FROM state_versions WHERE workspace_ref = $1 AND serial = $2",
    )
    .bind(workspace_id)
    .bind(payload.serial)
    .fetch_optional(&pool)
    .await?;
    if existing.is_some() && !payload.force {
        return Err(AppError::Conflict("state version serial already exists".into()));
    }

    let id = Uuid::new_v4();
    let sv: StateVersion = sqlx::query_as(
        "INSERT INTO state_versions (id, workspace_ref, serial, lineage, md5, size, created_at)
         VALUES ($1, $2, $3, $4, $5, 0, now())
         ON CONFLICT (workspace_ref, serial) DO UPDATE SET lineage = EXCLUDED.lineage, md5 = EXCLUDED.md5
         RETURNING *",
    )
    .bind(id)
    .bind(workspace_id)
    .bind(payload.serial)
    .bind(&payload.lineage)
    .bind(&payload.md5)
    .fetch_one(&pool)
    .await?;

    let mut body = serde_json::to_value(&sv).map_err(|e| AppError::UpstreamFailure(e.to_string()))?;
    body["hosted-state-upload-url"] = json!(format!(
        "{}/state-versions/{}/content",
        crate::config::EXTERNAL_URL.as_str(),
        sv.id
    ));
    Ok(Json(body))
}

async fn upload_state_version_content(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    Extension(envelope): Extension<Envelope>,
    Path(id): Path<Uuid>,
    body: axum::body::Bytes,
) -> AppResult<Json<StateVersion>> {
    let sv: StateVersion = sqlx::query_as("SELECT * FROM state_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;
    let workspace: Workspace = sqlx::query_as("SELECT * FROM workspaces WHERE id = $1")
        .bind(sv.workspace_ref)
        .fetch_one(&pool)
        .await?;

    let sealed = envelope.encrypt_state(&body);
    let md5 = hex::encode(content_digest(&body));
    store
        .put(&state_key(&workspace.name, sv.serial), &sealed, "application/json")
        .await?;

    let updated: StateVersion = sqlx::query_as(
        "UPDATE state_versions SET size = $1, md5 = $2 WHERE id = $3 RETURNING *",
    )
    .bind(body.len() as i64)
    .bind(&md5)
    .bind(id)
    .fetch_one(&pool)
    .await?;
    Ok(Json(updated))
}

fn content_digest(bytes: &[u8]) -> [u8; 16] {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

async fn download_state_version(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    Extension(envelope): Extension<Envelope>,
    Path(id): Path<Uuid>,
) -> AppResult<Vec<u8>> {
    let sv: StateVersion = sqlx::query_as("SELECT * FROM state_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;
    let workspace: Workspace = sqlx::query_as("SELECT * FROM workspaces WHERE id = $1")
        .bind(sv.workspace_ref)
        .fetch_one(&pool)
        .await?;
    let sealed = store.get(&state_key(&workspace.name, sv.serial)).await?;
    Ok(envelope.decrypt_state(&sealed)?)
}

// --- Listener endpoints ---

async fn listener_join(
    Extension(ca): Extension<CertificateAuthorityService>,
    Path(_pool): Path<Uuid>,
    Json(req): Json<JoinRequest>,
) -> AppResult<Json<JoinResponse>> {
    Ok(Json(join_protocol::join(&ca, req).await?))
}

async fn listener_heartbeat(
    Extension(liveness): Extension<LivenessStore>,
    identity: ListenerIdentity,
    Json(heartbeat): Json<ListenerHeartbeat>,
) -> AppResult<Json<serde_json::Value>> {
    liveness.publish(identity.listener_id, heartbeat);
    Ok(Json(json!({"status": "online"})))
}

async fn listener_renew(
    Extension(ca): Extension<CertificateAuthorityService>,
    Extension(pool): Extension<PgPool>,
    identity: ListenerIdentity,
) -> AppResult<Json<serde_json::Value>> {
    let listener: crate::models::RunnerListener =
        sqlx::query_as("SELECT * FROM runner_listeners WHERE id = $1")
            .bind(identity.listener_id)
            .fetch_one(&pool)
            .await?;
    let pool_row: crate::models::AgentPool = sqlx::query_as("SELECT * FROM agent_pools WHERE id = $1")
        .bind(listener.pool_ref)
        .fetch_one(&pool)
        .await?;
    let leaf = ca.issue_listener_certificate(&listener.name, &pool_row.name)?;
    sqlx::query(
        "UPDATE runner_listeners SET certificate_fingerprint = $1, certificate_expires_at = $2 WHERE id = $3",
    )
    .bind(&leaf.fingerprint)
    .bind(leaf.expires_at)
    .bind(identity.listener_id)
    .execute(&pool)
    .await?;
    Ok(Json(json!({
        "certificate_pem": leaf.certificate_pem,
        "private_key_pem": leaf.private_key_pem,
    })))
}

async fn listener_next_run(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    identity: ListenerIdentity,
) -> AppResult<axum::response::Response> {
    use axum::response::IntoResponse;

    let listener: crate::models::RunnerListener =
        sqlx::query_as("SELECT * FROM runner_listeners WHERE id = $1")
            .bind(identity.listener_id)
            .fetch_one(&pool)
            .await?;
    match run_service::claim_next_run(&pool, listener.pool_ref, identity.listener_id).await? {
        Some(run) => {
            let broker = LocalUrlBroker::new(pool.clone(), store.clone());
            let presigned_urls = broker.urls_for(run.id, JobPhase::Plan).await?;
            Ok(Json(json!({
                "run": run,
                "attributes": { "presigned-urls": presigned_urls },
            }))
            .into_response())
        }
        None => Ok(axum::http::StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct ListenerPatchRunPayload {
    status: String,
    error_message: Option<String>,
}

async fn listener_patch_run(
    Extension(pool): Extension<PgPool>,
    identity: ListenerIdentity,
    Path((_listener_id, run_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ListenerPatchRunPayload>,
) -> AppResult<Json<Run>> {
    let run = run_service::get_run(&pool, run_id).await?;
    if run.listener_ref != Some(identity.listener_id) {
        return Err(AppError::PermissionDenied);
    }
    let to = RunStatus::from_str(&payload.status)
        .ok_or_else(|| AppError::ValidationError("unknown run status".into()))?;
    Ok(Json(run_service::transition_run(&pool, run_id, to, payload.error_message).await?))
}

async fn listener_run_urls(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    identity: ListenerIdentity,
    Path((_listener_id, run_id, phase_urls)): Path<(Uuid, Uuid, String)>,
) -> AppResult<Json<crate::listener_controller::PresignedUrlSet>> {
    let run = run_service::get_run(&pool, run_id).await?;
    if run.listener_ref != Some(identity.listener_id) {
        return Err(AppError::PermissionDenied);
    }
    let phase = JobPhase::from_str(phase_urls.trim_end_matches("-urls"))
        .ok_or_else(|| AppError::ValidationError("unknown run phase".into()))?;

    let broker = LocalUrlBroker::new(pool, store);
    Ok(Json(broker.urls_for(run_id, phase).await?))
}

// --- Log endpoints ---

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    65536
}

async fn read_log(
    pool: &PgPool,
    store: &dyn ArtifactStore,
    run_id: Uuid,
    phase: LogPhase,
    query: LogQuery,
) -> AppResult<Vec<u8>> {
    let run = run_service::get_run(pool, run_id).await?;
    let workspace: Workspace = sqlx::query_as("SELECT * FROM workspaces WHERE id = $1")
        .bind(run.workspace_ref)
        .fetch_one(pool)
        .await?;
    let key = match phase {
        LogPhase::Plan => plan_log_key(&workspace.name, run_id),
        LogPhase::Apply => apply_log_key(&workspace.name, run_id),
    };
    let terminal = phase.is_terminal_for(run.status());
    match store.get(&key).await {
        Ok(payload) => Ok(log_framing::frame_chunk(&payload, query.offset, query.limit, terminal)),
        Err(AppError::NotFound) => Ok(log_framing::frame_missing(terminal)),
        Err(e) => Err(e),
    }
}

async fn plan_log(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> AppResult<Vec<u8>> {
    read_log(&pool, store.as_ref(), id, LogPhase::Plan, query).await
}

async fn apply_log(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<std::sync::Arc<dyn ArtifactStore>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> AppResult<Vec<u8>> {
    read_log(&pool, store.as_ref(), id, LogPhase::Apply, query).await
}
