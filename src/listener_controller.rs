//! Per-listener supervisor: heartbeat, poll for claimable runs, drive the
//! plan and apply Kubernetes Jobs for each, and recover orphaned runs left
//! behind by a crashed previous instance of this listener.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use uuid::Uuid;

use crate::artifact_store::{config_key, plan_key, state_key, ArtifactStore};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::lwq::ListenerHeartbeat;
use crate::models::{Run, RunStatus, Workspace};
use crate::run_service;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Plan,
    Apply,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Plan => "plan",
            JobPhase::Apply => "apply",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "plan" => Some(JobPhase::Plan),
            "apply" => Some(JobPhase::Apply),
            _ => None,
        }
    }
}

/// Doubles a Kubernetes-style resource quantity (`"500m"` → `"1"`,
/// `"2Gi"` → `"4Gi"`) to derive a limit from a request. Unparseable input is
/// returned unchanged.
pub fn double_resource(value: &str) -> String {
    let trimmed = value.trim();
    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split_at);

    let number: i64 = match digits.parse() {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!(value, "could not parse resource value, returning as-is");
            return trimmed.to_string();
        }
    };
    if !matches!(suffix, "" | "m" | "Ki" | "Mi" | "Gi" | "Ti") {
        tracing::warn!(value, "could not parse resource value, returning as-is");
        return trimmed.to_string();
    }

    let doubled = number * 2;
    if suffix == "m" && doubled >= 1000 {
        let whole = doubled / 1000;
        let remainder = doubled % 1000;
        return if remainder == 0 { whole.to_string() } else { format!("{doubled}m") };
    }
    format!("{doubled}{suffix}")
}

pub fn job_name(run_id: Uuid, phase: JobPhase) -> String {
    let short = run_id.simple().to_string();
    format!("tprun-{}-{}", &short[..8], phase.as_str())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresignedUrlSet {
    pub config_download_url: String,
    pub state_download_url: String,
    pub plan_log_upload_url: String,
    pub plan_file_upload_url: String,
    pub apply_log_upload_url: String,
    pub state_upload_url: String,
    pub plan_file_download_url: Option<String>,
}

pub struct JobSpecInput<'a> {
    pub run_id: Uuid,
    pub phase: JobPhase,
    pub urls: &'a PresignedUrlSet,
    pub env_vars: &'a [(String, String)],
    pub terraform_vars: &'a [(String, String)],
    pub resource_cpu: &'a str,
    pub resource_memory: &'a str,
    pub terraform_version: &'a str,
}

/// Builds the Job spec for one run phase. Resource limits are `2x` requests;
/// the grace period on delete (not set here) is applied by the caller.
pub fn build_job_spec(input: &JobSpecInput) -> Job {
    let name = job_name(input.run_id, input.phase);
    let namespace = config::RUNNER_NAMESPACE.as_str();

    let mut env = vec![
        EnvVar { name: "TP_RUN_ID".into(), value: Some(input.run_id.to_string()), ..Default::default() },
        EnvVar { name: "TP_PHASE".into(), value: Some(input.phase.as_str().into()), ..Default::default() },
        EnvVar { name: "TP_API_URL".into(), value: Some(config::API_URL.clone()), ..Default::default() },
        EnvVar { name: "TP_VERSION".into(), value: Some(input.terraform_version.into()), ..Default::default() },
        EnvVar { name: "TP_CONFIG_URL".into(), value: Some(input.urls.config_download_url.clone()), ..Default::default() },
        EnvVar { name: "TP_STATE_URL".into(), value: Some(input.urls.state_download_url.clone()), ..Default::default() },
        EnvVar { name: "TP_PLAN_LOG_UPLOAD_URL".into(), value: Some(input.urls.plan_log_upload_url.clone()), ..Default::default() },
        EnvVar { name: "TP_PLAN_FILE_UPLOAD_URL".into(), value: Some(input.urls.plan_file_upload_url.clone()), ..Default::default() },
        EnvVar { name: "TP_APPLY_LOG_UPLOAD_URL".into(), value: Some(input.urls.apply_log_upload_url.clone()), ..Default::default() },
        EnvVar { name: "TP_STATE_UPLOAD_URL".into(), value: Some(input.urls.state_upload_url.clone()), ..Default::default() },
    ];
    if let Some(url) = &input.urls.plan_file_download_url {
        env.push(EnvVar { name: "TP_PLAN_FILE_DOWNLOAD_URL".into(), value: Some(url.clone()), ..Default::default() });
    }
    for (key, value) in input.env_vars {
        env.push(EnvVar { name: key.clone(), value: Some(value.clone()), ..Default::default() });
    }
    for (key, value) in input.terraform_vars {
        env.push(EnvVar { name: format!("TF_VAR_{key}"), value: Some(value.clone()), ..Default::default() });
    }

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(input.resource_cpu.to_string()));
    requests.insert("memory".to_string(), Quantity(input.resource_memory.to_string()));
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(double_resource(input.resource_cpu)));
    limits.insert("memory".to_string(), Quantity(double_resource(input.resource_memory)));

    let image = if config::RUNNER_IMAGE_TAG.is_empty() {
        config::RUNNER_IMAGE.clone()
    } else {
        format!("{}:{}", *config::RUNNER_IMAGE, *config::RUNNER_IMAGE_TAG)
    };

    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "terrapod-runner".to_string());
    labels.insert("terrapod.io/run-id".to_string(), input.run_id.to_string());
    labels.insert("terrapod.io/phase".to_string(), input.phase.as_str().to_string());

    let service_account = (!config::RUNNER_SERVICE_ACCOUNT.is_empty())
        .then(|| config::RUNNER_SERVICE_ACCOUNT.clone());

    let pod_spec = PodSpec {
        containers: vec![Container {
            name: "runner".into(),
            image: Some(image),
            env: Some(env),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        }],
        restart_policy: Some("Never".into()),
        termination_grace_period_seconds: Some(120),
        service_account_name: service_account,
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::batch::v1::JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(60 * 60),
            ttl_seconds_after_finished: Some(*config::RUNNER_JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
    Missing,
}

pub struct JobsClient {
    api: Api<Job>,
}

impl JobsClient {
    pub async fn new_in_cluster() -> AppResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("k8s client init: {e}")))?;
        Ok(Self { api: Api::namespaced(client, config::RUNNER_NAMESPACE.as_str()) })
    }

    pub async fn create(&self, job: &Job) -> AppResult<()> {
        self.api
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("create job: {e}")))?;
        Ok(())
    }

    pub async fn status(&self, name: &str) -> AppResult<JobOutcome> {
        match self.api.get_status(name).await {
            Ok(job) => Ok(outcome_from_status(&job)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(JobOutcome::Missing),
            Err(e) => Err(AppError::UpstreamFailure(format!("get job status: {e}"))),
        }
    }

    /// Polls until the Job leaves `Running`, or `timeout` elapses (treated as
    /// a failure — the caller's own `activeDeadlineSeconds` is the primary
    /// backstop, this is a belt-and-braces cap on our own wait).
    pub async fn watch(&self, name: &str, timeout: StdDuration) -> AppResult<JobOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outcome = self.status(name).await?;
            if outcome != JobOutcome::Running {
                return Ok(outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(JobOutcome::Failed);
            }
            sleep(StdDuration::from_secs(10)).await;
        }
    }

    pub async fn delete(&self, name: &str) -> AppResult<()> {
        let params = DeleteParams { grace_period_seconds: Some(120), ..Default::default() };
        match self.api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(AppError::UpstreamFailure(format!("delete job: {e}"))),
        }
    }
}

fn outcome_from_status(job: &Job) -> JobOutcome {
    if let Some(status) = &job.status {
        if status.succeeded.unwrap_or(0) > 0 {
            return JobOutcome::Succeeded;
        }
        if status.failed.unwrap_or(0) > 0 {
            return JobOutcome::Failed;
        }
    }
    JobOutcome::Running
}

/// Mints the presigned URLs a run phase needs. A remote listener never
/// fabricates its own URLs; both implementations ultimately call the control
/// plane — `Local` in-process, `Remote` over HTTP with the listener's own
/// client certificate.
#[async_trait]
pub trait UrlBroker: Send + Sync {
    async fn urls_for(&self, run_id: Uuid, phase: JobPhase) -> AppResult<PresignedUrlSet>;
}

pub struct LocalUrlBroker {
    pool: PgPool,
    store: Arc<dyn ArtifactStore>,
}

impl LocalUrlBroker {
    pub fn new(pool: PgPool, store: Arc<dyn ArtifactStore>) -> Self {
        Self { pool, store }
    }
}

#[async_trait]
impl UrlBroker for LocalUrlBroker {
    async fn urls_for(&self, run_id: Uuid, phase: JobPhase) -> AppResult<PresignedUrlSet> {
        let run = run_service::get_run(&self.pool, run_id).await?;
        let workspace: Workspace = sqlx::query_as("SELECT * FROM workspaces WHERE id = $1")
            .bind(run.workspace_ref)
            .fetch_one(&self.pool)
            .await?;
        let latest_serial: Option<i64> = sqlx::query_scalar(
            "SELECT serial FROM state_versions WHERE workspace_ref = $1 ORDER BY serial DESC LIMIT 1",
        )
        .bind(run.workspace_ref)
        .fetch_optional(&self.pool)
        .await?;
        let ttl = Duration::seconds(*config::PRESIGNED_URL_TTL_SECS as i64);

        let config_download_url = self
            .store
            .presigned_get_url(&config_key(&workspace.name, run.cv_ref.unwrap_or(Uuid::nil())), ttl)
            .await?
            .url;
        let state_download_url = self
            .store
            .presigned_get_url(&state_key(&workspace.name, latest_serial.unwrap_or(0)), ttl)
            .await?
            .url;
        let plan_log_upload_url = self
            .store
            .presigned_put_url(&crate::artifact_store::plan_log_key(&workspace.name, run_id), ttl)
            .await?
            .url;
        let plan_file_upload_url = self.store.presigned_put_url(&plan_key(&workspace.name, run_id), ttl).await?.url;
        let apply_log_upload_url = self
            .store
            .presigned_put_url(&crate::artifact_store::apply_log_key(&workspace.name, run_id), ttl)
            .await?
            .url;
        let state_upload_url = self
            .store
            .presigned_put_url(&state_key(&workspace.name, latest_serial.unwrap_or(0) + 1), ttl)
            .await?
            .url;
        let plan_file_download_url = match phase {
            JobPhase::Apply => Some(self.store.presigned_get_url(&plan_key(&workspace.name, run_id), ttl).await?.url),
            JobPhase::Plan => None,
        };

        Ok(PresignedUrlSet {
            config_download_url,
            state_download_url,
            plan_log_upload_url,
            plan_file_upload_url,
            apply_log_upload_url,
            state_upload_url,
            plan_file_download_url,
        })
    }
}

/// Used by a remote listener: it has no database access, only its client
/// certificate and the control plane's HTTP API.
pub struct RemoteUrlBroker {
    client: HttpClient,
    api_url: String,
    listener_id: Uuid,
}

impl RemoteUrlBroker {
    pub fn new(client: HttpClient, api_url: String, listener_id: Uuid) -> Self {
        Self { client, api_url, listener_id }
    }
}

#[async_trait]
impl UrlBroker for RemoteUrlBroker {
    async fn urls_for(&self, run_id: Uuid, phase: JobPhase) -> AppResult<PresignedUrlSet> {
        let url = format!(
            "{}/listeners/{}/runs/{}/{}-urls",
            self.api_url,
            self.listener_id,
            run_id,
            phase.as_str()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("fetch presigned urls: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("decode presigned urls: {e}")))
    }
}

/// Reconciles runs this listener owned (`status in {planning, applying}`)
/// against live K8s Jobs. Only the listener that owned a row performs its
/// recovery; a permanently abandoned row is reaped by an operator action
/// outside this controller.
pub async fn recover_orphaned_runs(pool: &PgPool, jobs: &JobsClient, listener_id: Uuid) -> AppResult<()> {
    let orphans = run_service::find_orphaned_runs(pool, listener_id).await?;
    for run in orphans {
        let phase = if run.apply_started_at.is_some() { JobPhase::Apply } else { JobPhase::Plan };
        let name = job_name(run.id, phase);
        let outcome = jobs.status(&name).await?;
        let (to, message) = match outcome {
            JobOutcome::Running => continue,
            JobOutcome::Succeeded if phase == JobPhase::Plan => (RunStatus::Planned, None),
            JobOutcome::Succeeded => (RunStatus::Applied, None),
            JobOutcome::Failed => (RunStatus::Errored, Some("Recovered: failed".to_string())),
            JobOutcome::Missing => (RunStatus::Errored, Some("Listener crashed and Job not found".to_string())),
        };
        tracing::info!(run_id = %run.id, ?to, "recovering orphaned run");
        run_service::transition_run(pool, run.id, to, message).await?;
    }
    Ok(())
}

pub struct ListenerController {
    pool: PgPool,
    jobs: Arc<JobsClient>,
    broker: Arc<dyn UrlBroker>,
    listener_id: Uuid,
    pool_ref: Uuid,
    concurrency: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl ListenerController {
    pub fn new(
        pool: PgPool,
        jobs: Arc<JobsClient>,
        broker: Arc<dyn UrlBroker>,
        listener_id: Uuid,
        pool_ref: Uuid,
    ) -> Self {
        Self {
            pool,
            jobs,
            broker,
            listener_id,
            pool_ref,
            concurrency: Arc::new(Semaphore::new(*config::MAX_CONCURRENT)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn heartbeat_loop(&self, http: HttpClient) {
        let mut tick = tokio::time::interval(StdDuration::from_secs(*config::HEARTBEAT_INTERVAL_SECS));
        loop {
            tick.tick().await;
            let heartbeat = ListenerHeartbeat {
                capacity: *config::MAX_CONCURRENT as u32,
                active_runs: self.active.load(Ordering::SeqCst) as u32,
                runner_defs: serde_json::json!([]),
                heartbeat_epoch: Utc::now().timestamp(),
            };
            let url = format!("{}/listeners/{}/heartbeat", config::API_URL.as_str(), self.listener_id);
            if let Err(e) = http.post(&url).json(&heartbeat).send().await {
                tracing::warn!(%e, "heartbeat publish failed");
            }
        }
    }

    pub async fn poll_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(StdDuration::from_secs(*config::POLL_INTERVAL_SECS));
        loop {
            tick.tick().await;
            if self.concurrency.available_permits() == 0 {
                continue;
            }
            match run_service::claim_next_run(&self.pool, self.pool_ref, self.listener_id).await {
                Ok(Some(run)) => {
                    let controller = self.clone();
                    let permit = controller.concurrency.clone().acquire_owned().await.unwrap();
                    controller.active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = controller.execute_run(run).await {
                            tracing::error!(%e, "run execution task failed");
                        }
                        controller.active.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(%e, "claim attempt failed"),
            }
        }
    }

    async fn execute_run(&self, run: Run) -> AppResult<()> {
        let env_vars: Vec<(String, String)> = Vec::new();
        let terraform_vars: Vec<(String, String)> = Vec::new();

        let plan_urls = self.broker.urls_for(run.id, JobPhase::Plan).await?;
        let spec = build_job_spec(&JobSpecInput {
            run_id: run.id,
            phase: JobPhase::Plan,
            urls: &plan_urls,
            env_vars: &env_vars,
            terraform_vars: &terraform_vars,
            resource_cpu: &run.resource_cpu,
            resource_memory: &run.resource_memory,
            terraform_version: &run.terraform_version,
        });
        self.jobs.create(&spec).await?;
        let outcome = self.jobs.watch(&job_name(run.id, JobPhase::Plan), StdDuration::from_secs(3600)).await?;
        if outcome != JobOutcome::Succeeded {
            run_service::transition_run(&self.pool, run.id, RunStatus::Errored, Some("plan job failed".into())).await?;
            return Ok(());
        }
        run_service::transition_run(&self.pool, run.id, RunStatus::Planned, None).await?;

        if !self.wait_for_confirmation(run.id, StdDuration::from_secs(3600)).await? {
            return Ok(());
        }
        run_service::transition_run(&self.pool, run.id, RunStatus::Applying, None).await?;

        let apply_urls = self.broker.urls_for(run.id, JobPhase::Apply).await?;
        let spec = build_job_spec(&JobSpecInput {
            run_id: run.id,
            phase: JobPhase::Apply,
            urls: &apply_urls,
            env_vars: &env_vars,
            terraform_vars: &terraform_vars,
            resource_cpu: &run.resource_cpu,
            resource_memory: &run.resource_memory,
            terraform_version: &run.terraform_version,
        });
        self.jobs.create(&spec).await?;
        let outcome = self.jobs.watch(&job_name(run.id, JobPhase::Apply), StdDuration::from_secs(3600)).await?;
        let (to, message) = if outcome == JobOutcome::Succeeded {
            (RunStatus::Applied, None)
        } else {
            (RunStatus::Errored, Some("apply job failed".to_string()))
        };
        run_service::transition_run(&self.pool, run.id, to, message).await?;
        Ok(())
    }

    /// Polls every 5s for `confirmed` (proceed), any terminal non-applied
    /// state (abort), or the deadline (abort with a warning). Lets auto-apply
    /// and explicit confirmation share this one code path.
    async fn wait_for_confirmation(&self, run_id: Uuid, deadline: StdDuration) -> AppResult<bool> {
        let started = tokio::time::Instant::now();
        loop {
            let run = run_service::get_run(&self.pool, run_id).await?;
            match run.status() {
                RunStatus::Confirmed => return Ok(true),
                status if status.is_terminal() => return Ok(false),
                _ => {}
            }
            if started.elapsed() >= deadline {
                tracing::warn!(%run_id, "confirmation wait timed out");
                return Ok(false);
            }
            sleep(StdDuration::from_secs(5)).await;
        }
    }

    pub async fn shutdown_waiter(self: Arc<Self>) {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining active runs");
        let drain_deadline = tokio::time::Instant::now() + StdDuration::from_secs(120);
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < drain_deadline {
            sleep(StdDuration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_plain_and_suffixed_quantities() {
        assert_eq!(double_resource("1"), "2");
        assert_eq!(double_resource("500m"), "1");
        assert_eq!(double_resource("2Gi"), "4Gi");
        assert_eq!(double_resource("256Mi"), "512Mi");
    }

    #[test]
    fn millicore_remainder_stays_in_millicores() {
        assert_eq!(double_resource("600m"), "1200m");
    }

    #[test]
    fn unparseable_value_is_returned_unchanged() {
        assert_eq!(double_resource("lots"), "lots");
    }

    #[test]
    fn job_name_is_deterministic() {
        let id = Uuid::nil();
        assert_eq!(job_name(id, JobPhase::Plan), "tprun-00000000-plan");
        assert_eq!(job_name(id, JobPhase::Apply), "tprun-00000000-apply");
    }
}
