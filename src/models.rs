use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub execution_mode: String,
    pub auto_apply: bool,
    pub terraform_version: String,
    pub resource_cpu: String,
    pub resource_memory: String,
    pub pool_ref: Option<Uuid>,
    pub labels: Value,
    pub owner_email: String,
    pub vcs_repo: Option<String>,
    pub vcs_branch: Option<String>,
    pub locked: bool,
    pub lock_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct StateVersion {
    pub id: Uuid,
    pub workspace_ref: Uuid,
    pub serial: i64,
    pub lineage: String,
    pub md5: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationVersionStatus {
    Pending,
    Uploaded,
    Errored,
}

impl ConfigurationVersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationVersionStatus::Pending => "pending",
            ConfigurationVersionStatus::Uploaded => "uploaded",
            ConfigurationVersionStatus::Errored => "errored",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "uploaded" => ConfigurationVersionStatus::Uploaded,
            "errored" => ConfigurationVersionStatus::Errored,
            _ => ConfigurationVersionStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigurationVersion {
    pub id: Uuid,
    pub workspace_ref: Uuid,
    pub source: String,
    pub status: String,
    pub auto_queue_runs: bool,
    pub speculative: bool,
    pub created_at: DateTime<Utc>,
}

impl ConfigurationVersion {
    pub fn status(&self) -> ConfigurationVersionStatus {
        ConfigurationVersionStatus::from_str(&self.status)
    }
}

/// Run lifecycle states. Transition legality lives in `run_service`, not here;
/// this type is a persisted label, not a state machine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Planning,
    Planned,
    Confirmed,
    Applying,
    Applied,
    Errored,
    Discarded,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Queued => "queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::Confirmed => "confirmed",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::Errored => "errored",
            RunStatus::Discarded => "discarded",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => RunStatus::Pending,
            "queued" => RunStatus::Queued,
            "planning" => RunStatus::Planning,
            "planned" => RunStatus::Planned,
            "confirmed" => RunStatus::Confirmed,
            "applying" => RunStatus::Applying,
            "applied" => RunStatus::Applied,
            "errored" => RunStatus::Errored,
            "discarded" => RunStatus::Discarded,
            "canceled" => RunStatus::Canceled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied | RunStatus::Errored | RunStatus::Discarded | RunStatus::Canceled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Run {
    pub id: Uuid,
    pub workspace_ref: Uuid,
    pub cv_ref: Option<Uuid>,
    pub status: String,
    pub message: String,
    pub is_destroy: bool,
    pub auto_apply: bool,
    pub plan_only: bool,
    pub source: String,
    pub terraform_version: String,
    pub resource_cpu: String,
    pub resource_memory: String,
    pub pool_ref: Option<Uuid>,
    pub listener_ref: Option<Uuid>,
    pub error_message: Option<String>,
    pub plan_started_at: Option<DateTime<Utc>>,
    pub plan_finished_at: Option<DateTime<Utc>>,
    pub apply_started_at: Option<DateTime<Utc>>,
    pub apply_finished_at: Option<DateTime<Utc>>,
    pub vcs_commit_sha: Option<String>,
    pub vcs_branch: Option<String>,
    pub vcs_pr_number: Option<i32>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_str(&self.status).expect("persisted run status is always valid")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentPool {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub service_account_name: Option<String>,
    pub org: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentPoolToken {
    pub id: Uuid,
    pub pool_ref: Uuid,
    pub token_hash: String,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i32>,
    pub use_count: i32,
    pub is_revoked: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl AgentPoolToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.is_revoked {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return false;
            }
        }
        if let Some(max_uses) = self.max_uses {
            if self.use_count >= max_uses {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnerListener {
    pub id: Uuid,
    pub pool_ref: Uuid,
    pub name: String,
    pub certificate_fingerprint: Option<String>,
    pub certificate_expires_at: Option<DateTime<Utc>>,
    pub runner_definitions: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct CertificateAuthority {
    pub id: i32,
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Phase-view projection for UI clients that split `plan` and `apply` tabs.
/// See the table in `run_service::phase_projection`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhasePresentation {
    Pending,
    Running,
    Finished,
    Errored,
    Canceled,
    Unreachable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseProjection {
    pub plan: PhasePresentation,
    pub apply: PhasePresentation,
}
