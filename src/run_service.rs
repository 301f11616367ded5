//! The run state machine: transition legality, phase timestamps, workspace
//! locking, the auto-apply bridge, and the skip-locked leased queue claim.
//! Every transition goes through `transition_run` so timestamps are
//! synthesised in one place, never by callers.

use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{PhasePresentation, PhaseProjection, Run, RunStatus};

/// Returns the set of states a run may legally move to from `from`.
fn allowed_transitions(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Pending => &[Queued, Canceled, Errored],
        Queued => &[Planning, Canceled, Errored],
        Planning => &[Planned, Errored, Canceled],
        Planned => &[Confirmed, Discarded, Errored, Canceled],
        Confirmed => &[Applying, Errored, Canceled],
        Applying => &[Applied, Errored, Canceled],
        Applied | Errored | Discarded | Canceled => &[],
    }
}

pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

#[derive(Default)]
pub struct CreateRunRequest {
    pub workspace_ref: Uuid,
    pub cv_ref: Option<Uuid>,
    pub message: String,
    pub is_destroy: bool,
    pub auto_apply: bool,
    pub plan_only: bool,
    pub source: String,
    pub terraform_version: String,
    pub resource_cpu: String,
    pub resource_memory: String,
    pub pool_ref: Option<Uuid>,
    pub vcs_commit_sha: Option<String>,
    pub vcs_branch: Option<String>,
    pub vcs_pr_number: Option<i32>,
    pub created_by: String,
}

/// Creates a run in `pending`. Does not lock the workspace — locking only
/// happens on entering `applying`. Queues immediately (transitions to
/// `queued`) when there's no CV to wait on, or the named CV is already
/// uploaded.
pub async fn create_run(pool: &PgPool, req: CreateRunRequest, cv_uploaded: bool) -> AppResult<Run> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let row: Run = sqlx::query_as(
        r#"INSERT INTO runs (
            id, workspace_ref, cv_ref, status, message, is_destroy, auto_apply, plan_only,
            source, terraform_version, resource_cpu, resource_memory, pool_ref,
            vcs_commit_sha, vcs_branch, vcs_pr_number, created_by, created_at, updated_at
        ) VALUES ($1,$2,$3,'pending',$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$17)
        RETURNING *"#,
    )
    .bind(id)
    .bind(req.workspace_ref)
    .bind(req.cv_ref)
    .bind(&req.message)
    .bind(req.is_destroy)
    .bind(req.auto_apply)
    .bind(req.plan_only)
    .bind(&req.source)
    .bind(&req.terraform_version)
    .bind(&req.resource_cpu)
    .bind(&req.resource_memory)
    .bind(req.pool_ref)
    .bind(&req.vcs_commit_sha)
    .bind(&req.vcs_branch)
    .bind(req.vcs_pr_number)
    .bind(&req.created_by)
    .bind(now)
    .fetch_one(pool)
    .await?;

    if req.cv_ref.is_none() || cv_uploaded {
        return transition_run(pool, id, RunStatus::Queued, None).await;
    }
    Ok(row)
}

/// The single entry point for every status change. Stamps phase timestamps,
/// flips the workspace lock, and applies the auto-apply bridge, all inside
/// one transaction.
pub async fn transition_run(
    pool: &PgPool,
    run_id: Uuid,
    to: RunStatus,
    error_message: Option<String>,
) -> AppResult<Run> {
    let mut tx = pool.begin().await?;

    let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = $1 FOR UPDATE")
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

    let from = run.status();
    if from.is_terminal() || !can_transition(from, to) {
        return Err(AppError::IllegalTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }

    let now = Utc::now();
    let mut plan_started_at = run.plan_started_at;
    let mut plan_finished_at = run.plan_finished_at;
    let mut apply_started_at = run.apply_started_at;
    let mut apply_finished_at = run.apply_finished_at;

    match to {
        RunStatus::Planning => plan_started_at = Some(now),
        RunStatus::Planned => plan_finished_at = Some(now),
        RunStatus::Applying => apply_started_at = Some(now),
        RunStatus::Applied => apply_finished_at = Some(now),
        RunStatus::Errored => {
            if plan_started_at.is_some() && plan_finished_at.is_none() {
                plan_finished_at = Some(now);
            }
            if apply_started_at.is_some() && apply_finished_at.is_none() {
                apply_finished_at = Some(now);
            }
        }
        _ => {}
    }

    sqlx::query(
        "UPDATE runs SET status = $1, error_message = COALESCE($2, error_message),
         plan_started_at = $3, plan_finished_at = $4,
         apply_started_at = $5, apply_finished_at = $6, updated_at = $7
         WHERE id = $8",
    )
    .bind(to.as_str())
    .bind(&error_message)
    .bind(plan_started_at)
    .bind(plan_finished_at)
    .bind(apply_started_at)
    .bind(apply_finished_at)
    .bind(now)
    .bind(run_id)
    .execute(&mut *tx)
    .await?;

    if to == RunStatus::Applying {
        sqlx::query("UPDATE workspaces SET locked = true, lock_id = $1 WHERE id = $2")
            .bind(format!("run-{run_id}"))
            .bind(run.workspace_ref)
            .execute(&mut *tx)
            .await?;
    }
    if to.is_terminal() {
        sqlx::query(
            "UPDATE workspaces SET locked = false, lock_id = NULL WHERE id = $1 AND lock_id = $2",
        )
        .bind(run.workspace_ref)
        .bind(format!("run-{run_id}"))
        .execute(&mut *tx)
        .await?;
    }

    tracing::info!(run_id = %run_id, from = from.as_str(), to = to.as_str(), "run transition");

    // Auto-apply bridge: bridging happens in the same transaction that
    // writes `planned` so a human discard can never race it.
    let bridges_to_confirmed = to == RunStatus::Planned && run.auto_apply && !run.plan_only;

    let mut updated: Run = sqlx::query_as("SELECT * FROM runs WHERE id = $1")
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;

    if bridges_to_confirmed {
        sqlx::query("UPDATE runs SET status = 'confirmed', updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tracing::info!(run_id = %run_id, from = "planned", to = "confirmed", "auto-apply bridge");
        updated.status = "confirmed".to_string();
    }

    tx.commit().await?;
    Ok(updated)
}

pub async fn confirm_run(pool: &PgPool, run_id: Uuid) -> AppResult<Run> {
    let run = get_run(pool, run_id).await?;
    if run.plan_only {
        return Err(AppError::IllegalTransition("not_confirmable".into()));
    }
    transition_run(pool, run_id, RunStatus::Confirmed, None).await
}

pub async fn discard_run(pool: &PgPool, run_id: Uuid) -> AppResult<Run> {
    let run = get_run(pool, run_id).await?;
    if run.status() != RunStatus::Planned {
        return Err(AppError::IllegalTransition("not_discardable".into()));
    }
    transition_run(pool, run_id, RunStatus::Discarded, None).await
}

pub async fn cancel_run(pool: &PgPool, run_id: Uuid) -> AppResult<Run> {
    transition_run(pool, run_id, RunStatus::Canceled, None).await
}

pub async fn get_run(pool: &PgPool, run_id: Uuid) -> AppResult<Run> {
    sqlx::query_as("SELECT * FROM runs WHERE id = $1")
        .bind(run_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)
}

/// Skip-locked competitive claim of the next queued run in `pool_ref`,
/// scoped to a listener. The claim itself transitions through
/// `transition_run` so phase timestamps stay consistent, but the row
/// selection and listener assignment need their own lock, hence the nested
/// transaction here rather than reuse of `transition_run` wholesale.
pub async fn claim_next_run(pool: &PgPool, pool_ref: Uuid, listener_id: Uuid) -> AppResult<Option<Run>> {
    let mut tx = pool.begin().await?;

    let candidate = sqlx::query(
        "SELECT id FROM runs WHERE status = 'queued' AND pool_ref = $1
         ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
    )
    .bind(pool_ref)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = candidate else {
        tx.commit().await?;
        return Ok(None);
    };
    let run_id: Uuid = row.get("id");
    let now = Utc::now();

    sqlx::query(
        "UPDATE runs SET listener_ref = $1, status = 'planning', plan_started_at = $2, updated_at = $2 WHERE id = $3",
    )
    .bind(listener_id)
    .bind(now)
    .bind(run_id)
    .execute(&mut *tx)
    .await?;

    let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = $1")
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(run_id = %run_id, listener = %listener_id, pool = %pool_ref, "run claimed");
    Ok(Some(run))
}

/// Runs whose status is `planning`/`applying` but whose listener is no
/// longer live. Callers (the listener's own orphan scan) further filter by
/// `listener_ref = self`; only the owning listener may recover a row.
pub async fn find_orphaned_runs(pool: &PgPool, listener_id: Uuid) -> AppResult<Vec<Run>> {
    let runs: Vec<Run> = sqlx::query_as(
        "SELECT * FROM runs WHERE listener_ref = $1 AND status IN ('planning', 'applying')",
    )
    .bind(listener_id)
    .fetch_all(pool)
    .await?;
    Ok(runs)
}

/// Implements the phase-status projection table: plan/apply tabs for
/// clients that split the UI by phase.
pub fn phase_projection(run: &Run) -> PhaseProjection {
    use PhasePresentation::{Canceled as PCanceled, Errored as PErrored, Finished, Pending as PPending, Running, Unreachable};
    use RunStatus::{Applied, Applying, Canceled, Confirmed, Discarded, Errored, Pending, Planned, Planning, Queued};

    match run.status() {
        Pending | Queued => PhaseProjection { plan: PPending, apply: Unreachable },
        Planning => PhaseProjection { plan: Running, apply: Unreachable },
        Planned | Confirmed => PhaseProjection { plan: Finished, apply: PPending },
        Applying => PhaseProjection { plan: Finished, apply: Running },
        Applied => PhaseProjection { plan: Finished, apply: Finished },
        Errored => {
            if run.plan_finished_at.is_none() {
                PhaseProjection { plan: PErrored, apply: Unreachable }
            } else if run.apply_started_at.is_some() && run.apply_finished_at.is_none() {
                PhaseProjection { plan: Finished, apply: PErrored }
            } else {
                PhaseProjection { plan: Finished, apply: Unreachable }
            }
        }
        Canceled | Discarded => PhaseProjection { plan: PCanceled, apply: PCanceled },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        for state in [RunStatus::Applied, RunStatus::Errored, RunStatus::Discarded, RunStatus::Canceled] {
            assert!(allowed_transitions(state).is_empty());
        }
    }

    #[test]
    fn happy_path_chain_is_legal() {
        assert!(can_transition(RunStatus::Pending, RunStatus::Queued));
        assert!(can_transition(RunStatus::Queued, RunStatus::Planning));
        assert!(can_transition(RunStatus::Planning, RunStatus::Planned));
        assert!(can_transition(RunStatus::Planned, RunStatus::Confirmed));
        assert!(can_transition(RunStatus::Confirmed, RunStatus::Applying));
        assert!(can_transition(RunStatus::Applying, RunStatus::Applied));
    }

    #[test]
    fn cannot_skip_planning() {
        assert!(!can_transition(RunStatus::Queued, RunStatus::Planned));
        assert!(!can_transition(RunStatus::Pending, RunStatus::Applying));
    }

    #[test]
    fn errored_and_canceled_reachable_from_most_nonterminal_states() {
        for state in [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Planning,
            RunStatus::Planned,
            RunStatus::Confirmed,
            RunStatus::Applying,
        ] {
            assert!(can_transition(state, RunStatus::Errored));
        }
    }

    fn sample_run(status: RunStatus) -> Run {
        Run {
            id: Uuid::new_v4(),
            workspace_ref: Uuid::new_v4(),
            cv_ref: None,
            status: status.as_str().to_string(),
            message: String::new(),
            is_destroy: false,
            auto_apply: false,
            plan_only: false,
            source: "api".into(),
            terraform_version: "1.7.0".into(),
            resource_cpu: "500m".into(),
            resource_memory: "512Mi".into(),
            pool_ref: None,
            listener_ref: None,
            error_message: None,
            plan_started_at: None,
            plan_finished_at: None,
            apply_started_at: None,
            apply_finished_at: None,
            vcs_commit_sha: None,
            vcs_branch: None,
            vcs_pr_number: None,
            created_by: "tester".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn phase_projection_pending_queued() {
        let run = sample_run(RunStatus::Queued);
        let proj = phase_projection(&run);
        assert_eq!(proj.plan, PhasePresentation::Pending);
        assert_eq!(proj.apply, PhasePresentation::Unreachable);
    }

    #[test]
    fn phase_projection_applied() {
        let run = sample_run(RunStatus::Applied);
        let proj = phase_projection(&run);
        assert_eq!(proj.plan, PhasePresentation::Finished);
        assert_eq!(proj.apply, PhasePresentation::Finished);
    }

    #[test]
    fn phase_projection_canceled_mirrors_both_phases() {
        let run = sample_run(RunStatus::Canceled);
        let proj = phase_projection(&run);
        assert_eq!(proj.plan, PhasePresentation::Canceled);
        assert_eq!(proj.apply, PhasePresentation::Canceled);
    }
}
