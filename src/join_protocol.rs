//! Exchanges a pool-scoped join token for a CA-signed listener certificate,
//! plus the local no-token registration path used by the in-cluster default
//! listener.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use uuid::Uuid;

use crate::ca::CertificateAuthorityService;
use crate::error::{AppError, AppResult};
use crate::models::{AgentPool, AgentPoolToken};

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub pool_id: Uuid,
    pub join_token: String,
    pub listener_name: String,
    #[serde(default)]
    pub runner_definitions: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub listener_id: Uuid,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub ca_certificate_pem: String,
}

pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Step 1-5 of the join protocol. Token validation and consumption, cert
/// issuance, and listener row creation all happen in one transaction so a
/// crash mid-join never leaves a consumed token without an issued listener.
pub async fn join(ca: &CertificateAuthorityService, req: JoinRequest) -> AppResult<JoinResponse> {
    let pool = ca.pool();
    let mut tx = pool.begin().await?;

    let token_hash = hash_token(&req.join_token);
    let token_row: Option<AgentPoolToken> = sqlx::query_as(
        "SELECT id, pool_ref, token_hash, description, expires_at, max_uses, use_count, is_revoked, created_by, created_at
         FROM agent_pool_tokens WHERE token_hash = $1 FOR UPDATE",
    )
    .bind(&token_hash)
    .fetch_optional(&mut *tx)
    .await?;

    let token = token_row.ok_or(AppError::Unauthenticated)?;
    if !token.is_valid(Utc::now()) {
        return Err(AppError::Unauthenticated);
    }
    if token.pool_ref != req.pool_id {
        return Err(AppError::PermissionDenied);
    }

    let pool_row: Option<AgentPool> = sqlx::query_as(
        "SELECT id, name, description, service_account_name, org, created_at FROM agent_pools WHERE id = $1",
    )
    .bind(req.pool_id)
    .fetch_optional(&mut *tx)
    .await?;
    let agent_pool = pool_row.ok_or(AppError::NotFound)?;

    let leaf = ca.issue_listener_certificate(&req.listener_name, &agent_pool.name)?;

    sqlx::query("UPDATE agent_pool_tokens SET use_count = use_count + 1 WHERE id = $1")
        .bind(token.id)
        .execute(&mut *tx)
        .await?;

    let listener_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO runner_listeners (id, pool_ref, name, certificate_fingerprint, certificate_expires_at, runner_definitions, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(listener_id)
    .bind(req.pool_id)
    .bind(&req.listener_name)
    .bind(&leaf.fingerprint)
    .bind(leaf.expires_at)
    .bind(&req.runner_definitions)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        listener = %req.listener_name,
        pool = %agent_pool.name,
        fingerprint_prefix = &leaf.fingerprint[..16],
        "issued listener certificate",
    );

    Ok(JoinResponse {
        listener_id,
        certificate_pem: leaf.certificate_pem,
        private_key_pem: leaf.private_key_pem,
        ca_certificate_pem: ca.ca_cert_pem().to_string(),
    })
}

/// Resolves-or-creates the `default` pool and upserts a listener row named
/// `local`, with no certificate. Only reachable from control-plane startup,
/// never from an HTTP handler.
pub async fn register_local_listener(pool: &sqlx::PgPool) -> AppResult<Uuid> {
    let mut tx = pool.begin().await?;

    let pool_row = sqlx::query(
        "INSERT INTO agent_pools (id, name, org, created_at) VALUES ($1, 'default', 'local', $2)
         ON CONFLICT (name) DO UPDATE SET name = agent_pools.name
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    let pool_id: Uuid = pool_row.get("id");

    let listener_row = sqlx::query(
        "INSERT INTO runner_listeners (id, pool_ref, name, runner_definitions, created_at)
         VALUES ($1, $2, 'local', '[]'::jsonb, $3)
         ON CONFLICT (name) DO UPDATE SET pool_ref = EXCLUDED.pool_ref
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(pool_id)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    let listener_id: Uuid = listener_row.get("id");

    tx.commit().await?;
    Ok(listener_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_deterministic_sha256_hex() {
        let a = hash_token("abc123");
        let b = hash_token("abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_tokens_hash_differently() {
        assert_ne!(hash_token("token-a"), hash_token("token-b"));
    }
}
