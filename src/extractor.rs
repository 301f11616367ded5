use axum::async_trait;
use axum::{
    extract::{Extension, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::ca::{self, CertificateAuthorityService};
use crate::models::RunnerListener;

const CLIENT_CERT_HEADER: &str = "X-Terrapod-Client-Cert";

/// The authenticated identity of a listener, extracted from its client
/// certificate. Verification follows the five steps at the HTTP boundary:
/// parse, verify against the CA, check validity window, resolve by CN,
/// compare fingerprints.
pub struct ListenerIdentity {
    pub listener_id: Uuid,
    pub name: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for ListenerIdentity
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(CLIENT_CERT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "missing client certificate".into()))?
            .to_string();

        let Extension(ca_service) = Extension::<CertificateAuthorityService>::from_request_parts(parts, state)
            .await
            .map_err(|_| (StatusCode::UNAUTHORIZED, "CA not configured".into()))?;
        let Extension(pool) = Extension::<PgPool>::from_request_parts(parts, state)
            .await
            .map_err(|_| (StatusCode::UNAUTHORIZED, "database not configured".into()))?;

        let (cn, fingerprint) = ca::verify_client_certificate(ca_service.ca_cert_pem(), &header_value)
            .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid client certificate".into()))?;

        let listener: Option<RunnerListener> = sqlx::query_as(
            "SELECT id, pool_ref, name, certificate_fingerprint, certificate_expires_at, runner_definitions, created_at
             FROM runner_listeners WHERE name = $1",
        )
        .bind(&cn)
        .fetch_optional(&pool)
        .await
        .map_err(|_| (StatusCode::UNAUTHORIZED, "lookup failed".into()))?;

        let listener = listener.ok_or((StatusCode::UNAUTHORIZED, "unknown listener".into()))?;

        if listener.certificate_fingerprint.as_deref() != Some(fingerprint.as_str()) {
            return Err((StatusCode::UNAUTHORIZED, "certificate fingerprint mismatch".into()));
        }

        Ok(ListenerIdentity { listener_id: listener.id, name: listener.name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        let mut parts = request.into_parts().0;
        let res = ListenerIdentity::from_request_parts(&mut parts, &()).await;
        assert!(res.is_err());
    }
}
