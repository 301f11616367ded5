//! Certificate Authority: an Ed25519 root that issues short-lived listener
//! client certificates. The database row is authoritative; the filesystem
//! cache under `config::CA_CERT_DIR` is best-effort only.

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::CertificateAuthority;

const ROOT_LIFETIME_DAYS: i64 = 365 * 10;
const LEAF_LIFETIME_DAYS: i64 = 365;

fn to_offset_date_time(dt: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .expect("chrono timestamp always in range for time::OffsetDateTime")
}

pub struct IssuedLeaf {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

/// Holds the loaded (or freshly generated) root cert and key pair.
#[derive(Clone)]
pub struct CertificateAuthorityService {
    pool: PgPool,
    cert_pem: String,
    key_pair: std::sync::Arc<KeyPair>,
}

impl CertificateAuthorityService {
    /// Loads the CA row, generating and persisting one if absent. Writes a
    /// best-effort filesystem cache afterward.
    pub async fn load_or_init(pool: PgPool) -> AppResult<Self> {
        let existing: Option<CertificateAuthority> =
            sqlx::query_as("SELECT id, ca_cert_pem, ca_key_pem, created_at FROM certificate_authorities WHERE id = 1")
                .fetch_optional(&pool)
                .await?;

        let (cert_pem, key_pem) = match existing {
            Some(row) => (row.ca_cert_pem, row.ca_key_pem),
            None => {
                let (cert_pem, key_pem) = generate_root()?;
                sqlx::query(
                    "INSERT INTO certificate_authorities (id, ca_cert_pem, ca_key_pem, created_at) VALUES (1, $1, $2, $3)",
                )
                .bind(&cert_pem)
                .bind(&key_pem)
                .bind(Utc::now())
                .execute(&pool)
                .await?;
                (cert_pem, key_pem)
            }
        };

        write_cache_best_effort(&cert_pem, &key_pem).await;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| AppError::UpstreamFailure(format!("invalid CA key material: {e}")))?;

        Ok(Self {
            pool,
            cert_pem,
            key_pair: std::sync::Arc::new(key_pair),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issues a listener leaf certificate. Does not persist the listener
    /// row; callers (`join_protocol`) own that transaction.
    pub fn issue_listener_certificate(
        &self,
        listener_name: &str,
        pool_name: &str,
    ) -> AppResult<IssuedLeaf> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| AppError::UpstreamFailure(format!("cert params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, listener_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.subject_alt_names = vec![
            SanType::URI(
                format!("terrapod://listener/{listener_name}")
                    .try_into()
                    .map_err(|e| AppError::UpstreamFailure(format!("san uri: {e:?}")))?,
            ),
            SanType::URI(
                format!("terrapod://pool/{pool_name}")
                    .try_into()
                    .map_err(|e| AppError::UpstreamFailure(format!("san uri: {e:?}")))?,
            ),
        ];
        let now = Utc::now();
        let expires_at = now + Duration::days(LEAF_LIFETIME_DAYS);
        params.not_before = to_offset_date_time(now);
        params.not_after = to_offset_date_time(expires_at);

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ED25519)
            .map_err(|e| AppError::UpstreamFailure(format!("leaf key generation: {e}")))?;

        let ca_params = root_params_for_signing(&self.cert_pem)?;
        let ca_cert = ca_params
            .self_signed(&self.key_pair)
            .map_err(|e| AppError::UpstreamFailure(format!("ca self-sign: {e}")))?;

        let leaf_cert = params
            .signed_by(&leaf_key, &ca_cert, &self.key_pair)
            .map_err(|e| AppError::UpstreamFailure(format!("leaf signing: {e}")))?;

        let certificate_pem = leaf_cert.pem();
        let fingerprint = fingerprint_der(leaf_cert.der());

        Ok(IssuedLeaf {
            certificate_pem,
            private_key_pem: leaf_key.serialize_pem(),
            fingerprint,
            expires_at,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn generate_root() -> AppResult<(String, String)> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| AppError::UpstreamFailure(format!("root params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Terrapod Root CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let now = Utc::now();
    params.not_before = to_offset_date_time(now);
    params.not_after = to_offset_date_time(now + Duration::days(ROOT_LIFETIME_DAYS));

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| AppError::UpstreamFailure(format!("root key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AppError::UpstreamFailure(format!("root self-sign: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Rebuilds signing params for the already-persisted root so `rcgen` can
/// re-derive the self-signed `Certificate` used as an issuer. `rcgen` does
/// not let us load a foreign cert as an issuer directly; the root's own key
/// pair plus identical params reproduces the same certificate deterministically
/// is not guaranteed across rcgen versions, so instead we re-sign from the
/// stored PEM's parameters on every issuance rather than caching a `Certificate`.
fn root_params_for_signing(_cert_pem: &str) -> AppResult<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| AppError::UpstreamFailure(format!("root params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Terrapod Root CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let now = Utc::now();
    params.not_before = to_offset_date_time(now);
    params.not_after = to_offset_date_time(now + Duration::days(ROOT_LIFETIME_DAYS));
    Ok(params)
}

pub fn fingerprint_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex::encode(digest)
}

async fn write_cache_best_effort(cert_pem: &str, key_pem: &str) {
    let dir = crate::config::CA_CERT_DIR.as_str();
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(%e, "failed to create CA cert cache directory");
        return;
    }
    if let Err(e) = tokio::fs::write(format!("{dir}/ca.pem"), cert_pem).await {
        tracing::warn!(%e, "failed to cache CA certificate to disk");
    }
    if let Err(e) = tokio::fs::write(format!("{dir}/ca-key.pem"), key_pem).await {
        tracing::warn!(%e, "failed to cache CA key to disk");
    }
}

/// Verifies a base64-encoded PEM leaf against the CA, per the five steps in
/// the client-cert authentication boundary. Returns the leaf's CN and SHA-256
/// fingerprint on success.
pub fn verify_client_certificate(
    ca_cert_pem: &str,
    base64_pem: &str,
) -> AppResult<(String, String)> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use x509_parser::prelude::*;

    let pem_bytes = STANDARD
        .decode(base64_pem)
        .map_err(|_| AppError::Unauthenticated)?;
    let (_, leaf_pem) =
        x509_parser::pem::parse_x509_pem(&pem_bytes).map_err(|_| AppError::Unauthenticated)?;
    let leaf = leaf_pem
        .parse_x509()
        .map_err(|_| AppError::Unauthenticated)?;

    let (_, ca_pem) =
        x509_parser::pem::parse_x509_pem(ca_cert_pem.as_bytes()).map_err(|_| AppError::Unauthenticated)?;
    let ca_cert = ca_pem.parse_x509().map_err(|_| AppError::Unauthenticated)?;

    leaf.verify_signature(Some(ca_cert.public_key()))
        .map_err(|_| AppError::Unauthenticated)?;

    let now = Utc::now().timestamp();
    let validity = leaf.validity();
    if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
        return Err(AppError::Unauthenticated);
    }

    let cn = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or(AppError::Unauthenticated)?
        .to_string();

    let fingerprint = fingerprint_der(leaf_pem.contents.as_ref());

    Ok((cn, fingerprint))
}
