//! entra-auth: Microsoft Entra ID token verification and anti-forgery tokens.
//!
//! Purpose
//! - Verify the ID tokens presented to the Inquiries API: RS256 signature
//!   against the tenant's JWKS, then audience, expiry, issuer and tenant.
//! - Map the verified token to the caller's contact id (`oid`) and login name.
//! - Issue and check the anti-forgery tokens required on form posts
//!   (see [`antiforgery`]).
//!
//! API
//! - `verify_async(id_token, expected_aud, tenant_id, skip_signature)` →
//!   `Result<VerifiedUser, AuthError>`
//!
//! Notes
//! - JWKS keys are fetched with `reqwest` and cached in memory for a short TTL
//!   to handle key rotation.
//! - `skip_signature` only validates claims; meant for local development.

pub mod antiforgery;

use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    /// Entra object id of the user; doubles as the CRM contact id.
    pub user_id: Uuid,
    pub user_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed token")]
    Malformed,
    #[error("invalid token payload: {0}")]
    InvalidPayload(&'static str),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("token expired")]
    Expired,
    #[error("audience mismatch")]
    BadAudience,
    #[error("issuer mismatch")]
    BadIssuer,
    #[error("tenant not allowed")]
    TenantNotAllowed,
    #[error("network or jwks fetch error")]
    Network,
}

#[derive(Debug, Deserialize)]
struct Claims {
    aud: serde_json::Value, // can be string or array
    exp: Option<u64>,
    tid: Option<String>,
    oid: Option<String>,
    preferred_username: Option<String>,
    name: Option<String>,
}

const AUTHORITY: &str = "https://login.microsoftonline.com";

fn issuer_for(tenant_id: &str) -> String {
    format!("{AUTHORITY}/{tenant_id}/v2.0")
}

/// Verify an Entra ID token issued for `expected_aud` in `tenant_id`.
pub async fn verify_async(
    id_token: &str,
    expected_aud: &str,
    tenant_id: &str,
    skip_signature: bool,
) -> Result<VerifiedUser, AuthError> {
    if skip_signature {
        trace!("entra-auth: insecure mode, skipping signature verification");
        return verify_claims_only(id_token, expected_aud, tenant_id);
    }

    let header = decode_header(id_token).map_err(|_| AuthError::Malformed)?;
    if header.alg != Algorithm::RS256 {
        return Err(AuthError::Malformed);
    }
    let kid = header.kid.ok_or(AuthError::Malformed)?;
    let key = jwks_get_key_async(tenant_id, &kid)
        .await
        .map_err(|_| AuthError::Network)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[expected_aud]);
    validation.set_issuer(&[issuer_for(tenant_id)]);

    let token_data = decode::<Claims>(id_token, &key, &validation).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::InvalidToken
        | jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        jsonwebtoken::errors::ErrorKind::InvalidAudience => AuthError::BadAudience,
        jsonwebtoken::errors::ErrorKind::InvalidIssuer => AuthError::BadIssuer,
        _ => AuthError::Malformed,
    })?;

    apply_tenant_checks(token_data.claims, tenant_id)
}

fn verify_claims_only(
    id_token: &str,
    expected_aud: &str,
    tenant_id: &str,
) -> Result<VerifiedUser, AuthError> {
    let parts: Vec<&str> = id_token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Malformed);
    }
    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1].as_bytes())
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidPayload("json"))?;

    match &claims.aud {
        serde_json::Value::String(s) if s == expected_aud => {}
        serde_json::Value::Array(arr) if arr.iter().any(|v| v.as_str() == Some(expected_aud)) => {}
        _ => return Err(AuthError::BadAudience),
    }

    if let Some(exp) = claims.exp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if exp <= now {
            return Err(AuthError::Expired);
        }
    }

    apply_tenant_checks(claims, tenant_id)
}

fn apply_tenant_checks(claims: Claims, tenant_id: &str) -> Result<VerifiedUser, AuthError> {
    let tid = claims.tid.ok_or(AuthError::InvalidPayload("tid"))?;
    if !tid.eq_ignore_ascii_case(tenant_id) {
        return Err(AuthError::TenantNotAllowed);
    }

    let oid = claims.oid.ok_or(AuthError::InvalidPayload("oid"))?;
    let user_id = Uuid::parse_str(&oid).map_err(|_| AuthError::InvalidPayload("oid"))?;
    let user_name = claims
        .preferred_username
        .or(claims.name)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| user_id.to_string());

    Ok(VerifiedUser { user_id, user_name })
}

// ---- JWKS cache & fetch ----

const JWKS_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

struct JwksCache {
    tenant: String,
    fetched_at: SystemTime,
    keys: HashMap<String, DecodingKey>,
}

static CACHE: LazyLock<Mutex<JwksCache>> = LazyLock::new(|| {
    Mutex::new(JwksCache {
        tenant: String::new(),
        fetched_at: UNIX_EPOCH,
        keys: HashMap::new(),
    })
});

fn cache() -> MutexGuard<'static, JwksCache> {
    // The cache only holds fetched keys; a poisoned guard is still usable.
    CACHE.lock().unwrap_or_else(|e| e.into_inner())
}

async fn jwks_get_key_async(tenant_id: &str, kid: &str) -> Result<DecodingKey, ()> {
    // Test/dev override takes precedence if present
    if let Some(map) = jwks_override() {
        let mut cache = cache();
        cache.tenant = tenant_id.to_string();
        cache.keys = map;
        cache.fetched_at = SystemTime::now();
        return cache.keys.get(kid).cloned().ok_or(());
    }

    {
        let cache = cache();
        let fresh = cache.tenant == tenant_id && cache.fetched_at + JWKS_TTL > SystemTime::now();
        if fresh {
            if let Some(k) = cache.keys.get(kid) {
                return Ok(k.clone());
            }
        }
    }

    // Fetch outside the lock
    let new_map = fetch_jwks_map_async(tenant_id).await.map_err(|_| ())?;
    let mut cache = cache();
    cache.tenant = tenant_id.to_string();
    cache.keys = new_map;
    cache.fetched_at = SystemTime::now();
    cache.keys.get(kid).cloned().ok_or(())
}

fn jwks_override() -> Option<HashMap<String, DecodingKey>> {
    let val = std::env::var("ENTRA_AUTH_JWKS_OVERRIDE").ok()?;
    let jwks: Jwks = serde_json::from_str(&val).ok()?;
    Some(rsa_keys(jwks))
}

fn rsa_keys(jwks: Jwks) -> HashMap<String, DecodingKey> {
    let mut map = HashMap::new();
    for k in jwks.keys.into_iter() {
        if k.kty == "RSA" {
            if let (Some(n), Some(e)) = (k.n.as_deref(), k.e.as_deref()) {
                if let Ok(key) = DecodingKey::from_rsa_components(n, e) {
                    map.insert(k.kid, key);
                }
            }
        }
    }
    map
}

async fn fetch_jwks_map_async(
    tenant_id: &str,
) -> Result<HashMap<String, DecodingKey>, reqwest::Error> {
    let url = format!("{AUTHORITY}/{tenant_id}/discovery/v2.0/keys");
    let resp = reqwest::Client::new().get(url).send().await?;
    let jwks: Jwks = resp.error_for_status()?.json().await?;
    Ok(rsa_keys(jwks))
}

#[cfg(test)]
fn reset_jwks_cache() {
    let mut cache = cache();
    cache.tenant.clear();
    cache.fetched_at = UNIX_EPOCH;
    cache.keys.clear();
}
