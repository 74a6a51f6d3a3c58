//! Anti-forgery tokens for state-changing form posts.
//!
//! A token is an HS256 JWT bound to the signed-in contact. Forms carry it in
//! `__RequestVerificationToken`; scripted clients may send the
//! `RequestVerificationToken` header instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FORM_FIELD: &str = "__RequestVerificationToken";
pub const HEADER_NAME: &str = "requestverificationtoken";

const PURPOSE: &str = "antiforgery";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AntiforgeryError {
    #[error("anti-forgery token missing")]
    Missing,
    #[error("anti-forgery token invalid")]
    Invalid,
    #[error("anti-forgery token expired")]
    Expired,
    #[error("anti-forgery token issued to another user")]
    UserMismatch,
    #[error("anti-forgery token could not be signed: {0}")]
    Signing(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    iat: u64,
    exp: u64,
    purpose: String,
    nonce: String,
}

/// Issues and checks tokens with one shared secret.
#[derive(Clone)]
pub struct Antiforgery {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for Antiforgery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Antiforgery")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl Antiforgery {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Fresh token for `user`, valid for the configured TTL from `now`.
    pub fn issue(&self, user: Uuid, now: SystemTime) -> Result<String, AntiforgeryError> {
        let iat = unix_secs(now);
        let claims = TokenClaims {
            sub: user.to_string(),
            iat,
            exp: iat + self.ttl.as_secs(),
            purpose: PURPOSE.to_string(),
            nonce: Uuid::new_v4().simple().to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AntiforgeryError::Signing(e.to_string()))
    }

    /// Check a submitted token against the signed-in `user` at `now`.
    pub fn validate(
        &self,
        token: Option<&str>,
        user: Uuid,
        now: SystemTime,
    ) -> Result<(), AntiforgeryError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AntiforgeryError::Missing)?;

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock below.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<TokenClaims>(token, &self.decoding, &validation)
            .map_err(|_| AntiforgeryError::Invalid)?;
        let claims = data.claims;

        if claims.purpose != PURPOSE {
            return Err(AntiforgeryError::Invalid);
        }
        if claims.exp <= unix_secs(now) {
            return Err(AntiforgeryError::Expired);
        }
        let subject = Uuid::parse_str(&claims.sub).map_err(|_| AntiforgeryError::Invalid)?;
        if subject != user {
            return Err(AntiforgeryError::UserMismatch);
        }
        Ok(())
    }
}
