//! Bearer token acquisition for the Web API.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::trace;

use crate::CrmError;

/// Default Entra authority used for the client-credentials flow.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

// Refresh this long before the token actually expires.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// How the client authenticates against the CRM.
#[derive(Clone)]
pub enum Credentials {
    /// Pre-issued bearer token, used as is.
    AccessToken(String),
    /// OAuth2 client credentials (application user in the CRM).
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::AccessToken(_) => f.write_str("AccessToken(***)"),
            Credentials::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub(crate) struct TokenSource {
    credentials: Credentials,
    authority: String,
    scope: String,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub(crate) fn new(credentials: Credentials, authority: &str, resource: &str) -> Self {
        Self {
            credentials,
            authority: authority.trim_end_matches('/').to_string(),
            scope: format!("{}/.default", resource.trim_end_matches('/')),
            cache: Mutex::new(None),
        }
    }

    /// Current bearer token, fetching a new one when the cache is stale.
    pub(crate) async fn bearer(&self, http: &reqwest::Client) -> Result<String, CrmError> {
        let (tenant_id, client_id, client_secret) = match &self.credentials {
            Credentials::AccessToken(t) => return Ok(t.clone()),
            Credentials::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        // Check cache without holding the lock across the fetch.
        {
            let cache = self.lock()?;
            if let Some(tok) = cache.as_ref() {
                if Instant::now() < tok.refresh_at {
                    return Ok(tok.value.clone());
                }
            }
        }

        trace!(tenant = %tenant_id, "crm-client: fetching access token");
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id);
        let resp = http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Token(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CrmError::Token(format!("malformed token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(EXPIRY_SKEW);
        let mut cache = self.lock()?;
        *cache = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<CachedToken>>, CrmError> {
        self.cache
            .lock()
            .map_err(|_| CrmError::Token("token cache poisoned".into()))
    }
}
