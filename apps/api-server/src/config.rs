//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time.

use axum::http::HeaderValue;
use crm_client::{Credentials, WebApiConfig};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Authentication provider mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProvider {
    /// Debug mode: accepts X-Debug-User header (DO NOT USE IN PRODUCTION)
    None,
    /// Microsoft Entra ID: verifies ID tokens issued by the tenant
    Entra,
}

impl AuthProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("entra") {
            Self::Entra
        } else {
            Self::None
        }
    }
}

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on restart)
    Memory,
    /// SQLite file-based storage
    Sqlite,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("sqlite") {
            Self::Sqlite
        } else {
            Self::Memory
        }
    }
}

/// Where CRM calls go.
#[derive(Debug, Clone)]
pub enum CrmSettings {
    /// In-process stand-in (local development, tests)
    Memory,
    /// Dataverse Web API
    WebApi(WebApiConfig),
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Signing key for anti-forgery tokens. Never printed.
#[derive(Clone)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn required(field: &'static str, when: &str) -> ConfigError {
    ConfigError {
        field,
        message: format!("Required when {when}"),
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 3001)
    pub port: u16,
    /// Authentication provider
    pub auth_provider: AuthProvider,
    /// Entra tenant (required for Entra auth)
    pub entra_tenant_id: Option<String>,
    /// Entra application (client) id, the expected token audience
    pub entra_client_id: Option<String>,
    /// Whether to skip ID token signature verification (dev only)
    pub insecure_skip_signature: bool,
    /// CORS allow origin
    pub cors_allow_origin: HeaderValue,
    /// Storage provider
    pub storage_provider: StorageProvider,
    /// SQLite database path (when using sqlite storage)
    pub db_path: PathBuf,
    /// CRM backend
    pub crm: CrmSettings,
    /// Anti-forgery signing key
    pub antiforgery_secret: Secret,
    /// True when no secret was configured and one was generated at startup
    pub antiforgery_secret_generated: bool,
    /// Anti-forgery token lifetime
    pub antiforgery_ttl: Duration,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Non-empty values only
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Port
        let port = match var("PORT") {
            Some(s) => s.trim().parse().map_err(|_| ConfigError {
                field: "PORT",
                message: format!("Invalid port '{s}'"),
            })?,
            None => 3001,
        };

        // Auth provider
        let auth_provider =
            AuthProvider::from_str(&var("AUTH_PROVIDER").unwrap_or_else(|| "none".into()));
        let entra_tenant_id = var("ENTRA_TENANT_ID");
        let entra_client_id = var("ENTRA_CLIENT_ID");

        // Validate: Entra auth requires both ENTRA_TENANT_ID and ENTRA_CLIENT_ID
        if auth_provider == AuthProvider::Entra {
            if entra_tenant_id.is_none() {
                return Err(required("ENTRA_TENANT_ID", "AUTH_PROVIDER=entra"));
            }
            if entra_client_id.is_none() {
                return Err(required("ENTRA_CLIENT_ID", "AUTH_PROVIDER=entra"));
            }
        }

        let insecure_skip_signature = var("ENTRA_AUTH_INSECURE_SKIP_SIGNATURE")
            .map(|v| http_common::is_truthy(&v))
            .unwrap_or(false);

        // CORS allow origin
        let cors_origin_str = var("CORS_ALLOW_ORIGIN").unwrap_or_else(|| "*".into());
        let cors_allow_origin = if cors_origin_str == "*" {
            HeaderValue::from_static("*")
        } else {
            HeaderValue::from_str(&cors_origin_str).map_err(|e| ConfigError {
                field: "CORS_ALLOW_ORIGIN",
                message: format!("Invalid header value '{}': {}", cors_origin_str, e),
            })?
        };

        // Storage provider
        let storage_provider =
            StorageProvider::from_str(&var("STORAGE_PROVIDER").unwrap_or_else(|| "sqlite".into()));
        let db_path = PathBuf::from(var("DB_PATH").unwrap_or_else(|| "./data/inquiries.db".into()));

        // CRM
        let crm = match var("CRM_PROVIDER") {
            Some(p) if p.eq_ignore_ascii_case("webapi") => {
                CrmSettings::WebApi(webapi_from_lookup(&var)?)
            }
            _ => CrmSettings::Memory,
        };

        // Anti-forgery
        let (antiforgery_secret, antiforgery_secret_generated) = match var("ANTIFORGERY_SECRET") {
            Some(s) => (Secret(s.into_bytes()), false),
            None if auth_provider == AuthProvider::Entra => {
                return Err(required("ANTIFORGERY_SECRET", "AUTH_PROVIDER=entra"));
            }
            None => (generated_secret(), true),
        };
        let antiforgery_ttl = Duration::from_secs(parse_secs(
            "ANTIFORGERY_TTL_SECS",
            var("ANTIFORGERY_TTL_SECS"),
            7200,
        )?);

        // Log format
        let log_format =
            LogFormat::from_str(&var("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            port,
            auth_provider,
            entra_tenant_id,
            entra_client_id,
            insecure_skip_signature,
            cors_allow_origin,
            storage_provider,
            db_path,
            crm,
            antiforgery_secret,
            antiforgery_secret_generated,
            antiforgery_ttl,
            log_format,
        })
    }

    /// Log warnings about insecure configuration.
    pub fn warn_if_insecure(&self) {
        if self.auth_provider == AuthProvider::None {
            tracing::warn!(
                "AUTH_PROVIDER=none: Using debug authentication via X-Debug-User header. \
                 DO NOT USE IN PRODUCTION."
            );
        }
        if self.insecure_skip_signature {
            tracing::warn!(
                "ENTRA_AUTH_INSECURE_SKIP_SIGNATURE is set: ID token signature verification \
                 is DISABLED. DO NOT USE IN PRODUCTION."
            );
        }
        if self.antiforgery_secret_generated {
            tracing::warn!(
                "ANTIFORGERY_SECRET not set: generated a per-process secret. Tokens will not \
                 survive a restart or work across instances."
            );
        }
        if matches!(self.crm, CrmSettings::Memory) {
            tracing::warn!("CRM_PROVIDER=memory: CRM records are kept in process memory only.");
        }
    }
}

fn webapi_from_lookup<F>(var: &F) -> Result<WebApiConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let url = var("CRM_URL").ok_or_else(|| required("CRM_URL", "CRM_PROVIDER=webapi"))?;

    let credentials = match var("CRM_ACCESS_TOKEN") {
        Some(token) => Credentials::AccessToken(token),
        None => Credentials::ClientSecret {
            tenant_id: var("CRM_TENANT_ID")
                .ok_or_else(|| required("CRM_TENANT_ID", "CRM_ACCESS_TOKEN is not set"))?,
            client_id: var("CRM_CLIENT_ID")
                .ok_or_else(|| required("CRM_CLIENT_ID", "CRM_ACCESS_TOKEN is not set"))?,
            client_secret: var("CRM_CLIENT_SECRET")
                .ok_or_else(|| required("CRM_CLIENT_SECRET", "CRM_ACCESS_TOKEN is not set"))?,
        },
    };

    let mut cfg = WebApiConfig::new(url, credentials);
    if let Some(v) = var("CRM_API_VERSION") {
        cfg.api_version = v.trim().trim_start_matches(['v', 'V']).to_string();
    }
    cfg.timeout = Duration::from_secs(parse_secs("CRM_TIMEOUT_SECS", var("CRM_TIMEOUT_SECS"), 30)?);
    Ok(cfg)
}

fn parse_secs(field: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(s) => match s.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError {
                field,
                message: format!("Expected a positive number of seconds, got '{s}'"),
            }),
        },
    }
}

fn generated_secret() -> Secret {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    Secret(bytes)
}
