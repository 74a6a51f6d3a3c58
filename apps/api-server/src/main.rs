//! api-server: HTTP front end for the Inquiries workspace.
//!
//! Serves the `/Inquiries` routes on behalf of the signed-in contact:
//! - Auth: Entra ID token verification or disabled (debug) mode via X-Debug-User.
//! - Storage: In-memory or SQLite (file) when the `sqlite` feature is enabled.
//! - CRM: in-process stand-in or the Dataverse Web API.
//! - Form posts carry an anti-forgery token bound to the caller.
//!
//! Run:
//! ```bash
//! # pretty logs (default); PORT optional
//! cargo run -p api-server
//!
//! # against a Dataverse environment
//! CRM_PROVIDER=webapi CRM_URL=https://contoso.crm4.dynamics.com \
//! CRM_TENANT_ID=... CRM_CLIENT_ID=... CRM_CLIENT_SECRET=... \
//!   cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.
//!

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::http::HeaderValue;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Form, Json, Router,
};
use crm_client::WebApiCrm;
use domain::adapters::memory_crm::InMemoryCrm;
use domain::adapters::memory_repo::InMemoryInquiryRepo;
use domain::service::InquiryService;
use domain::{
    ColumnSet, ContactId, CoreError, CrmService, CurrentUser, Entity, Inquiry, InquiryEdit,
    InquiryId, InquiryRepository, NewInquiry, UuidV4Generator,
};
use entra_auth::antiforgery::{Antiforgery, AntiforgeryError, HEADER_NAME};
use entra_auth::AuthError as EntraAuthError;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

const DEBUG_USER_HEADER: &str = "x-debug-user";
const DEBUG_USER_NAME_HEADER: &str = "x-debug-user-name";
const INDEX_PATH: &str = "/Inquiries";

// Local store supporting memory or sqlite (feature-gated).
enum AnyRepo {
    Memory(InMemoryInquiryRepo),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite_adapter::SqliteRepo),
}

impl AnyRepo {
    fn memory() -> Self {
        Self::Memory(InMemoryInquiryRepo::new())
    }
}

impl InquiryRepository for AnyRepo {
    fn get(&self, id: &InquiryId) -> Result<Option<Inquiry>, CoreError> {
        match self {
            AnyRepo::Memory(r) => r.get(id),
            #[cfg(feature = "sqlite")]
            AnyRepo::Sqlite(r) => r.get(id),
        }
    }

    fn insert(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
        match self {
            AnyRepo::Memory(r) => r.insert(inquiry),
            #[cfg(feature = "sqlite")]
            AnyRepo::Sqlite(r) => r.insert(inquiry),
        }
    }

    fn list_by_contact(&self, contact: &ContactId) -> Result<Vec<Inquiry>, CoreError> {
        match self {
            AnyRepo::Memory(r) => r.list_by_contact(contact),
            #[cfg(feature = "sqlite")]
            AnyRepo::Sqlite(r) => r.list_by_contact(contact),
        }
    }

    fn update(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
        match self {
            AnyRepo::Memory(r) => r.update(inquiry),
            #[cfg(feature = "sqlite")]
            AnyRepo::Sqlite(r) => r.update(inquiry),
        }
    }

    fn delete(&self, id: &InquiryId) -> Result<(), CoreError> {
        match self {
            AnyRepo::Memory(r) => r.delete(id),
            #[cfg(feature = "sqlite")]
            AnyRepo::Sqlite(r) => r.delete(id),
        }
    }

    fn exists(&self, id: &InquiryId) -> Result<bool, CoreError> {
        match self {
            AnyRepo::Memory(r) => r.exists(id),
            #[cfg(feature = "sqlite")]
            AnyRepo::Sqlite(r) => r.exists(id),
        }
    }
}

// CRM backend chosen at startup.
enum AnyCrm {
    Memory(Arc<InMemoryCrm>),
    WebApi(WebApiCrm),
}

impl CrmService for AnyCrm {
    async fn retrieve(
        &self,
        logical_name: &str,
        id: Uuid,
        columns: &ColumnSet,
    ) -> Result<Entity, CoreError> {
        match self {
            AnyCrm::Memory(c) => c.retrieve(logical_name, id, columns).await,
            AnyCrm::WebApi(c) => c.retrieve(logical_name, id, columns).await,
        }
    }

    async fn create(&self, entity: &Entity) -> Result<Uuid, CoreError> {
        match self {
            AnyCrm::Memory(c) => c.create(entity).await,
            AnyCrm::WebApi(c) => c.create(entity).await,
        }
    }

    async fn update(&self, entity: &Entity) -> Result<(), CoreError> {
        match self {
            AnyCrm::Memory(c) => c.update(entity).await,
            AnyCrm::WebApi(c) => c.update(entity).await,
        }
    }

    async fn delete(&self, logical_name: &str, id: Uuid) -> Result<(), CoreError> {
        match self {
            AnyCrm::Memory(c) => c.delete(logical_name, id).await,
            AnyCrm::WebApi(c) => c.delete(logical_name, id).await,
        }
    }
}

type Service = InquiryService<AnyRepo, AnyCrm, UuidV4Generator>;

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
    antiforgery: Antiforgery,
    auth_provider: config::AuthProvider,
    entra_tenant_id: Option<String>,
    entra_client_id: Option<String>,
    insecure_skip_signature: bool,
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    info!(version = %domain::about(), "starting api-server");
    cfg.warn_if_insecure();

    let repo = match build_repo(&cfg) {
        Ok(r) => r,
        Err(e) => {
            error!(err = %e, "failed to open local store");
            std::process::exit(1);
        }
    };
    let crm = match build_crm(&cfg) {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to configure crm client");
            std::process::exit(1);
        }
    };

    let state = AppState {
        service: Arc::new(InquiryService::new(repo, crm, UuidV4Generator)),
        antiforgery: Antiforgery::new(cfg.antiforgery_secret.as_bytes(), cfg.antiforgery_ttl),
        auth_provider: cfg.auth_provider.clone(),
        entra_tenant_id: cfg.entra_tenant_id.clone(),
        entra_client_id: cfg.entra_client_id.clone(),
        insecure_skip_signature: cfg.insecure_skip_signature,
    };

    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    let mut app = routes(state)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    // CORS - already validated in Config::from_env()
    let cors = if cfg.cors_allow_origin == HeaderValue::from_static("*") {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list([cfg.cors_allow_origin]))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static(DEBUG_USER_HEADER),
                axum::http::HeaderName::from_static(DEBUG_USER_NAME_HEADER),
                axum::http::HeaderName::from_static(HEADER_NAME),
            ])
    };
    app = app.layer(cors);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "api-server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(err = %e, "server error");
        std::process::exit(1);
    }
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route("/Inquiries", get(list_inquiries))
        .route("/Inquiries/Index", get(list_inquiries))
        .route("/Inquiries/Create", get(create_form).post(create_inquiry))
        .route("/Inquiries/Details", get(missing_id))
        .route("/Inquiries/Details/:id", get(inquiry_details))
        .route("/Inquiries/Edit", get(missing_id))
        .route("/Inquiries/Edit/:id", get(edit_form).post(edit_inquiry))
        .route("/Inquiries/Delete", get(missing_id))
        .route("/Inquiries/Delete/:id", get(delete_form).post(delete_inquiry))
        .fallback(not_found)
        .with_state(state)
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Construct the local store based on config and feature flags.
fn build_repo(cfg: &config::Config) -> Result<AnyRepo, CoreError> {
    match cfg.storage_provider {
        #[cfg(feature = "sqlite")]
        config::StorageProvider::Sqlite => Ok(AnyRepo::Sqlite(
            sqlite_adapter::SqliteRepo::open_path(&cfg.db_path)?,
        )),
        #[cfg(not(feature = "sqlite"))]
        config::StorageProvider::Sqlite => {
            warn!("built without the sqlite feature; using in-memory storage");
            Ok(AnyRepo::memory())
        }
        config::StorageProvider::Memory => Ok(AnyRepo::memory()),
    }
}

fn build_crm(cfg: &config::Config) -> Result<AnyCrm, crm_client::CrmError> {
    match &cfg.crm {
        config::CrmSettings::Memory => Ok(AnyCrm::Memory(Arc::new(InMemoryCrm::new()))),
        config::CrmSettings::WebApi(web) => {
            let client = WebApiCrm::new(web.clone())?;
            info!(api_root = %client.api_root(), "using dataverse web api");
            Ok(AnyCrm::WebApi(client))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

enum AuthHttp {
    Unauthorized,
    Forbidden,
}

enum ApiError {
    Auth(AuthHttp),
    Antiforgery(AntiforgeryError),
    Core(CoreError),
    Internal(String),
}

impl From<AuthHttp> for ApiError {
    fn from(e: AuthHttp) -> Self {
        ApiError::Auth(e)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl From<AntiforgeryError> for ApiError {
    fn from(e: AntiforgeryError) -> Self {
        ApiError::Antiforgery(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(AuthHttp::Unauthorized) => (
                StatusCode::UNAUTHORIZED,
                Json(http_common::json_error_with_message(
                    "unauthorized",
                    "missing or invalid token",
                )),
            )
                .into_response(),
            ApiError::Auth(AuthHttp::Forbidden) => (
                StatusCode::FORBIDDEN,
                Json(http_common::json_error_with_message(
                    "forbidden",
                    "tenant not allowed",
                )),
            )
                .into_response(),
            ApiError::Antiforgery(e) => {
                warn!(err = %e, "anti-forgery check failed");
                (
                    StatusCode::BAD_REQUEST,
                    Json(http_common::json_error_with_message(
                        "invalid_antiforgery_token",
                        &e.to_string(),
                    )),
                )
                    .into_response()
            }
            ApiError::Core(CoreError::NotFound) | ApiError::Core(CoreError::InvalidId(_)) => {
                not_found_response()
            }
            ApiError::Core(CoreError::AlreadyExists) => {
                (StatusCode::CONFLICT, Json(http_common::json_err("conflict"))).into_response()
            }
            ApiError::Core(CoreError::Validation { message, .. }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(http_common::json_error_with_message(
                    "validation_failed",
                    &message,
                )),
            )
                .into_response(),
            ApiError::Core(e) => {
                error!(err = %e, "request failed");
                internal_response()
            }
            ApiError::Internal(msg) => {
                error!(err = %msg, "request failed");
                internal_response()
            }
        }
    }
}

fn not_found_response() -> Response {
    (StatusCode::NOT_FOUND, Json(http_common::json_err("not_found"))).into_response()
}

fn internal_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(http_common::json_err("internal")),
    )
        .into_response()
}

// ============================================================================
// Auth & anti-forgery
// ============================================================================

async fn verify_request_user(headers: &HeaderMap, state: &AppState) -> Result<CurrentUser, AuthHttp> {
    if state.auth_provider == config::AuthProvider::None {
        let raw = headers
            .get(DEBUG_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthHttp::Unauthorized)?;
        let contact_id = ContactId::parse(raw.trim()).map_err(|_| AuthHttp::Unauthorized)?;
        let user_name = headers
            .get(DEBUG_USER_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| contact_id.to_string());
        return Ok(CurrentUser {
            contact_id,
            user_name,
        });
    }

    // Entra mode
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthHttp::Unauthorized)?;
    let token = auth.strip_prefix("Bearer ").ok_or(AuthHttp::Unauthorized)?;
    // Both are validated at startup when auth_provider=Entra
    let aud = state
        .entra_client_id
        .as_deref()
        .ok_or(AuthHttp::Unauthorized)?;
    let tenant = state
        .entra_tenant_id
        .as_deref()
        .ok_or(AuthHttp::Unauthorized)?;
    match entra_auth::verify_async(token, aud, tenant, state.insecure_skip_signature).await {
        Ok(u) => Ok(CurrentUser {
            contact_id: ContactId::new(u.user_id),
            user_name: u.user_name,
        }),
        Err(EntraAuthError::TenantNotAllowed) => {
            warn!("auth failed: tenant not allowed");
            Err(AuthHttp::Forbidden)
        }
        Err(e) => {
            warn!(err = ?e, "auth failed");
            Err(AuthHttp::Unauthorized)
        }
    }
}

fn check_antiforgery(
    state: &AppState,
    headers: &HeaderMap,
    form_token: Option<&str>,
    user: &CurrentUser,
) -> Result<(), ApiError> {
    let header_token = headers.get(HEADER_NAME).and_then(|v| v.to_str().ok());
    let token = http_common::pick_verification_token(form_token, header_token);
    state
        .antiforgery
        .validate(token, user.contact_id.as_uuid(), SystemTime::now())?;
    Ok(())
}

fn issue_token(state: &AppState, user: &CurrentUser) -> Result<String, ApiError> {
    state
        .antiforgery
        .issue(user.contact_id.as_uuid(), SystemTime::now())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Deserialize)]
struct InquiryForm {
    #[serde(default)]
    inquiry_id: Option<String>,
    #[serde(default)]
    question: String,
    #[serde(default, rename = "__RequestVerificationToken")]
    verification_token: Option<String>,
}

#[derive(Deserialize)]
struct DeleteForm {
    #[serde(default, rename = "__RequestVerificationToken")]
    verification_token: Option<String>,
}

#[derive(Serialize)]
struct InquiryOut {
    inquiry_id: String,
    question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    contact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

impl From<Inquiry> for InquiryOut {
    fn from(i: Inquiry) -> Self {
        Self {
            inquiry_id: i.id.to_string(),
            question: i.question,
            response: i.response,
            contact_id: i.contact_id.to_string(),
            user_id: i.user_id,
        }
    }
}

#[derive(Serialize)]
struct ListOut {
    inquiries: Vec<InquiryOut>,
    total: usize,
}

#[derive(Serialize)]
struct FormValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    inquiry_id: Option<String>,
    question: String,
}

/// Model behind the create/edit/delete pages.
#[derive(Serialize)]
struct FormView {
    #[serde(skip_serializing_if = "Option::is_none")]
    inquiry: Option<InquiryOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<FormValues>,
    antiforgery_token: String,
}

fn redirect_to_index() -> Response {
    Redirect::to(INDEX_PATH).into_response()
}

// Form re-render after a failed validation: submitted values, message, fresh token.
fn validation_failed(
    state: &AppState,
    user: &CurrentUser,
    field: &str,
    message: &str,
    values: FormValues,
) -> Result<Response, ApiError> {
    let token = issue_token(state, user)?;
    warn!(field, reason = message, "validation failed");
    let body = serde_json::json!({
        "error": {"code": "validation_failed", "message": message, "field": field},
        "values": values,
        "antiforgery_token": token,
    });
    Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response())
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_inquiries(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    let inquiries: Vec<InquiryOut> = state
        .service
        .list(&user)?
        .into_iter()
        .map(InquiryOut::from)
        .collect();
    info!(contact = %user.contact_id, count = inquiries.len(), "list ok");
    let total = inquiries.len();
    Ok((StatusCode::OK, Json(ListOut { inquiries, total })).into_response())
}

async fn inquiry_details(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    let id = InquiryId::parse(&id)?;
    let inquiry = state.service.details(&id, &user).await?;
    info!(%id, "details ok");
    Ok((StatusCode::OK, Json(InquiryOut::from(inquiry))).into_response())
}

async fn create_form(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    let view = FormView {
        inquiry: None,
        values: Some(FormValues {
            inquiry_id: None,
            question: String::new(),
        }),
        antiforgery_token: issue_token(&state, &user)?,
    };
    Ok((StatusCode::OK, Json(view)).into_response())
}

async fn create_inquiry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<InquiryForm>,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    check_antiforgery(&state, &headers, form.verification_token.as_deref(), &user)?;

    // Only the question is bound; ids and owner come from the server.
    let input = NewInquiry {
        question: form.question.clone(),
    };
    match state.service.create(input, &user).await {
        Ok(inquiry) => {
            info!(id = %inquiry.id, contact = %user.contact_id, "create ok");
            Ok(redirect_to_index())
        }
        Err(CoreError::Validation { field, message }) => validation_failed(
            &state,
            &user,
            field,
            &message,
            FormValues {
                inquiry_id: None,
                question: form.question,
            },
        ),
        Err(e) => Err(e.into()),
    }
}

async fn edit_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    let id = InquiryId::parse(&id)?;
    let inquiry = state.service.details(&id, &user).await?;
    let view = FormView {
        inquiry: Some(inquiry.into()),
        values: None,
        antiforgery_token: issue_token(&state, &user)?,
    };
    Ok((StatusCode::OK, Json(view)).into_response())
}

async fn edit_inquiry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Form(form): Form<InquiryForm>,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    check_antiforgery(&state, &headers, form.verification_token.as_deref(), &user)?;

    let route_id = InquiryId::parse(&id)?;
    let payload_id = match form.inquiry_id.as_deref().map(InquiryId::parse) {
        Some(Ok(pid)) => pid,
        _ => {
            warn!(%route_id, "edit without a usable inquiry_id");
            return Err(CoreError::NotFound.into());
        }
    };
    let input = InquiryEdit {
        id: payload_id,
        question: form.question.clone(),
    };
    match state.service.edit(&route_id, input, &user).await {
        Ok(inquiry) => {
            info!(id = %inquiry.id, "edit ok");
            Ok(redirect_to_index())
        }
        Err(CoreError::Validation { field, message }) => validation_failed(
            &state,
            &user,
            field,
            &message,
            FormValues {
                inquiry_id: Some(route_id.to_string()),
                question: form.question,
            },
        ),
        Err(e) => Err(e.into()),
    }
}

async fn delete_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    let id = InquiryId::parse(&id)?;
    let inquiry = state.service.find(&id, &user)?;
    let view = FormView {
        inquiry: Some(inquiry.into()),
        values: None,
        antiforgery_token: issue_token(&state, &user)?,
    };
    Ok((StatusCode::OK, Json(view)).into_response())
}

async fn delete_inquiry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Form(form): Form<DeleteForm>,
) -> Result<Response, ApiError> {
    let user = verify_request_user(&headers, &state).await?;
    check_antiforgery(&state, &headers, form.verification_token.as_deref(), &user)?;

    let id = InquiryId::parse(&id)?;
    state.service.delete(&id, &user).await?;
    info!(%id, "delete ok");
    Ok(redirect_to_index())
}

async fn missing_id(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    verify_request_user(&headers, &state).await?;
    Err(CoreError::NotFound.into())
}

async fn not_found() -> Response {
    not_found_response()
}
