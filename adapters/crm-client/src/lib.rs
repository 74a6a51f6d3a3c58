//! crm-client: Dataverse (Dynamics 365) Web API implementation of the
//! `CrmService` port.
//!
//! Purpose
//! - Mirror inquiry records into the CRM and read back CRM-owned fields.
//! - Speaks OData v4 over `reqwest`; see `odata` for the payload mapping.
//!
//! Notes
//! - Authenticates with a static bearer token or OAuth2 client credentials;
//!   client-credential tokens are cached until shortly before expiry.
//! - Calls are sent one at a time, with a per-request timeout and no retries.

pub mod odata;
mod token;

use std::time::Duration;

use domain::{ColumnSet, CoreError, CrmService, Entity};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, IF_MATCH};
use reqwest::{Method, RequestBuilder, Response};
use tracing::debug;
use uuid::Uuid;

pub use token::{Credentials, DEFAULT_AUTHORITY};

/// Errors raised while talking to the CRM.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("crm returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("crm record not found: {0}")]
    NotFound(String),
    #[error("token acquisition failed: {0}")]
    Token(String),
    #[error("unexpected crm payload: {0}")]
    Decode(String),
    #[error("invalid crm configuration: {0}")]
    Config(String),
}

impl From<CrmError> for CoreError {
    fn from(e: CrmError) -> Self {
        CoreError::Crm(e.to_string())
    }
}

/// Connection settings for a Dataverse environment.
#[derive(Clone, Debug)]
pub struct WebApiConfig {
    /// Environment URL, e.g. `https://contoso.crm4.dynamics.com`.
    pub base_url: String,
    /// Web API version without the leading `v` (default `9.2`).
    pub api_version: String,
    pub timeout: Duration,
    pub credentials: Credentials,
    /// Token authority for client credentials.
    pub authority: String,
}

impl WebApiConfig {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            api_version: "9.2".into(),
            timeout: Duration::from_secs(30),
            credentials,
            authority: DEFAULT_AUTHORITY.into(),
        }
    }
}

/// `CrmService` backed by the Dataverse Web API.
pub struct WebApiCrm {
    http: reqwest::Client,
    api_root: String,
    tokens: token::TokenSource,
}

impl WebApiCrm {
    pub fn new(cfg: WebApiConfig) -> Result<Self, CrmError> {
        let base = cfg.base_url.trim_end_matches('/');
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(CrmError::Config(format!("base url must be http(s): {base}")));
        }
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("odata-maxversion", HeaderValue::from_static("4.0"));
        headers.insert("odata-version", HeaderValue::from_static("4.0"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self {
            http,
            api_root: format!("{}/api/data/v{}/", base, cfg.api_version),
            tokens: token::TokenSource::new(cfg.credentials, &cfg.authority, base),
        })
    }

    /// Root of the Web API, ending with `/`.
    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, CrmError> {
        let bearer = self.tokens.bearer(&self.http).await?;
        let url = format!("{}{}", self.api_root, path);
        debug!(%method, %url, "crm-client request");
        Ok(self.http.request(method, url).bearer_auth(bearer))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, CrmError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(odata::decode_error(status.as_u16(), &body))
    }

    async fn retrieve_record(
        &self,
        logical_name: &str,
        id: Uuid,
        columns: &ColumnSet,
    ) -> Result<Entity, CrmError> {
        let mut req = self
            .request(Method::GET, &odata::record_path(logical_name, id))
            .await?;
        if let Some(select) = odata::select_clause(columns) {
            req = req.query(&[("$select", select)]);
        }
        let body: serde_json::Value = self.send(req).await?.json().await?;
        odata::entity_from_json(logical_name, id, &body)
    }

    async fn create_record(&self, entity: &Entity) -> Result<Uuid, CrmError> {
        let req = self
            .request(Method::POST, &odata::entity_set_name(&entity.logical_name))
            .await?
            .json(&odata::create_body(entity));
        let resp = self.send(req).await?;
        let id = resp
            .headers()
            .get("odata-entityid")
            .and_then(|v| v.to_str().ok())
            .and_then(odata::id_from_entity_uri)
            .unwrap_or(entity.id);
        Ok(id)
    }

    async fn update_record(&self, entity: &Entity) -> Result<(), CrmError> {
        // If-Match: * turns the PATCH into a pure update (no upsert).
        let req = self
            .request(Method::PATCH, &odata::record_path(&entity.logical_name, entity.id))
            .await?
            .header(IF_MATCH, "*")
            .json(&odata::update_body(entity));
        self.send(req).await?;
        Ok(())
    }

    async fn delete_record(&self, logical_name: &str, id: Uuid) -> Result<(), CrmError> {
        let req = self
            .request(Method::DELETE, &odata::record_path(logical_name, id))
            .await?;
        self.send(req).await?;
        Ok(())
    }
}

impl CrmService for WebApiCrm {
    async fn retrieve(
        &self,
        logical_name: &str,
        id: Uuid,
        columns: &ColumnSet,
    ) -> Result<Entity, CoreError> {
        Ok(self.retrieve_record(logical_name, id, columns).await?)
    }

    async fn create(&self, entity: &Entity) -> Result<Uuid, CoreError> {
        Ok(self.create_record(entity).await?)
    }

    async fn update(&self, entity: &Entity) -> Result<(), CoreError> {
        Ok(self.update_record(entity).await?)
    }

    async fn delete(&self, logical_name: &str, id: Uuid) -> Result<(), CoreError> {
        Ok(self.delete_record(logical_name, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxHeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use domain::{AttributeValue, EntityReference};
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Just enough of the Dataverse Web API and the token endpoint.
    #[derive(Clone, Default)]
    struct FakeDataverse {
        records: Arc<Mutex<BTreeMap<String, Value>>>,
        token_calls: Arc<AtomicUsize>,
        if_match: Arc<Mutex<Vec<String>>>,
    }

    fn split_segment(segment: &str) -> Option<(String, String)> {
        let open = segment.find('(')?;
        let set = segment[..open].to_string();
        let id = segment[open + 1..].trim_end_matches(')').to_string();
        Some((set, id))
    }

    fn not_found(id: &str) -> axum::response::Response {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": "0x80040217", "message": format!("stu7_inquiry With Id = {id} Does Not Exist")}})),
        )
            .into_response()
    }

    fn authorized(headers: &AxHeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer t1")
    }

    async fn token(State(fake): State<FakeDataverse>, body: String) -> impl IntoResponse {
        fake.token_calls.fetch_add(1, Ordering::SeqCst);
        assert!(body.contains("grant_type=client_credentials"));
        Json(json!({"token_type": "Bearer", "expires_in": 3600, "access_token": "t1"}))
    }

    async fn create(
        State(fake): State<FakeDataverse>,
        Path(set): Path<String>,
        headers: AxHeaderMap,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let id = body["stu7_inquiryid"].as_str().unwrap_or_default().to_string();
        fake.records.lock().unwrap().insert(id.clone(), body);
        (
            StatusCode::NO_CONTENT,
            [("odata-entityid", format!("http://fake/api/data/v9.2/{set}({id})"))],
        )
            .into_response()
    }

    async fn retrieve(
        State(fake): State<FakeDataverse>,
        Path(segment): Path<String>,
        Query(q): Query<HashMap<String, String>>,
        headers: AxHeaderMap,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let Some((_, id)) = split_segment(&segment) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let records = fake.records.lock().unwrap();
        let Some(rec) = records.get(&id) else {
            return not_found(&id);
        };
        let mut out = serde_json::Map::new();
        out.insert("@odata.etag".into(), json!("W/\"1\""));
        out.insert("stu7_inquiryid".into(), json!(id));
        if let Some(select) = q.get("$select") {
            for col in select.split(',') {
                out.insert(col.to_string(), rec.get(col).cloned().unwrap_or(Value::Null));
            }
        }
        Json(Value::Object(out)).into_response()
    }

    async fn update(
        State(fake): State<FakeDataverse>,
        Path(segment): Path<String>,
        headers: AxHeaderMap,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        let Some((_, id)) = split_segment(&segment) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        if let Some(v) = headers.get("if-match").and_then(|v| v.to_str().ok()) {
            fake.if_match.lock().unwrap().push(v.to_string());
        }
        let mut records = fake.records.lock().unwrap();
        let Some(rec) = records.get_mut(&id) else {
            return not_found(&id);
        };
        if let (Some(rec), Some(patch)) = (rec.as_object_mut(), body.as_object()) {
            for (k, v) in patch {
                rec.insert(k.clone(), v.clone());
            }
        }
        StatusCode::NO_CONTENT.into_response()
    }

    async fn remove(
        State(fake): State<FakeDataverse>,
        Path(segment): Path<String>,
    ) -> axum::response::Response {
        let Some((_, id)) = split_segment(&segment) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        match fake.records.lock().unwrap().remove(&id) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => not_found(&id),
        }
    }

    async fn spawn_fake() -> (String, FakeDataverse) {
        let fake = FakeDataverse::default();
        let app = Router::new()
            .route("/:tenant/oauth2/v2.0/token", post(token))
            .route(
                "/api/data/v9.2/:segment",
                get(retrieve).post(create).patch(update).delete(remove),
            )
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), fake)
    }

    fn client(base: &str) -> WebApiCrm {
        let mut cfg = WebApiConfig::new(
            base,
            Credentials::ClientSecret {
                tenant_id: "tenant-1".into(),
                client_id: "app".into(),
                client_secret: "secret".into(),
            },
        );
        cfg.authority = base.to_string();
        WebApiCrm::new(cfg).unwrap()
    }

    #[test]
    fn rejects_non_http_base_url() {
        let cfg = WebApiConfig::new("contoso.crm.dynamics.com", Credentials::AccessToken("x".into()));
        assert!(matches!(WebApiCrm::new(cfg), Err(CrmError::Config(_))));
    }

    #[test]
    fn api_root_includes_version() {
        let mut cfg = WebApiConfig::new("https://contoso.crm4.dynamics.com/", Credentials::AccessToken("x".into()));
        cfg.api_version = "9.1".into();
        let crm = WebApiCrm::new(cfg).unwrap();
        assert_eq!(crm.api_root(), "https://contoso.crm4.dynamics.com/api/data/v9.1/");
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let c = Credentials::ClientSecret {
            tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "hunter2".into(),
        };
        assert!(!format!("{c:?}").contains("hunter2"));
        assert!(!format!("{:?}", Credentials::AccessToken("tok".into())).contains("tok"));
    }

    #[tokio::test]
    async fn crud_roundtrip_against_fake_web_api() {
        let (base, fake) = spawn_fake().await;
        let crm = client(&base);

        let id = Uuid::new_v4();
        let contact = Uuid::new_v4();
        let entity = Entity::new("stu7_inquiry", id)
            .with("stu7_name", AttributeValue::Text("ada".into()))
            .with("stu7_question", AttributeValue::Text("open on sunday?".into()))
            .with(
                "stu7_contact",
                AttributeValue::Reference(EntityReference::new("contact", contact)),
            );
        assert_eq!(crm.create(&entity).await.unwrap(), id);
        {
            let records = fake.records.lock().unwrap();
            let stored = &records[&id.to_string()];
            assert_eq!(stored["stu7_question"], "open on sunday?");
            assert_eq!(stored["stu7_contact@odata.bind"], format!("/contacts({contact})"));
        }

        fake.records
            .lock()
            .unwrap()
            .get_mut(&id.to_string())
            .unwrap()
            .as_object_mut()
            .unwrap()
            .insert("stu7_response".into(), json!("closed"));
        let got = crm
            .retrieve("stu7_inquiry", id, &ColumnSet::of(&["stu7_response"]))
            .await
            .unwrap();
        assert_eq!(got.get_text("stu7_response"), Some("closed"));
        assert!(got.get("stu7_question").is_none());

        let patch = Entity::new("stu7_inquiry", id)
            .with("stu7_question", AttributeValue::Text("open on monday?".into()));
        crm.update(&patch).await.unwrap();
        assert_eq!(*fake.if_match.lock().unwrap(), vec!["*".to_string()]);
        assert_eq!(
            fake.records.lock().unwrap()[&id.to_string()]["stu7_question"],
            "open on monday?"
        );

        crm.delete("stu7_inquiry", id).await.unwrap();
        let err = crm
            .retrieve("stu7_inquiry", id, &ColumnSet::All)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Crm(m) if m.contains("Does Not Exist")));

        // One token served every call.
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let (base, _fake) = spawn_fake().await;
        let crm = client(&base);
        let patch = Entity::new("stu7_inquiry", Uuid::new_v4())
            .with("stu7_question", AttributeValue::Text("?".into()));
        let err = crm.update_record(&patch).await.unwrap_err();
        assert!(matches!(err, CrmError::NotFound(_)));
    }

    #[tokio::test]
    async fn unreachable_crm_is_an_http_error() {
        // Nothing listens on port 9 locally.
        let cfg = WebApiConfig::new("http://127.0.0.1:9", Credentials::AccessToken("x".into()));
        let crm = WebApiCrm::new(cfg).unwrap();
        let err = crm.delete_record("stu7_inquiry", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CrmError::Http(_)));
    }
}
