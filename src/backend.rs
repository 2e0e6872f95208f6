use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::{
    config::Settings,
    models::{unwrap_collection, unwrap_entity, BrokerAccount, Platform, Secret, UserProfile},
};

// ── Error types ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum BackendError {
    /// HTTP 401/403: the session token was rejected.
    Unauthorized(String),
    /// HTTP 404.
    NotFound(String),
    /// Any other non-success status, with the backend's `error.message` when it sent one.
    Http { status: u16, message: String },
    /// Connect, timeout, TLS.
    Transport(String),
    /// Body was not the JSON we expected.
    Decode(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            BackendError::NotFound(msg) => write!(f, "not found: {}", msg),
            BackendError::Http { status, message } => write!(f, "backend error {}: {}", status, message),
            BackendError::Transport(msg) => write!(f, "transport error: {}", msg),
            BackendError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Classify a non-success status into a BackendError.
fn classify_error(status: u16, body: &JsonValue) -> BackendError {
    let message = body
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown error")
        .to_string();
    match status {
        401 | 403 => BackendError::Unauthorized(message),
        404 => BackendError::NotFound(message),
        _ => BackendError::Http { status, message },
    }
}

const CHALLENGE_POPULATE: &str =
    "populate[broker_account]=*&populate[challenge_relation][populate][challenge_stages]=*";

// ── Request bodies ────────────────────────────────────────────────────────────

fn expose_secret<S: serde::Serializer>(s: &Secret, ser: S) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_str(s.expose())
}

/// Body of a broker-account create. Only built from a validated form.
#[derive(Debug, Clone, Serialize)]
pub struct NewBrokerAccount {
    pub login: String,
    #[serde(serialize_with = "expose_secret")]
    pub password: Secret,
    pub server: String,
    pub balance: f64,
    pub platform: Platform,
    pub used: bool,
    #[serde(rename = "inversorPass", serialize_with = "expose_secret")]
    pub inversor_pass: Secret,
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Strapi-style REST backend. The session token is passed on every call; the client holds none.
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: settings.backend_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read_json(resp: reqwest::Response) -> std::result::Result<JsonValue, BackendError> {
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| BackendError::Transport(format!("read body: {}", e)))?;
        let json: JsonValue = if text.trim().is_empty() {
            JsonValue::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) if (200..300).contains(&status) => {
                    return Err(BackendError::Decode(format!("{}", e)));
                }
                Err(_) => JsonValue::Null,
            }
        };
        if !(200..300).contains(&status) {
            let err = classify_error(status, &json);
            log::error!("backend.response_error status={} err={}", status, err);
            return Err(err);
        }
        Ok(json)
    }

    async fn get_json(&self, path: &str, token: &str) -> std::result::Result<JsonValue, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        self.get_url(url.as_str(), path, token).await
    }

    async fn get_url<U: reqwest::IntoUrl>(
        &self,
        url: U,
        label: &str,
        token: &str,
    ) -> std::result::Result<JsonValue, BackendError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendError::Transport(format!("GET {}: {}", label, e)))?;
        Self::read_json(resp).await
    }

    /// `document_id` goes in as a single encoded path segment; it cannot add segments or a query.
    fn challenge_url(&self, document_id: &str) -> std::result::Result<reqwest::Url, BackendError> {
        if matches!(document_id, "" | "." | "..") {
            return Err(BackendError::NotFound(format!("challenge {:?}", document_id)));
        }
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| BackendError::Transport(format!("backend url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Transport("backend url cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(["api", "challenges", document_id]);
        url.set_query(Some(CHALLENGE_POPULATE));
        Ok(url)
    }

    /// The caller's profile with populated challenges.
    pub async fn fetch_me(&self, token: &str) -> std::result::Result<UserProfile, BackendError> {
        let v = self
            .get_json("/api/users/me?populate[challenges]=*", token)
            .await?;
        if !v.is_object() {
            return Err(BackendError::Decode("users/me: expected an object".to_string()));
        }
        Ok(UserProfile::from_value(&v))
    }

    /// Full challenge record (broker account and stage relation populated), still raw so it can
    /// be merged over the listing record.
    pub async fn fetch_challenge(
        &self,
        token: &str,
        document_id: &str,
    ) -> std::result::Result<JsonValue, BackendError> {
        let url = self.challenge_url(document_id)?;
        let v = self.get_url(url, "/api/challenges/{document_id}", token).await?;
        let entity = unwrap_entity(&v)
            .ok_or_else(|| BackendError::Decode(format!("challenge {}: expected an object", document_id)))?;
        Ok(JsonValue::Object(entity))
    }

    /// Broker accounts not yet assigned to a trader.
    pub async fn list_unused_broker_accounts(
        &self,
        token: &str,
    ) -> std::result::Result<Vec<BrokerAccount>, BackendError> {
        let v = self
            .get_json("/api/broker-accounts?filters[used][$eq]=false&pagination[pageSize]=1000", token)
            .await?;
        let items = unwrap_collection(&v)
            .ok_or_else(|| BackendError::Decode("broker-accounts: expected a collection".to_string()))?;
        Ok(items.iter().filter_map(BrokerAccount::from_value).collect())
    }

    /// Create a broker account and return the record as the backend confirmed it.
    pub async fn create_broker_account(
        &self,
        token: &str,
        account: &NewBrokerAccount,
    ) -> std::result::Result<BrokerAccount, BackendError> {
        let url = format!("{}/api/broker-accounts", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "data": account }))
            .send()
            .await
            .map_err(|e| BackendError::Transport(format!("POST /api/broker-accounts: {}", e)))?;
        let v = Self::read_json(resp).await?;
        BrokerAccount::from_value(&v)
            .ok_or_else(|| BackendError::Decode("broker-accounts: created record missing".to_string()))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process stand-in for the backend, bound to an ephemeral port.

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use serde_json::{json, Value as JsonValue};
    use tokio::sync::Mutex;

    pub const TOKEN: &str = "jwt-test";

    #[derive(Clone, Default)]
    pub struct FakeBackend {
        pub accounts: Arc<Mutex<Vec<JsonValue>>>,
        pub me: Arc<Mutex<JsonValue>>,
        pub challenges: Arc<Mutex<Vec<JsonValue>>>,
        pub account_gets: Arc<AtomicUsize>,
        pub fail_detail: Arc<std::sync::atomic::AtomicBool>,
    }

    fn authorized(h: &HeaderMap) -> bool {
        h.get("authorization").and_then(|v| v.to_str().ok()) == Some(format!("Bearer {TOKEN}").as_str())
    }

    fn denied() -> axum::response::Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"data": null, "error": {"status": 401, "message": "Missing or invalid credentials"}})),
        )
            .into_response()
    }

    async fn list_accounts(State(b): State<FakeBackend>, h: HeaderMap) -> axum::response::Response {
        if !authorized(&h) {
            return denied();
        }
        b.account_gets.fetch_add(1, Ordering::SeqCst);
        let rows: Vec<JsonValue> = b
            .accounts
            .lock()
            .await
            .iter()
            .filter(|a| a["used"] == json!(false))
            .cloned()
            .collect();
        Json(json!({"data": rows, "meta": {"pagination": {"total": rows.len()}}})).into_response()
    }

    async fn create_account(
        State(b): State<FakeBackend>,
        h: HeaderMap,
        Json(body): Json<JsonValue>,
    ) -> axum::response::Response {
        if !authorized(&h) {
            return denied();
        }
        let mut data = body["data"].clone();
        if data["login"] == json!("taken") {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"data": null, "error": {"status": 400, "message": "This attribute must be unique"}})),
            )
                .into_response();
        }
        let mut accounts = b.accounts.lock().await;
        data["id"] = json!(accounts.len() + 1);
        data["documentId"] = json!(format!("acc-{}", accounts.len() + 1));
        accounts.push(data.clone());
        Json(json!({"data": data, "meta": {}})).into_response()
    }

    async fn me(State(b): State<FakeBackend>, h: HeaderMap) -> axum::response::Response {
        if !authorized(&h) {
            return denied();
        }
        Json(b.me.lock().await.clone()).into_response()
    }

    async fn challenge(
        State(b): State<FakeBackend>,
        h: HeaderMap,
        Path(document_id): Path<String>,
    ) -> axum::response::Response {
        if !authorized(&h) {
            return denied();
        }
        if b.fail_detail.load(Ordering::SeqCst) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"status": 500, "message": "boom"}})),
            )
                .into_response();
        }
        let found = b
            .challenges
            .lock()
            .await
            .iter()
            .find(|c| c["documentId"] == json!(document_id))
            .cloned();
        match found {
            Some(c) => Json(json!({"data": c, "meta": {}})).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({"data": null, "error": {"status": 404, "message": "Not Found"}})),
            )
                .into_response(),
        }
    }

    impl FakeBackend {
        /// Serve on 127.0.0.1 and return the base URL.
        pub async fn spawn(&self) -> String {
            let app = Router::new()
                .route("/api/broker-accounts", get(list_accounts).post(create_account))
                .route("/api/users/me", get(me))
                .route("/api/challenges/{document_id}", get(challenge))
                .with_state(self.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.ok();
            });
            format!("http://{}", addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeBackend, TOKEN};
    use super::*;
    use crate::config::test_settings;
    use serde_json::json;

    async fn client_for(backend: &FakeBackend) -> BackendClient {
        let url = backend.spawn().await;
        BackendClient::new(&test_settings(&url, "./unused.sqlite")).unwrap()
    }

    fn new_account(login: &str) -> NewBrokerAccount {
        NewBrokerAccount {
            login: login.to_string(),
            password: Secret::new("pw"),
            server: "Demo-1".to_string(),
            balance: 25_000.0,
            platform: Platform::Mt5,
            used: false,
            inversor_pass: Secret::new("ro"),
        }
    }

    #[test]
    fn classify_maps_statuses() {
        let body = json!({"error": {"message": "Forbidden"}});
        assert!(matches!(classify_error(403, &body), BackendError::Unauthorized(m) if m == "Forbidden"));
        assert!(matches!(classify_error(404, &JsonValue::Null), BackendError::NotFound(_)));
        assert!(matches!(
            classify_error(500, &JsonValue::Null),
            BackendError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn create_body_carries_credentials_only_on_the_wire() {
        let acc = new_account("abc123");
        let body = serde_json::to_value(&acc).unwrap();
        assert_eq!(body["password"], json!("pw"));
        assert_eq!(body["inversorPass"], json!("ro"));
        assert_eq!(body["platform"], json!("mt5"));
        assert!(!format!("{acc:?}").contains("\"pw\""));
    }

    #[tokio::test]
    async fn create_then_list() {
        let backend = FakeBackend::default();
        let client = client_for(&backend).await;

        let created = client.create_broker_account(TOKEN, &new_account("abc123")).await.unwrap();
        assert_eq!(created.id, Some(1));
        assert_eq!(created.balance, Some(25_000.0));

        let listed = client.list_unused_broker_accounts(TOKEN).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].login.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn backend_message_is_surfaced() {
        let backend = FakeBackend::default();
        let client = client_for(&backend).await;
        let err = client
            .create_broker_account(TOKEN, &new_account("taken"))
            .await
            .unwrap_err();
        match err {
            BackendError::Http { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "This attribute must be unique");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn bad_token_is_unauthorized() {
        let backend = FakeBackend::default();
        let client = client_for(&backend).await;
        let err = client.list_unused_broker_accounts("nope").await.unwrap_err();
        assert!(matches!(err, BackendError::Unauthorized(_)));
    }

    #[test]
    fn challenge_id_stays_one_path_segment() {
        let client = BackendClient::new(&test_settings("http://127.0.0.1:9/strapi/", "./unused.sqlite")).unwrap();
        let url = client.challenge_url("../users/me?populate=*#x").unwrap();
        assert_eq!(url.path(), "/strapi/api/challenges/..%2Fusers%2Fme%3Fpopulate=*%23x");
        assert_eq!(url.fragment(), None);
        assert!(url.query().is_some_and(|q| q.starts_with("populate[broker_account]")));

        assert!(matches!(client.challenge_url(".."), Err(BackendError::NotFound(_))));
        assert!(matches!(client.challenge_url(""), Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_ids_do_not_reach_other_routes() {
        let backend = FakeBackend::default();
        *backend.me.lock().await = json!({"id": 1, "username": "trader", "challenges": []});
        let client = client_for(&backend).await;
        let err = client.fetch_challenge(TOKEN, "../users/me").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        let client = BackendClient::new(&test_settings("http://127.0.0.1:9", "./unused.sqlite")).unwrap();
        let err = client.fetch_me(TOKEN).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }
}
