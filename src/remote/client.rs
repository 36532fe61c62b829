// ABOUTME: HTTP client for communicating with both workspace API dialects
// ABOUTME: Handles credential selection, retries with backoff, and per-call logging

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use super::endpoints;
use super::models::ApiKeyResponse;
use super::transport::{ApiRequest, Transport};
use crate::config::{ApiSettings, TlsPolicy};
use crate::credentials::{Dialect, ResolvedCredentials};
use crate::error::ApiError;

const MAX_LOGGED_BODY: usize = 1000;

static INSECURE_TLS_WARNED: AtomicBool = AtomicBool::new(false);

/// Emits the disabled-verification warning the first time it is called in
/// this process. Returns whether this call emitted it.
pub(crate) fn warn_insecure_tls_once() -> bool {
    if INSECURE_TLS_WARNED.swap(true, Ordering::SeqCst) {
        return false;
    }
    tracing::warn!(
        "TLS certificate verification is disabled; traffic to the workspace can be intercepted"
    );
    true
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ApiSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Exponential delay before retry number `attempt` (1-based), capped and
    /// jittered down by up to half.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    endpoint: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|e| self.decode_error(e))
    }

    /// Items of a listing. Legacy listings are bare arrays, current ones
    /// wrap the array under `key`. Any other shape is a decode error, so a
    /// changed envelope never reads as an empty project.
    pub fn list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, ApiError> {
        let value: serde_json::Value = self.json()?;
        let items = match value {
            serde_json::Value::Array(_) => value,
            serde_json::Value::Object(mut map) => match map.remove(key) {
                Some(items @ serde_json::Value::Array(_)) => items,
                Some(_) => return Err(self.shape_error(format!("'{}' is not an array", key))),
                None => return Err(self.shape_error(format!("missing '{}' array", key))),
            },
            _ => return Err(self.shape_error("expected an array or an object".to_string())),
        };
        serde_json::from_value(items).map_err(|e| self.decode_error(e))
    }

    fn shape_error(&self, message: String) -> ApiError {
        ApiError::Decode {
            endpoint: self.endpoint.clone(),
            message,
        }
    }

    fn decode_error(&self, err: serde_json::Error) -> ApiError {
        ApiError::Decode {
            endpoint: self.endpoint.clone(),
            message: err.to_string(),
        }
    }
}

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    credentials: ResolvedCredentials,
    derived_current: OnceCell<String>,
    retry: RetryPolicy,
    verbose: bool,
    insecure: bool,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        credentials: ResolvedCredentials,
        transport: Arc<dyn Transport>,
        settings: &ApiSettings,
        tls: &TlsPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            derived_current: OnceCell::new(),
            retry: RetryPolicy::from_settings(settings),
            verbose: settings.verbose,
            insecure: matches!(tls, TlsPolicy::Disabled),
        }
    }

    /// Whether a call in `dialect` can be attempted, counting a token
    /// minted by [`ApiClient::derive_current_token`].
    pub fn usable(&self, dialect: Dialect) -> bool {
        self.credentials.usable(dialect)
            || (dialect == Dialect::Current && self.derived_current.initialized())
    }

    fn token(&self, dialect: Dialect) -> Result<String, ApiError> {
        match self.credentials.token(dialect) {
            Ok(token) => Ok(token.to_string()),
            Err(err) => match (dialect, self.derived_current.get()) {
                (Dialect::Current, Some(derived)) => Ok(derived.clone()),
                _ => Err(err),
            },
        }
    }

    /// Key for workspace CLI logins: the legacy token when present, else the
    /// configured or derived current one.
    pub fn session_key(&self) -> Option<String> {
        [Dialect::Legacy, Dialect::Current]
            .into_iter()
            .find_map(|dialect| self.token(dialect).ok())
    }

    fn auth_header(dialect: Dialect, token: &str) -> (String, String) {
        let value = match dialect {
            Dialect::Legacy => format!("Basic {}", STANDARD.encode(format!("{}:", token))),
            Dialect::Current => format!("Bearer {}", token),
        };
        ("Authorization".to_string(), value)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Issues one logical API call. Transient failures (transport errors and
    /// 5xx) of idempotent methods are retried up to the configured ceiling;
    /// POST and PATCH are sent once, since a lost response may still have
    /// applied. 4xx comes back at once.
    pub async fn call(
        &self,
        dialect: Dialect,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, ApiError> {
        let retry = is_idempotent(&method);
        self.dispatch(dialect, method, endpoint, body, retry).await
    }

    /// Like [`ApiClient::call`], but retries whatever the method. For
    /// writes that set absolute state, such as assigning an owner.
    pub async fn call_idempotent(
        &self,
        dialect: Dialect,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, ApiError> {
        self.dispatch(dialect, method, endpoint, body, true).await
    }

    async fn dispatch(
        &self,
        dialect: Dialect,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
        retry: bool,
    ) -> Result<ApiResponse, ApiError> {
        let token = self.token(dialect)?;

        if self.insecure {
            warn_insecure_tls_once();
        }

        let url = self.url(endpoint);
        let request = ApiRequest {
            method: method.clone(),
            url: url.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                Self::auth_header(dialect, &token),
            ],
            body: body.cloned(),
        };

        if self.verbose {
            if let Some(body) = body {
                tracing::debug!(%method, %url, body = %truncate(&body.to_string()), "API request body");
            }
        }

        let max_attempts = if retry { self.retry.max_attempts } else { 1 };
        let started = Instant::now();
        let mut attempt = 0;
        let mut last_status = None;
        let last_error = loop {
            attempt += 1;
            let error = match self.transport.send(request.clone()).await {
                Ok(raw) if raw.status >= 500 => {
                    last_status = Some(raw.status);
                    format!("server returned status {}", raw.status)
                }
                Ok(raw) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        %dialect, %method, %url, status = raw.status, elapsed_ms, attempts = attempt,
                        "API call"
                    );
                    if self.verbose {
                        tracing::debug!(%url, body = %truncate(&raw.body), "API response body");
                    }
                    if raw.status >= 400 {
                        return Err(ApiError::ClientError {
                            status: raw.status,
                            body: raw.body,
                        });
                    }
                    return Ok(ApiResponse {
                        status: raw.status,
                        body: raw.body,
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(err) => {
                    last_status = None;
                    err.to_string()
                }
            };

            if attempt >= max_attempts {
                break error;
            }
            let delay = self.retry.delay(attempt);
            tracing::debug!(%url, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying API call");
            tokio::time::sleep(delay).await;
        };

        tracing::warn!(
            %dialect, %method, %url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            attempts = attempt,
            status = ?last_status,
            error = %last_error,
            "API call failed"
        );
        Err(ApiError::TransientNetwork {
            attempts: attempt,
            last_error,
        })
    }

    /// Mints a current-dialect token through the legacy key endpoint. Runs
    /// at most once per client; a configured current token makes it a no-op.
    pub async fn derive_current_token(&self, username: &str) -> Result<(), ApiError> {
        if self.credentials.usable(Dialect::Current) {
            return Ok(());
        }

        self.derived_current
            .get_or_try_init(|| async {
                let expiry = (chrono::Utc::now() + chrono::Duration::weeks(1))
                    .format("%Y-%m-%dT%H:%M:%SZ")
                    .to_string();
                let body = serde_json::json!({ "expiryDate": expiry });
                let response = self
                    .call(
                        Dialect::Legacy,
                        Method::POST,
                        &endpoints::legacy::api_key(username),
                        Some(&body),
                    )
                    .await?;
                let key: ApiKeyResponse = response.json()?;
                tracing::info!(user = username, "Derived a current-dialect token from the legacy credential");
                Ok::<_, ApiError>(key.api_key)
            })
            .await?;

        Ok(())
    }
}

fn is_idempotent(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::PUT, Method::DELETE, Method::OPTIONS].contains(method)
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_LOGGED_BODY {
        return body.to_string();
    }
    let mut end = MAX_LOGGED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialResolver, CredentialSet};
    use crate::remote::transport::TransportError;
    use crate::testing::{client_with, FakeTransport, Reply};
    use serde_json::json;

    fn both() -> CredentialSet {
        CredentialSet::new(Some("legacy-key"), Some("current-key"))
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let fake = FakeTransport::new();
        fake.json(Method::GET, "/api/v2/projects/p1", json!({"id": "p1", "name": "CDV"}));
        let client = client_with(&fake, both());

        let response = client
            .call(Dialect::Current, Method::GET, "api/v2/projects/p1", None)
            .await
            .unwrap();
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["name"], "CDV");
    }

    #[tokio::test]
    async fn test_missing_dialect_fails_before_network() {
        let fake = FakeTransport::new();
        let client = client_with(&fake, CredentialSet::new(Some("legacy-key"), None));

        let err = client
            .call(Dialect::Current, Method::GET, "api/v2/projects", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::CredentialMissing {
                dialect: Dialect::Current
            }
        );
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn test_auth_header_matches_dialect() {
        let fake = FakeTransport::new();
        fake.json(Method::GET, "/api/v1/runtimes", json!({"runtimes": []}));
        fake.json(Method::GET, "/api/v2/runtimes", json!({"runtimes": []}));
        let client = client_with(&fake, both());

        client.call(Dialect::Legacy, Method::GET, "api/v1/runtimes", None).await.unwrap();
        client.call(Dialect::Current, Method::GET, "api/v2/runtimes", None).await.unwrap();

        let requests = fake.requests();
        let legacy_auth = requests[0].header("Authorization").unwrap();
        assert_eq!(legacy_auth, format!("Basic {}", STANDARD.encode("legacy-key:")));
        assert_eq!(requests[1].header("Authorization").unwrap(), "Bearer current-key");
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let fake = FakeTransport::new();
        fake.reply(Method::GET, "/api/v2/projects/p1", 403, r#"{"message":"forbidden"}"#);
        let client = client_with(&fake, both());

        let err = client
            .call(Dialect::Current, Method::GET, "api/v2/projects/p1", None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(fake.count(&Method::GET, "/api/v2/projects/p1"), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let fake = FakeTransport::new();
        fake.sequence(
            Method::GET,
            "/api/v2/projects/p1",
            vec![
                Reply::Fail(TransportError::Connect("reset".into())),
                Reply::Status(503, String::new()),
                Reply::Status(200, r#"{"id":"p1"}"#.into()),
            ],
        );
        let client = client_with(&fake, both());

        let response = client
            .call(Dialect::Current, Method::GET, "api/v2/projects/p1", None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(fake.count(&Method::GET, "/api/v2/projects/p1"), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_respected() {
        let fake = FakeTransport::new();
        fake.reply(Method::GET, "/api/v2/projects/p1", 502, "bad gateway");
        let client = client_with(&fake, both());

        let err = client
            .call(Dialect::Current, Method::GET, "api/v2/projects/p1", None)
            .await
            .unwrap_err();
        match err {
            ApiError::TransientNetwork { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fake.count(&Method::GET, "/api/v2/projects/p1"), 4);
    }

    fn response(body: &str) -> ApiResponse {
        ApiResponse {
            status: 200,
            body: body.to_string(),
            endpoint: "api/v2/projects/p1/jobs".to_string(),
        }
    }

    #[test]
    fn test_listing_accepts_bare_and_wrapped_arrays() {
        let bare: Vec<serde_json::Value> = response(r#"[{"id":"a"}]"#).list("jobs").unwrap();
        assert_eq!(bare.len(), 1);
        let wrapped: Vec<serde_json::Value> =
            response(r#"{"jobs":[{"id":"a"},{"id":"b"}]}"#).list("jobs").unwrap();
        assert_eq!(wrapped.len(), 2);
    }

    #[test]
    fn test_listing_with_unexpected_envelope_is_a_decode_error() {
        for body in [r#"{"items":[{"id":"a"}]}"#, r#"{"jobs":{"id":"a"}}"#, r#""jobs""#] {
            let err = response(body).list::<serde_json::Value>("jobs").unwrap_err();
            match err {
                ApiError::Decode { endpoint, .. } => assert_eq!(endpoint, "api/v2/projects/p1/jobs"),
                other => panic!("unexpected error for {body}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_post_is_sent_once_on_server_error() {
        let fake = FakeTransport::new();
        fake.sequence(
            Method::POST,
            "/api/v2/projects/t1/jobs",
            vec![
                Reply::Status(502, "bad gateway".into()),
                Reply::Status(200, r#"{"id":"j1"}"#.into()),
            ],
        );
        let client = client_with(&fake, both());
        let body = json!({"name": "nightly"});

        let err = client
            .call(Dialect::Current, Method::POST, "api/v2/projects/t1/jobs", Some(&body))
            .await
            .unwrap_err();
        match err {
            ApiError::TransientNetwork { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("502"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fake.count(&Method::POST, "/api/v2/projects/t1/jobs"), 1);
    }

    #[tokio::test]
    async fn test_patch_is_sent_once_on_connection_error() {
        let fake = FakeTransport::new();
        fake.sequence(
            Method::PATCH,
            "/api/v2/projects/t1/jobs/j2",
            vec![
                Reply::Fail(TransportError::Connect("reset".into())),
                Reply::Status(200, "{}".into()),
            ],
        );
        let client = client_with(&fake, both());

        assert!(client
            .call(Dialect::Current, Method::PATCH, "api/v2/projects/t1/jobs/j2", None)
            .await
            .is_err());
        assert_eq!(fake.count(&Method::PATCH, "/api/v2/projects/t1/jobs/j2"), 1);
    }

    #[tokio::test]
    async fn test_explicitly_idempotent_write_is_retried() {
        let fake = FakeTransport::new();
        fake.sequence(
            Method::PATCH,
            "/api/v2/projects/p1",
            vec![
                Reply::Status(503, String::new()),
                Reply::Status(200, "{}".into()),
            ],
        );
        let client = client_with(&fake, both());
        let body = json!({"owner": {"username": "admin"}});

        client
            .call_idempotent(Dialect::Current, Method::PATCH, "api/v2/projects/p1", Some(&body))
            .await
            .unwrap();
        assert_eq!(fake.count(&Method::PATCH, "/api/v2/projects/p1"), 2);
    }

    #[tokio::test]
    async fn test_derivation_is_explicit_and_cached() {
        let fake = FakeTransport::new();
        fake.json(Method::POST, "/api/v1/users/admin/apikey", json!({"apiKey": "minted"}));
        fake.json(Method::GET, "/api/v2/projects", json!({"projects": []}));
        let client = client_with(&fake, CredentialSet::new(Some("legacy-key"), None));

        assert!(!client.usable(Dialect::Current));
        client.derive_current_token("admin").await.unwrap();
        client.derive_current_token("admin").await.unwrap();
        assert!(client.usable(Dialect::Current));
        assert_eq!(fake.count(&Method::POST, "/api/v1/users/admin/apikey"), 1);

        client.call(Dialect::Current, Method::GET, "api/v2/projects", None).await.unwrap();
        let last = fake.requests().pop().unwrap();
        assert_eq!(last.header("Authorization").unwrap(), "Bearer minted");
    }

    #[tokio::test]
    async fn test_derivation_skipped_when_current_configured() {
        let fake = FakeTransport::new();
        let client = client_with(&fake, both());
        client.derive_current_token("admin").await.unwrap();
        assert!(client.derived_current.get().is_none());
        assert!(fake.requests().is_empty());
    }

    #[test]
    fn test_insecure_warning_fires_once() {
        warn_insecure_tls_once();
        assert!(!warn_insecure_tls_once());
        assert!(!warn_insecure_tls_once());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
        };
        assert!(policy.delay(1) <= Duration::from_millis(100));
        assert!(policy.delay(8) <= Duration::from_millis(400));
        assert!(policy.delay(8) >= Duration::from_millis(200));
    }

    #[test]
    fn test_resolver_output_feeds_client() {
        let resolved = CredentialResolver::resolve(&both()).unwrap();
        let fake = FakeTransport::new();
        let client = ApiClient::new(
            "https://ml.example.com/",
            resolved,
            fake,
            &ApiSettings::default(),
            &TlsPolicy::SystemDefault,
        );
        assert_eq!(client.url("/api/v2/projects"), "https://ml.example.com/api/v2/projects");
    }
}
