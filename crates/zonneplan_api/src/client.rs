use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::ETAG;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::header::IF_NONE_MATCH;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::trace;

use crate::auth::AuthClient;
use crate::auth::Session;
use crate::auth::Token;
use crate::auth::TokenStore;
use crate::error::ApiError;
use crate::error::ApiResult;
use crate::types::Account;
use crate::types::ChartKind;

pub const DEFAULT_BASE_URL: &str = "https://app-api.zonneplan.nl/";

/// Version of the vendor app API this client speaks.
pub const API_VERSION: &str = "2.1.1";

pub const INTEGRATION_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Applied to every request.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Whether a GET may carry `If-None-Match`.
///
/// A `304` only means something to a caller that still holds the payload
/// the stored ETag was issued for. A caller without it must ask for the
/// full body, or a fetch that failed after an earlier GET succeeded would
/// be answered with `304` forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidate {
    /// Send the stored ETag; an unchanged resource reads as `None`.
    IfCached,
    /// Always ask for the full body.
    Never,
}

impl Revalidate {
    /// `IfCached` when the caller holds the last payload, `Never` otherwise.
    pub fn holding(cached: bool) -> Self {
        if cached {
            Revalidate::IfCached
        } else {
            Revalidate::Never
        }
    }
}

/// HTTP client plus base URL, shared by the authenticated and the
/// unauthenticated side of the API.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub(crate) http: reqwest::Client,
    base_url: String,
}

impl Endpoint {
    pub(crate) fn new(config: &ClientConfig) -> ApiResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=utf-8"),
        );
        headers.insert("x-app-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            "x-integration-version",
            HeaderValue::from_static(INTEGRATION_VERSION),
        );

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_start_matches('/'))
    }
}

/// Authenticated client for the Zonneplan REST API.
///
/// One instance is shared by every coordinator. It owns the token session
/// and remembers the last ETag seen per URL so unchanged resources come
/// back as `304 Not Modified`.
pub struct ApiClient {
    endpoint: Endpoint,
    session: Session,
    etags: Mutex<HashMap<String, String>>,
}

impl ApiClient {
    pub fn new(
        config: &ClientConfig,
        token: Option<Token>,
        store: Option<Arc<dyn TokenStore>>,
    ) -> ApiResult<Self> {
        let endpoint = Endpoint::new(config)?;
        let session = Session::new(AuthClient::from_endpoint(endpoint.clone()), token, store);
        Ok(Self {
            endpoint,
            session,
            etags: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// GET, conditional when `revalidate` allows it.
    ///
    /// Returns the `data` envelope of the response, or `None` when the
    /// resource is unchanged (304) or the body carries no data.
    pub async fn get(&self, resource: &str, revalidate: Revalidate) -> ApiResult<Option<Value>> {
        let url = self.endpoint.url(resource);
        let token = self.session.access_token().await?;

        let mut request = self.endpoint.http.get(&url).bearer_auth(token);
        if revalidate == Revalidate::IfCached {
            if let Some(etag) = self.etag(&url) {
                request = request.header(IF_NONE_MATCH, etag);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        debug!("GET {} -> {}", url, status);

        match status {
            StatusCode::NOT_MODIFIED => return Ok(None),
            StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Status { status: s, body });
            }
            _ => {}
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }

        let mut json: Value = serde_json::from_slice(&body)?;
        trace!("GET {} body: {}", url, json);
        if let Some(etag) = etag {
            self.etags
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(url, etag);
        }

        match json.get_mut("data").map(Value::take) {
            None | Some(Value::Null) => Ok(None),
            Some(data) => Ok(Some(data)),
        }
    }

    /// POST an action. The response body is returned as is; an empty body
    /// (such as a 204) reads as `{"ok": true}`.
    pub async fn post(&self, resource: &str, params: &Value) -> ApiResult<Value> {
        let url = self.endpoint.url(resource);
        let token = self.session.access_token().await?;

        let response = self
            .endpoint
            .http
            .post(&url)
            .bearer_auth(token)
            .json(params)
            .send()
            .await?;
        let status = response.status();
        debug!("POST {} -> {}", url, status);

        match status {
            StatusCode::NO_CONTENT => return Ok(json!({"ok": true})),
            StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Status { status: s, body });
            }
            _ => {}
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(json!({"ok": true}));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    fn etag(&self, url: &str) -> Option<String> {
        self.etags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    pub async fn user_accounts(&self, revalidate: Revalidate) -> ApiResult<Option<Account>> {
        match self.get("user-accounts/me", revalidate).await? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// `connections/{connection}/{suffix}`
    pub async fn connection_resource(
        &self,
        connection_uuid: &str,
        suffix: &str,
        revalidate: Revalidate,
    ) -> ApiResult<Option<Value>> {
        self.get(
            &format!(
                "connections/{}/{}",
                connection_uuid,
                suffix.trim_start_matches('/')
            ),
            revalidate,
        )
        .await
    }

    pub async fn battery_chart(
        &self,
        contract_uuid: &str,
        kind: ChartKind,
        date: NaiveDate,
        revalidate: Revalidate,
    ) -> ApiResult<Option<Value>> {
        self.get(
            &format!(
                "contracts/{}/home_battery_installation/charts/{}?date={}",
                contract_uuid,
                kind,
                date.format("%Y-%m-%d")
            ),
            revalidate,
        )
        .await
    }

    pub async fn battery_control_mode(
        &self,
        contract_uuid: &str,
        revalidate: Revalidate,
    ) -> ApiResult<Option<Value>> {
        self.get(
            &format!("api/contracts/{}/home-battery/control-mode", contract_uuid),
            revalidate,
        )
        .await
    }

    pub async fn battery_home_optimization(
        &self,
        contract_uuid: &str,
        revalidate: Revalidate,
    ) -> ApiResult<Option<Value>> {
        self.get(
            &format!(
                "api/contracts/{}/home-battery/control-mode/home_optimization",
                contract_uuid
            ),
            revalidate,
        )
        .await
    }

    /// POST to `connections/{connection}/{action}`.
    pub async fn connection_action(
        &self,
        connection_uuid: &str,
        action: &str,
        params: &Value,
    ) -> ApiResult<Value> {
        self.post(
            &format!(
                "connections/{}/{}",
                connection_uuid,
                action.trim_start_matches('/')
            ),
            params,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mockito::Matcher;
    use mockito::Server;

    use super::*;

    fn token() -> Token {
        Token {
            access_token: "test_token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn client(server: &Server) -> ApiClient {
        let config = ClientConfig {
            base_url: server.url(),
            timeout: Duration::from_secs(5),
        };
        ApiClient::new(&config, Some(token()), None).unwrap()
    }

    #[tokio::test]
    async fn test_get_unwraps_data_envelope() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/connections/c1/summary")
            .match_header("authorization", "Bearer test_token")
            .match_header("x-app-version", API_VERSION)
            .match_header("x-integration-version", INTEGRATION_VERSION)
            .with_status(200)
            .with_body(json!({"data": {"usage": {"value": 42}}}).to_string())
            .create_async()
            .await;

        let client = client(&server);
        let data = client
            .connection_resource("c1", "summary", Revalidate::IfCached)
            .await
            .unwrap();

        assert_eq!(data, Some(json!({"usage": {"value": 42}})));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_sends_etag_and_handles_not_modified() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/connections/c1/pv-installation")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_body(json!({"data": {"total": 1}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/connections/c1/pv-installation")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server);
        let resource = "connections/c1/pv-installation";
        let fresh = client.get(resource, Revalidate::IfCached).await.unwrap();
        assert_eq!(fresh, Some(json!({"total": 1})));

        let unchanged = client.get(resource, Revalidate::IfCached).await.unwrap();
        assert_eq!(unchanged, None);

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_without_cache_skips_etag() {
        let mut server = Server::new_async().await;
        let full = server
            .mock("GET", "/connections/c1/pv-installation")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_body(json!({"data": {"total": 1}}).to_string())
            .expect(2)
            .create_async()
            .await;
        let not_modified = server
            .mock("GET", "/connections/c1/pv-installation")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .expect(0)
            .create_async()
            .await;

        let client = client(&server);
        let resource = "connections/c1/pv-installation";
        assert_eq!(
            client.get(resource, Revalidate::IfCached).await.unwrap(),
            Some(json!({"total": 1}))
        );
        // The caller dropped the payload, so the ETag must not be sent.
        assert_eq!(
            client.get(resource, Revalidate::Never).await.unwrap(),
            Some(json!({"total": 1}))
        );

        full.assert_async().await;
        not_modified.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_empty_envelope_is_none() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/connections/c1/gas")
            .with_status(200)
            .with_body(json!({"data": null}).to_string())
            .create_async()
            .await;

        let client = client(&server);
        let data = client.get("connections/c1/gas", Revalidate::IfCached).await;
        assert_eq!(data.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_unauthorized() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/user-accounts/me")
            .with_status(401)
            .create_async()
            .await;

        let client = client(&server);
        let err = client.user_accounts(Revalidate::IfCached).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_get_server_error_is_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/connections/c1/summary")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let client = client(&server);
        let err = client
            .get("connections/c1/summary", Revalidate::IfCached)
            .await
            .unwrap_err();
        match &err {
            ApiError::Status { status, body } => {
                assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_post_no_content() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/connections/c1/charge-points/cp1/actions/start_boost")
            .match_header("authorization", "Bearer test_token")
            .match_body(Matcher::Json(json!({})))
            .with_status(204)
            .create_async()
            .await;

        let client = client(&server);
        let response = client
            .connection_action("c1", "charge-points/cp1/actions/start_boost", &json!({}))
            .await
            .unwrap();

        assert_eq!(response, json!({"ok": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_returns_body_verbatim() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock(
                "POST",
                "/connections/c1/home-battery-installation/b1/actions/enable_home_optimization",
            )
            .match_body(Matcher::Json(json!({
                "max_desired_charge_power_w": 3000,
                "max_desired_discharge_power_w": 2000
            })))
            .with_status(200)
            .with_body(json!({"max_desired_charge_power_w": 2500}).to_string())
            .create_async()
            .await;

        let client = client(&server);
        let response = client
            .connection_action(
                "c1",
                "home-battery-installation/b1/actions/enable_home_optimization",
                &json!({
                    "max_desired_charge_power_w": 3000,
                    "max_desired_discharge_power_w": 2000
                }),
            )
            .await
            .unwrap();

        assert_eq!(response, json!({"max_desired_charge_power_w": 2500}));
    }

    #[tokio::test]
    async fn test_battery_chart_url() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/contracts/b1/home_battery_installation/charts/days")
            .match_query(Matcher::UrlEncoded("date".into(), "2024-03-01".into()))
            .with_status(200)
            .with_body(json!({"data": [{"total": 1}]}).to_string())
            .create_async()
            .await;

        let client = client(&server);
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let chart = client
            .battery_chart("b1", ChartKind::Days, date, Revalidate::Never)
            .await.unwrap();

        assert_eq!(chart, Some(json!([{"total": 1}])));
        mock.assert_async().await;
    }
}
