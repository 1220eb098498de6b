use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;

use super::configuration::Config;
use super::{worker_url, Endpoint, WORKER_PREFIX};
use crate::error::{FlareProxError, TransportError};

const API_ENDPOINT: &str = "https://api.cloudflare.com/client/v4";
const WORKER_SCRIPT: &str = include_str!("worker.js");

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct Envelope<T> {
    result: Option<T>,
}

#[derive(Deserialize)]
struct SubdomainResult {
    subdomain: Option<String>,
}

#[derive(Deserialize)]
struct UploadResult {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ScriptSummary {
    #[serde(default)]
    id: String,
    created_on: Option<String>,
}

/// What came back from a single request through a worker.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Response {
        status_code: u16,
        response_length: usize,
        headers: BTreeMap<String, String>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub success: bool,
    pub outcome: TestOutcome,
}

impl TestResult {
    pub fn from_response(response: &ProbeResponse, success: bool) -> Self {
        Self {
            success,
            outcome: TestOutcome::Response {
                status_code: response.status.as_u16(),
                response_length: response.body.len(),
                headers: response.headers.clone(),
            },
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome: TestOutcome::Error {
                error: error.into(),
            },
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.outcome {
            TestOutcome::Response { status_code, .. } => Some(status_code),
            TestOutcome::Error { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, TransportError)>,
}

pub struct CloudflareManager {
    client: Client,
    api_endpoint: String,
    api_token: String,
    account_id: String,
    subdomain: OnceCell<String>,
}

impl CloudflareManager {
    pub fn new(client: Client, config: &Config) -> Self {
        Self::with_api_endpoint(client, config, API_ENDPOINT)
    }

    pub fn with_api_endpoint(
        client: Client,
        config: &Config,
        api_endpoint: impl Into<String>,
    ) -> Self {
        tracing::debug!(
            account_id = %config.account_id,
            zone_id = ?config.zone_id,
            "Using Cloudflare account"
        );
        Self {
            client,
            api_endpoint: api_endpoint.into(),
            api_token: config.api_token.clone(),
            account_id: config.account_id.clone(),
            subdomain: OnceCell::new(),
        }
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/accounts/{}/{}",
            self.api_endpoint, self.account_id, path
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.api_token)
    }

    /// The account's `*.workers.dev` subdomain. Looked up once; if the lookup
    /// fails the lower-cased account id is used instead.
    pub async fn worker_subdomain(&self) -> &str {
        self.subdomain
            .get_or_init(|| async {
                match self.lookup_subdomain().await {
                    Ok(Some(subdomain)) => subdomain,
                    Ok(None) => self.account_id.to_lowercase(),
                    Err(err) => {
                        tracing::warn!(error = %err, "Subdomain lookup failed, using account id");
                        self.account_id.to_lowercase()
                    }
                }
            })
            .await
    }

    async fn lookup_subdomain(&self) -> Result<Option<String>, TransportError> {
        let request = self
            .client
            .get(self.account_url("workers/subdomain"))
            .timeout(METADATA_TIMEOUT);
        let response = ensure_success(self.authorized(request).send().await?).await?;
        let envelope = response.json::<Envelope<SubdomainResult>>().await?;

        Ok(envelope
            .result
            .and_then(|result| result.subdomain)
            .filter(|subdomain| !subdomain.is_empty()))
    }

    pub async fn create_deployment(&self, name: Option<&str>) -> Result<Endpoint, FlareProxError> {
        let name = name.map_or_else(generate_worker_name, str::to_string);

        let response = self
            .upload_script(&name)
            .await
            .map_err(|err| FlareProxError::deployment("create worker", err))?;
        let id = response
            .json::<Envelope<UploadResult>>()
            .await
            .ok()
            .and_then(|envelope| envelope.result)
            .and_then(|result| result.id)
            .unwrap_or_else(|| name.clone());

        // The worker can still be reachable through other routes.
        if let Err(err) = self.enable_subdomain(&name).await {
            tracing::warn!(worker = %name, error = %err, "Could not enable workers.dev subdomain");
        }

        let url = worker_url(&name, self.worker_subdomain().await);
        tracing::debug!(worker = %name, %url, "Worker deployed");

        Ok(Endpoint {
            name,
            url,
            created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            id: Some(id),
        })
    }

    async fn upload_script(&self, name: &str) -> Result<Response, TransportError> {
        let metadata = json!({
            "body_part": "script",
            "main_module": "worker.js",
        });
        let script = Part::text(WORKER_SCRIPT)
            .file_name("worker.js")
            .mime_str("application/javascript")?;
        let form = Form::new()
            .text("metadata", metadata.to_string())
            .part("script", script);

        let request = self
            .client
            .put(self.account_url(&format!("workers/scripts/{}", name)))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT);

        ensure_success(self.authorized(request).send().await?).await
    }

    async fn enable_subdomain(&self, name: &str) -> Result<(), TransportError> {
        let request = self
            .client
            .post(self.account_url(&format!("workers/scripts/{}/subdomain", name)))
            .json(&json!({ "enabled": true }))
            .timeout(METADATA_TIMEOUT);

        ensure_success(self.authorized(request).send().await?).await?;
        Ok(())
    }

    pub async fn list_deployments(&self) -> Result<Vec<Endpoint>, FlareProxError> {
        let scripts = self
            .list_scripts()
            .await
            .map_err(|err| FlareProxError::deployment("list workers", err))?;

        let ours: Vec<ScriptSummary> = scripts
            .into_iter()
            .filter(|script| script.id.starts_with(WORKER_PREFIX))
            .collect();
        if ours.is_empty() {
            return Ok(Vec::new());
        }

        let subdomain = self.worker_subdomain().await;
        Ok(ours
            .into_iter()
            .map(|script| Endpoint {
                url: worker_url(&script.id, subdomain),
                name: script.id,
                created_at: script.created_on.unwrap_or_else(|| "unknown".to_string()),
                id: None,
            })
            .collect())
    }

    async fn list_scripts(&self) -> Result<Vec<ScriptSummary>, TransportError> {
        let request = self
            .client
            .get(self.account_url("workers/scripts"))
            .timeout(METADATA_TIMEOUT);
        let response = ensure_success(self.authorized(request).send().await?).await?;
        let envelope = response.json::<Envelope<Vec<ScriptSummary>>>().await?;

        Ok(envelope.result.unwrap_or_default())
    }

    /// One request through `deployment_url`; any HTTP status counts as success.
    pub async fn test_deployment(
        &self,
        deployment_url: &str,
        target_url: &str,
        method: &Method,
    ) -> TestResult {
        match probe(&self.client, deployment_url, target_url, method).await {
            Ok(response) => TestResult::from_response(&response, true),
            Err(err) => TestResult::failed(err.to_string()),
        }
    }

    /// Deletes a worker. A worker that is already gone counts as deleted.
    pub async fn delete_worker(&self, name: &str) -> Result<(), TransportError> {
        let request = self
            .client
            .delete(self.account_url(&format!("workers/scripts/{}", name)))
            .timeout(METADATA_TIMEOUT);
        let response = self.authorized(request).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(TransportError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn cleanup_all(&self) -> Result<CleanupReport, FlareProxError> {
        let mut report = CleanupReport::default();

        for worker in self.list_deployments().await? {
            match self.delete_worker(&worker.name).await {
                Ok(()) => report.deleted.push(worker.name),
                Err(err) => {
                    tracing::warn!(worker = %worker.name, error = %err, "Could not delete worker");
                    report.failed.push((worker.name, err));
                }
            }
        }

        Ok(report)
    }
}

/// Sends `method` to a worker with the target passed as the `url` query
/// parameter. No retries.
pub async fn probe(
    client: &Client,
    deployment_url: &str,
    target_url: &str,
    method: &Method,
) -> Result<ProbeResponse, TransportError> {
    let response = client
        .request(method.clone(), deployment_url)
        .query(&[("url", target_url)])
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?;

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();
    let body = response.bytes().await?.to_vec();

    Ok(ProbeResponse {
        status,
        headers,
        body,
    })
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(TransportError::Status {
        status,
        body: response.text().await.unwrap_or_default(),
    })
}

/// `flareprox-<unix seconds>-<six lowercase letters>`.
pub fn generate_worker_name() -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect();

    format!("{}{}-{}", WORKER_PREFIX, timestamp, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const ACCOUNT: &str = "ACCOUNT123";

    fn manager_for(server: &MockServer) -> CloudflareManager {
        let config = Config {
            api_token: "token".to_string(),
            account_id: ACCOUNT.to_string(),
            zone_id: None,
        };
        CloudflareManager::with_api_endpoint(Client::new(), &config, server.base_url())
    }

    fn scripts_path() -> String {
        format!("/accounts/{}/workers/scripts", ACCOUNT)
    }

    fn subdomain_path() -> String {
        format!("/accounts/{}/workers/subdomain", ACCOUNT)
    }

    #[test]
    fn worker_names_carry_prefix_and_suffix() {
        let name = generate_worker_name();
        let rest = name.strip_prefix(WORKER_PREFIX).expect("prefix");
        let (timestamp, suffix) = rest.split_once('-').expect("separator");

        assert!(timestamp.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|ch| ch.is_ascii_lowercase()));
    }

    #[test]
    fn script_keeps_query_parameter_ahead_of_header() {
        let query = WORKER_SCRIPT
            .find("url.searchParams.get('url')")
            .expect("query lookup");
        let header = WORKER_SCRIPT
            .find("headers.get('X-Target-URL')")
            .expect("header lookup");
        let path = WORKER_SCRIPT.find("url.pathname.slice(1)").expect("path lookup");

        assert!(query < header);
        assert!(header < path);
    }

    #[tokio::test]
    async fn create_uploads_script_and_enables_subdomain() {
        let server = MockServer::start_async().await;
        let name = "flareprox-1-abcdef";

        let upload = server.mock(|when, then| {
            when.method(PUT)
                .path(format!("{}/{}", scripts_path(), name))
                .header("authorization", "Bearer token");
            then.status(200)
                .json_body(serde_json::json!({ "result": { "id": "script-id" } }));
        });
        let enable = server.mock(|when, then| {
            when.method(POST)
                .path(format!("{}/{}/subdomain", scripts_path(), name))
                .json_body(serde_json::json!({ "enabled": true }));
            then.status(200);
        });
        let subdomain = server.mock(|when, then| {
            when.method(GET).path(subdomain_path());
            then.status(200)
                .json_body(serde_json::json!({ "result": { "subdomain": "myacct" } }));
        });

        let endpoint = manager_for(&server)
            .create_deployment(Some(name))
            .await
            .expect("create should succeed");

        upload.assert();
        enable.assert();
        subdomain.assert();
        assert_eq!(endpoint.name, name);
        assert_eq!(endpoint.url, "https://flareprox-1-abcdef.myacct.workers.dev");
        assert_eq!(endpoint.id.as_deref(), Some("script-id"));
    }

    #[tokio::test]
    async fn create_survives_subdomain_enable_failure() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(PUT);
            then.status(200).json_body(serde_json::json!({ "result": {} }));
        });
        server.mock(|when, then| {
            when.method(POST);
            then.status(500);
        });
        server.mock(|when, then| {
            when.method(GET).path(subdomain_path());
            then.status(500);
        });

        let endpoint = manager_for(&server)
            .create_deployment(Some("flareprox-2-ghijkl"))
            .await
            .expect("subdomain failures are not fatal");

        assert_eq!(endpoint.id.as_deref(), Some("flareprox-2-ghijkl"));
        assert_eq!(endpoint.url, "https://flareprox-2-ghijkl.account123.workers.dev");
    }

    #[tokio::test]
    async fn create_fails_when_upload_is_rejected() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(PUT);
            then.status(403).body("forbidden");
        });

        let err = manager_for(&server)
            .create_deployment(None)
            .await
            .expect_err("upload failure must surface");

        assert!(matches!(
            err,
            FlareProxError::Deployment {
                cause: TransportError::Status { status, .. },
                ..
            } if status == StatusCode::FORBIDDEN
        ));
    }

    #[tokio::test]
    async fn list_only_returns_prefixed_workers() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path(scripts_path());
            then.status(200).json_body(serde_json::json!({
                "result": [
                    { "id": "flareprox-1-aaaaaa", "created_on": "2024-01-01T00:00:00Z" },
                    { "id": "unrelated-worker" },
                    { "id": "my-flareprox-1" },
                    { "id": "flareprox-2-bbbbbb" }
                ]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path(subdomain_path());
            then.status(200)
                .json_body(serde_json::json!({ "result": { "subdomain": "sub" } }));
        });

        let endpoints = manager_for(&server).list_deployments().await.unwrap();

        let names: Vec<_> = endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["flareprox-1-aaaaaa", "flareprox-2-bbbbbb"]);
        assert!(endpoints.iter().all(|e| e.name.starts_with(WORKER_PREFIX)));
        assert_eq!(endpoints[0].created_at, "2024-01-01T00:00:00Z");
        assert_eq!(endpoints[1].created_at, "unknown");
        assert_eq!(endpoints[1].url, "https://flareprox-2-bbbbbb.sub.workers.dev");
    }

    #[tokio::test]
    async fn list_failure_is_a_deployment_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path(scripts_path());
            then.status(500);
        });

        let err = manager_for(&server).list_deployments().await.unwrap_err();
        assert!(matches!(err, FlareProxError::Deployment { .. }));
    }

    #[tokio::test]
    async fn subdomain_is_looked_up_once() {
        let server = MockServer::start_async().await;
        let lookup = server.mock(|when, then| {
            when.method(GET).path(subdomain_path());
            then.status(200)
                .json_body(serde_json::json!({ "result": { "subdomain": "once" } }));
        });

        let manager = manager_for(&server);
        assert_eq!(manager.worker_subdomain().await, "once");
        assert_eq!(manager.worker_subdomain().await, "once");
        lookup.assert();
    }

    #[tokio::test]
    async fn cleanup_treats_missing_workers_as_deleted() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path(scripts_path());
            then.status(200).json_body(serde_json::json!({
                "result": [
                    { "id": "flareprox-1-gone" },
                    { "id": "flareprox-2-here" },
                    { "id": "flareprox-3-stuck" },
                    { "id": "someone-else" }
                ]
            }));
        });
        server.mock(|when, then| {
            when.method(DELETE)
                .path(format!("{}/flareprox-1-gone", scripts_path()));
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(DELETE)
                .path(format!("{}/flareprox-2-here", scripts_path()));
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(DELETE)
                .path(format!("{}/flareprox-3-stuck", scripts_path()));
            then.status(500);
        });

        let report = manager_for(&server).cleanup_all().await.unwrap();

        assert_eq!(report.deleted, ["flareprox-1-gone", "flareprox-2-here"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "flareprox-3-stuck");
        assert_eq!(
            report.failed[0].1.status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
    }

    #[tokio::test]
    async fn test_deployment_reports_any_status_as_transport_success() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/")
                .query_param("url", "https://example.com/ip");
            then.status(502).header("x-probe", "yes").body("bad gateway");
        });

        let result = manager_for(&server)
            .test_deployment(&server.base_url(), "https://example.com/ip", &reqwest::Method::POST)
            .await;

        mock.assert();
        assert!(result.success);
        match result.outcome {
            TestOutcome::Response {
                status_code,
                response_length,
                headers,
            } => {
                assert_eq!(status_code, 502);
                assert_eq!(response_length, "bad gateway".len());
                assert_eq!(headers.get("x-probe").map(String::as_str), Some("yes"));
            }
            TestOutcome::Error { error } => panic!("unexpected error: {error}"),
        }
    }

    #[tokio::test]
    async fn test_deployment_reports_transport_failure() {
        let server = MockServer::start_async().await;
        let manager = manager_for(&server);

        let result = manager
            .test_deployment("http://127.0.0.1:1", "https://example.com", &reqwest::Method::GET)
            .await;

        assert!(!result.success);
        assert!(matches!(result.outcome, TestOutcome::Error { .. }));
    }
}
