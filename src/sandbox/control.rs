//! HTTP client for the sandbox provisioning service.
//!
//! The provisioning service runs next to the container host and handles the
//! container lifecycle: image boot, snapshot revert, teardown.
//!
//! API: POST /start_container, POST /stop_container/{name},
//! POST /snapshot/revert, GET /status/{name}, GET /list

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::*;

const MAX_ERROR_BODY_CHARS: usize = 512;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ── Retry policy ────────────────────────────────────────────────────

/// Bounded exponential backoff for transient provisioning failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(MAX_BACKOFF)
    }
}

/// Outcome of a single HTTP exchange, before retry policy is applied.
#[derive(Debug)]
enum RequestFailure {
    Retryable(String),
    Fatal(SandboxError),
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

fn truncate_error_body(raw: &str) -> String {
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= MAX_ERROR_BODY_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

// ── Client ──────────────────────────────────────────────────────────

/// Client for one provisioning service.
///
/// Holds no cross-call state besides a registry of sandboxes it created,
/// used for convenience lookups and recovery bookkeeping.
#[derive(Debug, Clone)]
pub struct ControlClient {
    endpoint: ProviderEndpoint,
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    request_timeout: Option<Duration>,
    known: Arc<RwLock<BTreeMap<SandboxName, ConnectionInfo>>>,
}

impl ControlClient {
    pub fn new(
        endpoint: ProviderEndpoint,
        retry: RetryPolicy,
        request_timeout: Option<Duration>,
    ) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SandboxError::Backend(format!("failed to build HTTP client: {e}")))?;
        let base_url = endpoint.base_url().trim_end_matches('/').to_string();
        Ok(Self {
            endpoint,
            base_url,
            client,
            retry,
            request_timeout,
            known: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    pub fn endpoint(&self) -> &ProviderEndpoint {
        &self.endpoint
    }

    /// Sandboxes created through this client that have not been destroyed.
    pub async fn known(&self) -> BTreeMap<SandboxName, ConnectionInfo> {
        self.known.read().await.clone()
    }

    /// Request a new sandbox, retrying transient failures with backoff.
    pub async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle, SandboxError> {
        let url = format!("{}/start_container", self.base_url);

        tracing::info!(
            provider = %self.endpoint,
            name = %config.name,
            os_type = %config.os_type,
            "creating sandbox"
        );

        let mut attempt = 0u32;
        let resp: StartContainerResponse = loop {
            attempt += 1;
            let req = self.with_timeout(self.client.post(&url).json(config));
            match self.send_json(req, "start_container").await {
                Ok(resp) => break resp,
                Err(RequestFailure::Retryable(detail)) if attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        provider = %self.endpoint,
                        name = %config.name,
                        attempt,
                        error = %detail,
                        "sandbox create failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(RequestFailure::Retryable(detail)) => {
                    return Err(SandboxError::Provision(format!(
                        "{detail} (gave up after {attempt} attempts)"
                    )));
                }
                Err(RequestFailure::Fatal(e)) => {
                    return Err(SandboxError::Provision(e.to_string()));
                }
            }
        };

        if resp.status != STATUS_SUCCESS {
            return Err(SandboxError::Provision(format!(
                "start_container returned status {:?}: {}",
                resp.status,
                resp.message.unwrap_or_default()
            )));
        }
        let name = resp.name.unwrap_or_else(|| config.name.clone());
        let connection = resp.connection_info.ok_or_else(|| {
            SandboxError::Provision(format!("start_container for {name} returned no connection_info"))
        })?;

        tracing::info!(
            provider = %self.endpoint,
            name = %name,
            connection = %connection,
            attempts = attempt,
            "sandbox created"
        );

        self.known
            .write()
            .await
            .insert(name.clone(), connection.clone());

        Ok(SandboxHandle::new(
            name,
            self.endpoint.clone(),
            connection,
            config.clone(),
        ))
    }

    /// Reset a sandbox to a named snapshot.
    ///
    /// No retry and no deadline here: the caller runs this inside an
    /// isolated worker and owns both.
    pub async fn revert(&self, name: &str, snapshot_name: &str) -> Result<(), SandboxError> {
        let url = format!("{}/snapshot/revert", self.base_url);
        let body = RevertRequest {
            container_name: name.to_string(),
            snapshot_name: snapshot_name.to_string(),
        };

        tracing::info!(provider = %self.endpoint, name = %name, snapshot = %snapshot_name, "reverting sandbox");

        let resp: StatusOnlyResponse = self
            .send_json(self.client.post(&url).json(&body), "snapshot/revert")
            .await
            .map_err(|f| match f {
                RequestFailure::Retryable(detail) => SandboxError::Revert(detail),
                RequestFailure::Fatal(SandboxError::NotFound(n)) => SandboxError::NotFound(n),
                RequestFailure::Fatal(e) => SandboxError::Revert(e.to_string()),
            })?;

        if resp.status != STATUS_SUCCESS {
            return Err(SandboxError::Revert(format!(
                "revert of {name} to {snapshot_name} returned status {:?}: {}",
                resp.status,
                resp.message.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Tear a sandbox down. Best effort: failures are logged, never returned.
    pub async fn destroy(&self, name: &str) {
        self.known.write().await.remove(name);

        let url = format!("{}/stop_container/{}", self.base_url, name);
        tracing::info!(provider = %self.endpoint, name = %name, "destroying sandbox");

        let req = self.with_timeout(self.client.post(&url));
        match self.send_json::<StatusOnlyResponse>(req, "stop_container").await {
            Ok(resp) if resp.status == STATUS_SUCCESS => {
                tracing::info!(provider = %self.endpoint, name = %name, "sandbox destroyed");
            }
            Ok(resp) => {
                tracing::warn!(
                    provider = %self.endpoint,
                    name = %name,
                    status = %resp.status,
                    message = %resp.message.unwrap_or_default(),
                    "stop_container did not report success"
                );
            }
            Err(RequestFailure::Fatal(SandboxError::NotFound(_))) => {
                tracing::warn!(provider = %self.endpoint, name = %name, "sandbox already gone");
            }
            Err(RequestFailure::Retryable(detail)) => {
                tracing::warn!(provider = %self.endpoint, name = %name, error = %detail, "failed to destroy sandbox");
            }
            Err(RequestFailure::Fatal(e)) => {
                tracing::warn!(provider = %self.endpoint, name = %name, error = %e, "failed to destroy sandbox");
            }
        }
    }

    /// Containers the provider currently knows about.
    pub async fn list(&self) -> Result<Vec<ContainerSummary>, SandboxError> {
        let url = format!("{}/list", self.base_url);
        let resp: ListResponse = self
            .send_json(self.with_timeout(self.client.get(&url)), "list")
            .await
            .map_err(into_backend_error)?;

        if let Some(status) = resp.status.as_deref() {
            if status != STATUS_SUCCESS {
                return Err(SandboxError::Backend(format!("list returned status {status:?}")));
            }
        }

        Ok(resp
            .containers
            .into_iter()
            .map(|c| c.into_summary(&self.endpoint))
            .collect())
    }

    /// Status and current connection info of one sandbox.
    pub async fn status(&self, name: &str) -> Result<ContainerStatusResponse, SandboxError> {
        let url = format!("{}/status/{}", self.base_url, name);
        let resp: ContainerStatusResponse = self
            .send_json(self.with_timeout(self.client.get(&url)), "status")
            .await
            .map_err(into_backend_error)?;

        if resp.status != STATUS_SUCCESS {
            return Err(SandboxError::Backend(format!(
                "status of {name} returned {:?}: {}",
                resp.status,
                resp.message.clone().unwrap_or_default()
            )));
        }
        Ok(resp)
    }

    fn with_timeout(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.request_timeout {
            Some(timeout) => req.timeout(timeout),
            None => req,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, RequestFailure> {
        let resp = req.send().await.map_err(|e| {
            let detail = format!("{what} request to {} failed: {e}", self.endpoint);
            if e.is_timeout() || e.is_connect() || e.is_request() {
                RequestFailure::Retryable(detail)
            } else {
                RequestFailure::Fatal(SandboxError::Backend(detail))
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(RequestFailure::Fatal(SandboxError::NotFound(format!(
                "{what} on {} returned 404",
                self.endpoint
            ))));
        }
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .map(|b| truncate_error_body(&b))
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            let detail = format!("{what} on {} returned {status}: {body}", self.endpoint);
            return Err(if is_retryable_status(status.as_u16()) {
                RequestFailure::Retryable(detail)
            } else {
                RequestFailure::Fatal(SandboxError::Backend(detail))
            });
        }

        resp.json::<T>().await.map_err(|e| {
            RequestFailure::Fatal(SandboxError::Serde(format!(
                "failed to parse {what} response: {e}"
            )))
        })
    }
}

fn into_backend_error(failure: RequestFailure) -> SandboxError {
    match failure {
        RequestFailure::Retryable(detail) => SandboxError::Backend(detail),
        RequestFailure::Fatal(e) => e,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_config(name: &str) -> SandboxConfig {
        SandboxConfig {
            name: name.into(),
            os_type: "ubuntu".into(),
            screen_width: 1920,
            screen_height: 1080,
            disk_size: "32G".into(),
            ram_size: "4G".into(),
            cpu_cores: 4,
            headless: true,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        }
    }

    fn client_for(server: &mockito::ServerGuard) -> ControlClient {
        let endpoint: ProviderEndpoint = server.host_with_port().parse().unwrap();
        ControlClient::new(endpoint, fast_retry(), Some(Duration::from_secs(5))).unwrap()
    }

    const CREATED: &str = r#"{
        "status": "success",
        "name": "envpool-0-abc123",
        "connection_info": "127.0.0.1:5000:9222:8006:8080"
    }"#;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(30), MAX_BACKOFF);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn error_body_is_truncated_to_one_line() {
        let long = "x\n".repeat(1000);
        let out = truncate_error_body(&long);
        assert!(!out.contains('\n'));
        assert_eq!(out.chars().count(), MAX_ERROR_BODY_CHARS);
    }

    #[tokio::test]
    async fn create_succeeds_on_third_attempt_after_two_500s() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/start_container")
            .with_status(500)
            .with_body("provider overloaded")
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/start_container")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(CREATED)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let handle = client.create(&sandbox_config("envpool-0-abc123")).await.unwrap();

        failing.assert_async().await;
        ok.assert_async().await;
        assert_eq!(handle.name(), "envpool-0-abc123");
        assert_eq!(handle.connection_string(), "127.0.0.1:5000:9222:8006:8080");
        assert!(client.known().await.contains_key("envpool-0-abc123"));
    }

    #[tokio::test]
    async fn create_gives_up_after_max_attempts() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/start_container")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.create(&sandbox_config("s")).await.unwrap_err();

        failing.assert_async().await;
        assert!(matches!(err, SandboxError::Provision(_)));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[tokio::test]
    async fn create_does_not_retry_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/start_container")
            .with_status(400)
            .with_body("bad os_type")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.create(&sandbox_config("s")).await.unwrap_err();

        rejected.assert_async().await;
        assert!(matches!(err, SandboxError::Provision(_)));
        assert!(err.to_string().contains("bad os_type"));
    }

    #[tokio::test]
    async fn create_rejects_non_success_status_field() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/start_container")
            .with_status(200)
            .with_body(r#"{"status":"error","message":"image missing"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.create(&sandbox_config("s")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)));
        assert!(err.to_string().contains("image missing"));
        assert!(client.known().await.is_empty());
    }

    #[tokio::test]
    async fn revert_sends_container_and_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let revert = server
            .mock("POST", "/snapshot/revert")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "container_name": "envpool-1",
                "snapshot_name": "init_state"
            })))
            .with_status(200)
            .with_body(r#"{"status":"success"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        client.revert("envpool-1", "init_state").await.unwrap();
        revert.assert_async().await;
    }

    #[tokio::test]
    async fn revert_failure_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let revert = server
            .mock("POST", "/snapshot/revert")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.revert("envpool-1", "init_state").await.unwrap_err();
        revert.assert_async().await;
        assert!(matches!(err, SandboxError::Revert(_)));
    }

    #[tokio::test]
    async fn revert_non_success_status_is_revert_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/snapshot/revert")
            .with_status(200)
            .with_body(r#"{"status":"error","message":"no such snapshot"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.revert("envpool-1", "missing").await.unwrap_err();
        assert!(matches!(err, SandboxError::Revert(_)));
        assert!(err.to_string().contains("no such snapshot"));
    }

    #[tokio::test]
    async fn destroy_swallows_errors_and_forgets_sandbox() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/start_container")
            .with_status(200)
            .with_body(CREATED)
            .create_async()
            .await;
        let stop = server
            .mock("POST", "/stop_container/envpool-0-abc123")
            .with_status(500)
            .create_async()
            .await;

        let client = client_for(&server);
        client.create(&sandbox_config("envpool-0-abc123")).await.unwrap();
        client.destroy("envpool-0-abc123").await;

        stop.assert_async().await;
        assert!(client.known().await.is_empty());
    }

    #[tokio::test]
    async fn list_and_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/list")
            .with_status(200)
            .with_body(r#"{"containers":["envpool-0", {"name":"other","status":"running"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/status/envpool-0")
            .with_status(200)
            .with_body(r#"{"status":"success","connection_info":"h:1:2:3:4"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/status/gone")
            .with_status(404)
            .create_async()
            .await;

        let client = client_for(&server);
        let list = client.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "envpool-0");

        let status = client.status("envpool-0").await.unwrap();
        assert_eq!(status.connection_info.unwrap().host, "h");

        let err = client.status("gone").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }
}
