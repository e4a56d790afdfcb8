//! Base HTTP client for the archive REST API.
//!
//! All requests go through a retry ladder (transient status codes and
//! transport errors, exponential backoff) and a single 401-triggered
//! token refresh with exactly one replay. The refresh is guarded by a
//! non-blocking single-slot gate so concurrent 401 bursts coalesce and
//! a refresh that itself runs into a 401 can never deadlock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::multipart;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::error::{ApiError, ApiResult};

/// Maximum attempts per request, including the first.
const MAX_RETRIES: u32 = 3;
/// Status codes worth retrying; other 4xx are surfaced immediately.
const RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];
/// Backoff base in seconds; doubled per attempt.
const RETRY_BACKOFF_SECS: f64 = 1.0;

/// Async callback that tries to renew the JWT; returns true on success.
pub type AuthRefreshCallback = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
/// Callback invoked when the session is gone for good (reason string).
pub type ForcedLogoutCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// API endpoint configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://acencia.info/api".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Single-slot non-blocking gate for the token refresh.
///
/// `try_acquire` either takes the slot or reports that someone else
/// holds it; it never waits. A recursive refresh attempt from the same
/// logical call chain (refresh -> verify -> get -> 401) therefore
/// returns immediately instead of deadlocking.
pub(crate) struct RefreshGate {
    busy: AtomicBool,
}

impl RefreshGate {
    pub(crate) fn new() -> Self {
        Self { busy: AtomicBool::new(false) }
    }

    pub(crate) fn try_acquire(&self) -> Option<RefreshGateGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RefreshGateGuard { gate: self })
        } else {
            None
        }
    }
}

pub(crate) struct RefreshGateGuard<'a> {
    gate: &'a RefreshGate,
}

impl Drop for RefreshGateGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

/// Base client for authenticated JSON and multipart calls.
#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    client: reqwest::Client,
    token: Arc<RwLock<Option<String>>>,
    refresh_gate: Arc<RefreshGate>,
    refresh_callback: Arc<RwLock<Option<AuthRefreshCallback>>>,
    forced_logout_callback: Arc<RwLock<Option<ForcedLogoutCallback>>>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Self {
        let client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            client,
            token: Arc::new(RwLock::new(None)),
            refresh_gate: Arc::new(RefreshGate::new()),
            refresh_callback: Arc::new(RwLock::new(None)),
            forced_logout_callback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url(), endpoint.trim_start_matches('/'))
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap() = Some(token.into());
        debug!("Token gesetzt");
    }

    pub fn clear_token(&self) {
        *self.token.write().unwrap() = None;
        debug!("Token entfernt");
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().unwrap().is_some()
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap().clone()
    }

    /// Register the callback used to renew the token on a 401.
    pub fn set_auth_refresh_callback(&self, callback: AuthRefreshCallback) {
        *self.refresh_callback.write().unwrap() = Some(callback);
    }

    /// Register the callback fired when the session is invalid and no
    /// refresh is possible (session ended, user locked or disabled).
    pub fn set_forced_logout_callback(&self, callback: ForcedLogoutCallback) {
        *self.forced_logout_callback.write().unwrap() = Some(callback);
    }

    fn bearer(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Attempt a token refresh; at most one runs at a time.
    ///
    /// Returns false without blocking when a refresh is already in
    /// flight or when this call re-entered the gate recursively. On a
    /// failed refresh the forced-logout callback fires.
    async fn try_auth_refresh(&self, reason: &str) -> bool {
        let callback = self.refresh_callback.read().unwrap().clone();
        let Some(callback) = callback else {
            self.trigger_forced_logout(reason);
            return false;
        };

        let Some(_guard) = self.refresh_gate.try_acquire() else {
            return false;
        };

        let success = callback().await;
        if !success {
            self.trigger_forced_logout(reason);
        }
        success
    }

    fn trigger_forced_logout(&self, reason: &str) {
        let callback = self.forced_logout_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            warn!("Erzwungener Logout: {}", reason);
            self.clear_token();
            callback(reason);
        }
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_secs_f64(RETRY_BACKOFF_SECS * 2f64.powi(attempt as i32))
    }

    /// Send a request with the retry ladder applied.
    ///
    /// `build` constructs a fresh request per attempt so bodies stay
    /// readable across retries.
    async fn send_with_retry<F>(&self, build: &F) -> Result<reqwest::Response, reqwest::Error>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if RETRY_STATUS_CODES.contains(&status) && attempt + 1 < MAX_RETRIES {
                        let wait = Self::backoff(attempt);
                        warn!(
                            "HTTP {} von {}, Retry {}/{} in {:.1}s",
                            status,
                            response.url(),
                            attempt + 1,
                            MAX_RETRIES,
                            wait.as_secs_f64()
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt + 1 < MAX_RETRIES => {
                    let wait = Self::backoff(attempt);
                    warn!(
                        "Verbindungsfehler ({}), Retry {}/{} in {:.1}s",
                        e,
                        attempt + 1,
                        MAX_RETRIES,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse the response envelope; HTTP >= 400 becomes `ApiError::Api`.
    async fn handle_response(response: reqwest::Response) -> ApiResult<Value> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let data: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                if status >= 400 {
                    return Err(ApiError::api(status, format!("Server-Fehler: {}", status)));
                }
                return Ok(serde_json::json!({ "raw": text }));
            }
        };

        if status >= 400 {
            let message = data
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(ApiError::Api {
                status_code: status,
                message,
                details: data.get("details").cloned().unwrap_or(Value::Null),
            });
        }

        Ok(data)
    }

    /// Run a request with retries, then at most one refresh-and-replay
    /// on the first 401.
    async fn execute<F>(&self, build: F) -> ApiResult<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let first = match self.send_with_retry(&build).await {
            Ok(response) => Self::handle_response(response).await,
            Err(e) => {
                error!("Netzwerkfehler: {}", e);
                return Err(ApiError::Network(e.to_string()));
            }
        };

        match first {
            Err(ApiError::Api { status_code: 401, message, details }) => {
                if self.try_auth_refresh(&message).await {
                    info!("Token erneuert, wiederhole Request");
                    match self.send_with_retry(&build).await {
                        Ok(response) => Self::handle_response(response).await,
                        Err(e) => Err(ApiError::Network(e.to_string())),
                    }
                } else {
                    Err(ApiError::Api { status_code: 401, message, details })
                }
            }
            other => other,
        }
    }

    pub async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> ApiResult<Value> {
        let url = self.url(endpoint);
        debug!("GET {}", url);
        let params: Vec<(String, String)> =
            params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        self.execute(|| {
            self.bearer(self.client.get(&url))
                .header("Accept", "application/json")
                .query(&params)
                .timeout(self.config.timeout)
        })
        .await
    }

    pub async fn post(&self, endpoint: &str, json: &Value) -> ApiResult<Value> {
        self.post_with_timeout(endpoint, json, self.config.timeout).await
    }

    pub async fn post_with_timeout(
        &self,
        endpoint: &str,
        json: &Value,
        timeout: Duration,
    ) -> ApiResult<Value> {
        let url = self.url(endpoint);
        debug!("POST {}", url);
        self.execute(|| {
            self.bearer(self.client.post(&url))
                .header("Accept", "application/json")
                .json(json)
                .timeout(timeout)
        })
        .await
    }

    pub async fn put(&self, endpoint: &str, json: &Value) -> ApiResult<Value> {
        let url = self.url(endpoint);
        debug!("PUT {}", url);
        self.execute(|| {
            self.bearer(self.client.put(&url))
                .header("Accept", "application/json")
                .json(json)
                .timeout(self.config.timeout)
        })
        .await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResult<Value> {
        let url = self.url(endpoint);
        debug!("DELETE {}", url);
        self.execute(|| {
            self.bearer(self.client.delete(&url))
                .header("Accept", "application/json")
                .timeout(self.config.timeout)
        })
        .await
    }

    /// Upload a file as multipart form data.
    ///
    /// The file is buffered once so every retry and the 401 replay can
    /// rebuild the body from the same bytes. Uploads get twice the
    /// default timeout.
    pub async fn upload_file(
        &self,
        endpoint: &str,
        file_path: &Path,
        fields: &[(String, String)],
    ) -> ApiResult<Value> {
        let url = self.url(endpoint);
        debug!("UPLOAD {} <- {}", url, file_path.display());

        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        let content = tokio::fs::read(file_path)
            .await
            .map_err(|e| ApiError::Network(format!("Datei nicht lesbar: {}", e)))?;
        let content = Arc::new(content);

        let build = || {
            let mut form = multipart::Form::new().part(
                "file",
                multipart::Part::bytes(content.as_ref().clone()).file_name(filename.clone()),
            );
            for (key, value) in fields {
                form = form.text(key.clone(), value.clone());
            }
            self.bearer(self.client.post(&url))
                .multipart(form)
                .timeout(self.config.timeout * 2)
        };

        self.execute(build).await
    }

    /// Streaming download into `target_path`, 8 KiB write buffer.
    ///
    /// Partial output is removed on every error path. Downloads get
    /// three times the default timeout and the same single 401
    /// refresh-and-replay as other calls.
    pub async fn download_file(&self, endpoint: &str, target_path: &Path) -> ApiResult<PathBuf> {
        match self.download_inner(endpoint, target_path).await {
            Err(err) if err.is_unauthorized() => {
                if self.try_auth_refresh(&err.to_string()).await {
                    info!("Token erneuert, wiederhole DOWNLOAD {}", endpoint);
                    self.download_inner(endpoint, target_path).await
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    async fn download_inner(&self, endpoint: &str, target_path: &Path) -> ApiResult<PathBuf> {
        let url = self.url(endpoint);
        debug!("DOWNLOAD {} -> {}", url, target_path.display());

        let build = || self.bearer(self.client.get(&url)).timeout(self.config.timeout * 3);

        let mut response = self
            .send_with_retry(&build)
            .await
            .map_err(|e| ApiError::Network(format!("Download-Fehler: {}", e)))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ApiError::api(status, format!("Download fehlgeschlagen: {}", status)));
        }

        let cleanup = |path: &Path| {
            let _ = std::fs::remove_file(path);
        };

        let file = std::fs::File::create(target_path)
            .map_err(|e| ApiError::Network(format!("Zieldatei nicht erstellbar: {}", e)))?;
        let mut writer = std::io::BufWriter::with_capacity(8192, file);
        let mut bytes_written: u64 = 0;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = writer.write_all(&chunk) {
                        cleanup(target_path);
                        return Err(ApiError::Network(format!("Schreibfehler: {}", e)));
                    }
                    bytes_written += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    cleanup(target_path);
                    return Err(ApiError::Network(format!("Download-Fehler: {}", e)));
                }
            }
        }

        if let Err(e) = writer.flush() {
            cleanup(target_path);
            return Err(ApiError::Network(format!("Schreibfehler: {}", e)));
        }

        debug!("Download erfolgreich: {} bytes -> {}", bytes_written, target_path.display());
        Ok(target_path.to_path_buf())
    }

    /// Probe the API root.
    pub async fn check_connection(&self) -> bool {
        match self.get("/", &[]).await {
            Ok(response) => response.get("status").and_then(Value::as_str) == Some("ok"),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_refresh_gate_single_slot() {
        let gate = RefreshGate::new();
        let first = gate.try_acquire();
        assert!(first.is_some());
        assert!(gate.try_acquire().is_none(), "second acquire must fail while held");
        drop(first);
        assert!(gate.try_acquire().is_some(), "gate must reopen after release");
    }

    fn test_client() -> ApiClient {
        ApiClient::new(ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_concurrent_401_burst_coalesces_to_one_refresh() {
        let client = test_client();
        let refresh_count = Arc::new(AtomicUsize::new(0));

        let counter = refresh_count.clone();
        client.set_auth_refresh_callback(Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Hold the gate long enough for every peer to bounce off.
                tokio::time::sleep(Duration::from_millis(100)).await;
                true
            })
        }));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.try_auth_refresh("simultaneous 401").await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }

        assert_eq!(refresh_count.load(Ordering::SeqCst), 1);
        assert_eq!(successes, 1, "only the gate holder reports a refresh");
    }

    #[tokio::test]
    async fn test_failed_refresh_triggers_forced_logout_once() {
        let client = test_client();
        client.set_token("stale");

        client.set_auth_refresh_callback(Arc::new(|| Box::pin(async { false })));
        let logout_count = Arc::new(AtomicUsize::new(0));
        let counter = logout_count.clone();
        client.set_forced_logout_callback(Arc::new(move |_reason| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!client.try_auth_refresh("session expired").await);
        assert_eq!(logout_count.load(Ordering::SeqCst), 1);
        assert!(!client.is_authenticated(), "token must be wiped on forced logout");
    }

    #[tokio::test]
    async fn test_recursive_refresh_returns_immediately() {
        // refresh -> verify -> get -> 401 -> refresh must not deadlock:
        // the inner attempt bounces off the held gate.
        let client = test_client();
        let inner_client = client.clone();
        client.set_auth_refresh_callback(Arc::new(move || {
            let inner = inner_client.clone();
            Box::pin(async move {
                // Re-entering the gate from inside the refresh.
                let nested = inner.try_auth_refresh("nested 401").await;
                assert!(!nested);
                true
            })
        }));

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            client.try_auth_refresh("outer 401"),
        )
        .await
        .expect("refresh must not deadlock");
        assert!(outcome);
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(ApiClient::backoff(0), Duration::from_secs(1));
        assert_eq!(ApiClient::backoff(1), Duration::from_secs(2));
        assert_eq!(ApiClient::backoff(2), Duration::from_secs(4));
    }
}
