//! Blocking HTTP client for the SQ Insights partner API.
//!
//! - GET only, authenticated with a static `X-API-Key` header.
//! - Every call, successful or not, is recorded as one `sync_logs` row.
//! - The wire is abstracted behind [`Transport`] so the sync pipeline can be
//!   driven by a scripted partner in tests; production uses `ureq`.

use log::{debug, warn};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::db::models::{NewSyncLog, RunContext};
use crate::db::store::SyncLogStore;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const API_KEY_HEADER: &str = "X-API-Key";

/// Status line and body of a completed HTTP exchange, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Io(String),
}

pub trait Transport: Send + Sync + 'static {
    fn get(&self, url: &str, query: &[(&str, String)], headers: &[(&str, &str)])
    -> Result<RawResponse, TransportError>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            // non-2xx bodies are needed for the error message and the log row
            .http_status_as_error(false)
            .build();
        UreqTransport { agent: config.into() }
    }
}

impl Transport for UreqTransport {
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<RawResponse, TransportError> {
        let mut req = self.agent.get(url);
        for (k, v) in query {
            req = req.query(*k, v.as_str());
        }
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        match req.call() {
            Ok(mut res) => {
                let status = res.status().as_u16();
                let body = res.body_mut().read_to_string().map_err(map_ureq_error)?;
                Ok(RawResponse { status, body })
            }
            Err(e) => Err(map_ureq_error(e)),
        }
    }
}

fn map_ureq_error(e: ureq::Error) -> TransportError {
    match e {
        ureq::Error::Timeout(_) => TransportError::Timeout,
        other => TransportError::Io(other.to_string()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to {endpoint} timed out after {}s", .after.as_secs())]
    Timeout { endpoint: String, after: Duration },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("partner API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid JSON from partner API: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct InsightsClient<T: Transport = UreqTransport> {
    transport: T,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl InsightsClient<UreqTransport> {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        InsightsClient::with_transport(UreqTransport::new(timeout), base_url, api_key, timeout)
    }
}

impl<T: Transport> InsightsClient<T> {
    pub fn with_transport(transport: T, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        InsightsClient {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    /// Authenticated GET returning parsed JSON.
    ///
    /// Writes exactly one log row through `logs` regardless of outcome;
    /// failing to write it is only warned about.
    pub fn fetch_json(
        &self,
        logs: &dyn SyncLogStore,
        run: &RunContext,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ClientError> {
        let logged_endpoint = endpoint_with_query(endpoint, query);
        let started = Instant::now();
        let outcome = self.transport.get(
            &self.url(endpoint),
            query,
            &[(API_KEY_HEADER, self.api_key.as_str()), ("Accept", "application/json")],
        );
        let elapsed = started.elapsed();

        let (result, entry) = match outcome {
            Ok(raw) if (200..300).contains(&raw.status) => match serde_json::from_str::<Value>(&raw.body) {
                Ok(value) => {
                    let entry = NewSyncLog::api_call(run, &logged_endpoint, elapsed, Some(raw.status), Some(&raw.body), None);
                    (Ok(value), entry)
                }
                Err(e) => {
                    let err = ClientError::Json(e);
                    let entry = NewSyncLog::api_call(
                        run,
                        &logged_endpoint,
                        elapsed,
                        Some(raw.status),
                        Some(&raw.body),
                        Some(err.to_string()),
                    );
                    (Err(err), entry)
                }
            },
            Ok(raw) => {
                let entry = NewSyncLog::api_call(
                    run,
                    &logged_endpoint,
                    elapsed,
                    Some(raw.status),
                    Some(&raw.body),
                    Some(format!("HTTP {}: {}", raw.status, raw.body)),
                );
                (
                    Err(ClientError::Http {
                        status: raw.status,
                        body: raw.body,
                    }),
                    entry,
                )
            }
            Err(TransportError::Timeout) => {
                let err = ClientError::Timeout {
                    endpoint: logged_endpoint.clone(),
                    after: self.timeout,
                };
                let entry = NewSyncLog::api_call(run, &logged_endpoint, elapsed, None, None, Some(err.to_string()));
                (Err(err), entry)
            }
            Err(TransportError::Io(msg)) => {
                let err = ClientError::Transport(msg);
                let entry = NewSyncLog::api_call(run, &logged_endpoint, elapsed, None, None, Some(err.to_string()));
                (Err(err), entry)
            }
        };

        debug!(
            "GET {} -> {} in {}ms",
            logged_endpoint,
            entry.status_code.map_or_else(|| "-".to_string(), |s| s.to_string()),
            entry.duration_ms
        );
        if let Err(e) = logs.append_sync_log(&entry) {
            warn!("Failed to record sync log for {}: {}", logged_endpoint, e);
        }
        result
    }
}

fn endpoint_with_query(endpoint: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return endpoint.to_string();
    }
    let qs = query.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
    format!("{endpoint}?{qs}")
}
