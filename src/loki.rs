/// Loki push client: batches correlated tool events per project and sends
/// them to `/loki/api/v1/push`, retrying on HTTP 429.
///
/// A batch that cannot be delivered is counted and skipped; the run always
/// continues with the next batch.
use crate::ingest::ToolEvent;
use crate::retry::{RetryDecision, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Pause after every accepted push.
pub const PUSH_PACING: Duration = Duration::from_millis(100);

const SERVICE_NAME: &str = "claude-code";
const PUSH_PATH: &str = "/loki/api/v1/push";

/// Body of one push request.
#[derive(Debug, Clone, Serialize)]
pub struct PushRequest {
    pub streams: Vec<PushStream>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushStream {
    pub stream: StreamLabels,
    pub values: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamLabels {
    pub service_name: String,
    pub project: String,
}

/// `[ "<ns timestamp>", "<line>", {structured metadata} ]`
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry(pub String, pub String, pub BTreeMap<&'static str, String>);

impl LogEntry {
    pub fn from_event(ev: &ToolEvent) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("event_name", "tool_result".to_string());
        metadata.insert("tool_name", ev.tool_name.clone());
        metadata.insert("success", ev.success.to_string());
        metadata.insert("session_id", ev.session_id.clone());
        if let Some(ms) = ev.duration_ms {
            metadata.insert("duration_ms", ms.to_string());
        }
        if let Some(params) = &ev.tool_parameters {
            metadata.insert("tool_parameters", params.to_string());
        }
        LogEntry(
            ev.timestamp_ns().to_string(),
            format!("tool_result: {} success={}", ev.tool_name, ev.success),
            metadata,
        )
    }
}

/// Group events by project, sort each group by timestamp, and split into
/// push requests of at most `batch_size` events. Projects come out in name
/// order.
pub fn build_batches(events: &[ToolEvent], batch_size: usize) -> Vec<PushRequest> {
    let batch_size = batch_size.max(1);
    let mut by_project: BTreeMap<&str, Vec<&ToolEvent>> = BTreeMap::new();
    for ev in events {
        by_project.entry(ev.project.as_str()).or_default().push(ev);
    }

    let mut requests = Vec::new();
    for (project, mut group) in by_project {
        group.sort_by_key(|ev| ev.timestamp_ns());
        for chunk in group.chunks(batch_size) {
            requests.push(PushRequest {
                streams: vec![PushStream {
                    stream: StreamLabels {
                        service_name: SERVICE_NAME.to_string(),
                        project: project.to_string(),
                    },
                    values: chunk.iter().map(|ev| LogEntry::from_event(ev)).collect(),
                }],
            });
        }
    }
    requests
}

/// Raw response from a push.
#[derive(Debug, Clone)]
pub struct PushResponse {
    pub status: u16,
    pub body: String,
}

/// Errors from the push path. None of these abort a run.
#[derive(Debug)]
pub enum PushError {
    /// Failed to construct the HTTP client.
    Client(reqwest::Error),
    /// Connection, timeout, or body read failure.
    Request(reqwest::Error),
    /// Non-retryable HTTP status.
    Status { status: u16, body: String },
    /// Still rate limited after every allowed attempt.
    RateLimited { attempts: u32 },
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Client(e) => write!(f, "failed to build HTTP client: {e}"),
            PushError::Request(e) => write!(f, "push request failed: {e}"),
            PushError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            PushError::RateLimited { attempts } => {
                write!(f, "HTTP 429: still rate limited after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for PushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PushError::Client(e) | PushError::Request(e) => Some(e),
            _ => None,
        }
    }
}

/// Delivers one push request and reports the HTTP status.
#[allow(async_fn_in_trait)]
pub trait PushTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, PushError>;
}

/// reqwest-backed transport posting JSON to `{base_url}/loki/api/v1/push`.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PushError::Client)?;
        Ok(Self {
            http,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), PUSH_PATH),
        })
    }
}

impl PushTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, PushError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(PushError::Request)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(PushError::Request)?;
        Ok(PushResponse { status, body })
    }
}

/// Totals for one push run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub pushed: usize,
    pub failed_batches: usize,
}

/// Sequential batch pusher. One request is in flight at a time.
pub struct LokiPusher<T> {
    transport: T,
    batch_size: usize,
    max_attempts: u32,
}

impl<T: PushTransport> LokiPusher<T> {
    pub fn new(transport: T, batch_size: usize, max_attempts: u32) -> Self {
        Self {
            transport,
            batch_size,
            max_attempts,
        }
    }

    /// Push every event. Failed batches are logged and counted.
    pub async fn push_all(&self, events: &[ToolEvent]) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut policy = RetryPolicy::new(self.max_attempts);

        for request in build_batches(events, self.batch_size) {
            let count: usize = request.streams.iter().map(|s| s.values.len()).sum();
            let project = request
                .streams
                .first()
                .map(|s| s.stream.project.clone())
                .unwrap_or_default();

            policy.reset();
            match self.push_batch(&request, &mut policy).await {
                Ok(()) => {
                    outcome.pushed += count;
                    tracing::debug!(%project, events = count, "batch pushed");
                    tokio::time::sleep(PUSH_PACING).await;
                }
                Err(e) => {
                    outcome.failed_batches += 1;
                    tracing::error!(%project, events = count, error = %e, "failed to push batch");
                }
            }
        }
        outcome
    }

    async fn push_batch(
        &self,
        request: &PushRequest,
        policy: &mut RetryPolicy,
    ) -> Result<(), PushError> {
        loop {
            let response = self.transport.push(request).await?;
            match policy.evaluate(response.status) {
                RetryDecision::Proceed => return Ok(()),
                RetryDecision::Retry { attempt, delay } => {
                    tracing::debug!(
                        attempt,
                        wait_secs = delay.as_secs(),
                        body = %truncate(&response.body, 200),
                        "rate limited"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fail if response.status == 429 => {
                    return Err(PushError::RateLimited {
                        attempts: self.max_attempts,
                    });
                }
                RetryDecision::Fail => {
                    return Err(PushError::Status {
                        status: response.status,
                        body: truncate(&response.body, 300),
                    });
                }
            }
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
