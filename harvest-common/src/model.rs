//! Core data model shared across the crawl execution substrate.
//!
//! These types describe the request/task/result lifecycle but carry no
//! component logic themselves - normalization, leasing and validation
//! live in `harvest-core`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported HTTP methods for a scrape request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseHttpMethodError(pub String);

impl fmt::Display for ParseHttpMethodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} is not a valid HttpMethod", self.0)
    }
}
impl std::error::Error for ParseHttpMethodError {}

impl FromStr for HttpMethod {
    type Err = ParseHttpMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::GET),
            "POST" => Ok(HttpMethod::POST),
            "PUT" => Ok(HttpMethod::PUT),
            "DELETE" => Ok(HttpMethod::DELETE),
            "PATCH" => Ok(HttpMethod::PATCH),
            "HEAD" => Ok(HttpMethod::HEAD),
            other => Err(ParseHttpMethodError(other.to_owned())),
        }
    }
}

/// A scrape intent submitted to the Coordinator. Immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub url: String,
    pub method: HttpMethod,
    /// Ordered, duplicates-allowed header list, matching wire semantics.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Higher priority is dispatched earlier.
    pub priority: i32,
    /// Normalized lowercase host, derived at construction time.
    pub domain: String,
    pub max_retries: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

/// Parameters required to build a `Request`; `domain` and `id` are derived.
pub struct NewRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub priority: i32,
    pub max_retries: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl Default for NewRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: HttpMethod::GET,
            headers: Vec::new(),
            body: None,
            priority: 0,
            max_retries: 3,
            deadline: None,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidRequestError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("could not parse url: {0}")]
    BadUrl(String),
    #[error("url has no host")]
    MissingHost,
}

impl Request {
    /// Build a `Request`, deriving `id` and `domain`. This is the only
    /// place a `Request` is constructed, enforcing the "immutable after
    /// submission" invariant.
    pub fn new(params: NewRequest) -> Result<Self, InvalidRequestError> {
        if params.url.trim().is_empty() {
            return Err(InvalidRequestError::EmptyUrl);
        }
        let parsed = url::Url::parse(&params.url)
            .map_err(|e| InvalidRequestError::BadUrl(e.to_string()))?;
        let domain = parsed
            .host_str()
            .ok_or(InvalidRequestError::MissingHost)?
            .to_ascii_lowercase();

        Ok(Self {
            id: Uuid::now_v7(),
            url: params.url,
            method: params.method,
            headers: params.headers,
            body: params.body,
            priority: params.priority,
            domain,
            max_retries: params.max_retries,
            deadline: params.deadline,
            metadata: params.metadata,
        })
    }
}

/// Lifecycle state of a `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Leased,
    Acked,
    Nacked,
    Expired,
    Dead,
}

/// Exclusive, time-bounded assignment of a `Task` to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// The internal envelope for a pending or in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub request: Request,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub next_visible_at: DateTime<Utc>,
    pub state: TaskState,
}

impl Task {
    pub fn new(request: Request, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id,
            request,
            attempt: 0,
            enqueued_at: now,
            lease: None,
            next_visible_at: now,
            state: TaskState::Pending,
        }
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.next_visible_at <= now
    }
}

/// Outcome classification of an executed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    HttpError,
    NetworkError,
    Blocked,
    Timeout,
    CaptchaRequired,
    ValidationFailed,
}

/// The outcome of one fetch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub request_id: Uuid,
    pub attempt: u32,
    pub status: ResultStatus,
    pub http_status: Option<u16>,
    pub body: Vec<u8>,
    pub elapsed_ms: u64,
    pub proxy_used: Option<String>,
    pub error_message: Option<String>,
    /// Set by the Validator before a sink ever sees the record. A suspicious
    /// record is still written and acked, not dropped — this is the only
    /// place that distinction survives past the dispatcher.
    pub suspicious: bool,
}

/// Liveness / busy-ness of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
}

/// What the Coordinator knows about a worker that has registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: WorkerStatus,
    pub current_task_id: Option<Uuid>,
    pub capacity: usize,
    pub leased_count: usize,
}

/// Rolling per-domain performance counters for one proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDomainStats {
    pub success_count: f64,
    pub fail_count: f64,
    pub total_rtt_ms: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub banned_until: Option<DateTime<Utc>>,
}

impl Default for ProxyDomainStats {
    fn default() -> Self {
        Self {
            success_count: 0.0,
            fail_count: 0.0,
            total_rtt_ms: 0.0,
            last_used_at: None,
            banned_until: None,
        }
    }
}

/// Overall job lifecycle status tracked by the Checkpointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Paused,
    Completed,
    Failed,
}
