//! Definition and result types.
//!
//! Definition types deserialize straight from the YAML/JSON definition
//! files and are immutable once loaded. Result types serialize into report
//! entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::validator::Mismatch;

/// One definition file: shared settings plus the endpoints and scenarios
/// declared in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionFile {
    pub name: String,
    pub base_url: String,
    /// Headers sent with every request; endpoint headers win on collision.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Global retry policy, used by endpoints without their own.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default, alias = "http_endpoints")]
    pub endpoints: Vec<EndpointDefinition>,
    /// Listed separately for readability; always treated as `wss`.
    #[serde(default)]
    pub wss_endpoints: Vec<EndpointDefinition>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    /// Record file (relative to the data directory) fed into endpoint bodies.
    #[serde(default)]
    pub test_data_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Wss,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Wss => f.write_str("wss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    /// Methods whose requests carry the endpoint body.
    pub fn sends_body(self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        )
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        f.write_str(name)
    }
}

/// A single named HTTP or WebSocket operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Form field name to file path, sent as multipart.
    #[serde(default)]
    pub upload_files: BTreeMap<String, String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub expected_body: Option<Value>,
    #[serde(default)]
    pub expected_headers: BTreeMap<String, String>,
    /// Upper bound on response time in milliseconds.
    #[serde(default)]
    pub max_response_time: Option<u64>,
    /// Request (HTTP) or connect/receive (WSS) timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default = "default_true")]
    pub allow_redirects: bool,
    #[serde(default)]
    pub messages: Vec<WssMessage>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EndpointDefinition {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }

    /// The first tag, used to select the endpoint from the command line.
    pub fn selector(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }

    pub fn is_multipart(&self) -> bool {
        !self.upload_files.is_empty()
            || self.content_type.starts_with("multipart/")
    }
}

/// Bounded retry with a backoff schedule.
///
/// `backoff[i]` is the wait (seconds) after attempt `i`; the last entry is
/// reused once the schedule runs out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_backoff")]
    pub backoff: Vec<f64>,
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
}

impl RetryPolicy {
    /// Wait before retry number `attempt_index + 1`.
    pub fn delay(&self, attempt_index: usize) -> Duration {
        match self.backoff.get(attempt_index).or(self.backoff.last()) {
            Some(wait) => secs(*wait),
            None => Duration::ZERO,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: default_backoff(),
            retry_on_status: default_retry_on_status(),
            retry_on_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        api_key_header: String,
        api_key_value: String,
    },
    /// Log in once and use the returned token as a bearer token.
    Login {
        #[serde(default = "default_login_url")]
        login_url: String,
        #[serde(default = "default_login_method")]
        login_method: HttpMethod,
        #[serde(default)]
        login_body: Option<Value>,
        #[serde(default = "default_token_path")]
        token_json_path: String,
    },
}

/// One action in a WebSocket message sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WssMessage {
    Send {
        #[serde(default)]
        data: Value,
    },
    SendJson {
        #[serde(default)]
        data: Value,
    },
    /// A string is sent as UTF-8; an array of integers as raw bytes.
    SendBinary {
        #[serde(default)]
        data: Value,
    },
    Receive {
        #[serde(default)]
        expected: Option<Value>,
        #[serde(default)]
        timeout: Option<f64>,
    },
    ReceiveJson {
        #[serde(default, alias = "expected_json")]
        expected: Option<Value>,
        #[serde(default)]
        timeout: Option<f64>,
    },
    Ping {
        #[serde(default)]
        data: Value,
    },
    Pong {
        #[serde(default)]
        data: Value,
    },
    Wait {
        #[serde(default = "default_wait", alias = "timeout")]
        duration: f64,
    },
}

impl WssMessage {
    pub fn action(&self) -> &'static str {
        match self {
            WssMessage::Send { .. } => "send",
            WssMessage::SendJson { .. } => "send_json",
            WssMessage::SendBinary { .. } => "send_binary",
            WssMessage::Receive { .. } => "receive",
            WssMessage::ReceiveJson { .. } => "receive_json",
            WssMessage::Ping { .. } => "ping",
            WssMessage::Pong { .. } => "pong",
            WssMessage::Wait { .. } => "wait",
        }
    }

    /// Only data-carrying actions may trigger a retry of the sequence.
    pub fn is_retry_eligible(&self) -> bool {
        !matches!(
            self,
            WssMessage::Ping { .. } | WssMessage::Pong { .. } | WssMessage::Wait { .. }
        )
    }
}

/// An ordered chain of endpoint calls sharing one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub setup: Vec<ScenarioStep>,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
    #[serde(default)]
    pub teardown: Vec<ScenarioStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    pub name: String,
    pub endpoint_ref: String,
    /// Context variable name to dot path into the response body.
    #[serde(default)]
    pub save: BTreeMap<String, String>,
    #[serde(default)]
    pub override_body: Option<Value>,
    #[serde(default)]
    pub override_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub override_headers: BTreeMap<String, String>,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_timeout() -> f64 {
    30.0
}

fn default_true() -> bool {
    true
}

fn default_backoff() -> Vec<f64> {
    vec![1.0, 2.0, 4.0]
}

fn default_retry_on_status() -> Vec<u16> {
    vec![500, 502, 503, 504]
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_login_url() -> String {
    "/auth/login".to_string()
}

fn default_login_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_token_path() -> String {
    "token".to_string()
}

fn default_wait() -> f64 {
    1.0
}

/// Seconds from a definition file; negative and NaN clamp to zero.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

// ── Results ─────────────────────────────────────────────

/// Why a test failed. Every variant carries enough detail to diagnose the
/// failure from the report alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    Status { expected: u16, actual: u16 },
    Body(Mismatch),
    Header(Mismatch),
    ResponseTime { limit_ms: u64, elapsed_ms: u64 },
    Timeout { after_ms: u64 },
    Transport { message: String },
    /// A WebSocket action failed.
    Message {
        index: usize,
        action: String,
        detail: String,
    },
    /// A `save` path was not present in the response.
    Extraction { variable: String, path: String },
    Configuration { message: String },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Status { expected, actual } => {
                write!(f, "status: expected {expected}, got {actual}")
            }
            Failure::Body(m) => write!(f, "body {m}"),
            Failure::Header(m) => write!(f, "header {m}"),
            Failure::ResponseTime {
                limit_ms,
                elapsed_ms,
            } => write!(
                f,
                "response time: {elapsed_ms}ms exceeds limit {limit_ms}ms"
            ),
            Failure::Timeout { after_ms } => {
                write!(f, "timed out after {after_ms}ms")
            }
            Failure::Transport { message } => write!(f, "transport error: {message}"),
            Failure::Message {
                index,
                action,
                detail,
            } => write!(f, "message #{index} ({action}): {detail}"),
            Failure::Extraction { variable, path } => write!(
                f,
                "save '{variable}': path '{path}' not found in response"
            ),
            Failure::Configuration { message } => {
                write!(f, "configuration: {message}")
            }
        }
    }
}

/// One logged WebSocket action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<Value>,
    pub passed: bool,
}

/// Outcome of executing one endpoint (including any retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointResult {
    pub name: String,
    pub protocol: Protocol,
    pub tags: Vec<String>,
    pub passed: bool,
    /// Final HTTP status; absent for WSS and for transport failures.
    pub status: Option<u16>,
    pub elapsed_ms: u64,
    pub attempts: usize,
    pub failures: Vec<Failure>,
    /// Parsed JSON body, or the raw text as a string value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageRecord>,
}

impl EndpointResult {
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }

    pub fn timed_out(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, Failure::Timeout { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Setup,
    Step,
    Teardown,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Setup => f.write_str("setup"),
            StepPhase::Step => f.write_str("step"),
            StepPhase::Teardown => f.write_str("teardown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub phase: StepPhase,
    pub name: String,
    pub endpoint: String,
    pub passed: bool,
    /// Absent when the step failed before a request was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_result: Option<EndpointResult>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub tags: Vec<String>,
    pub passed: bool,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
}

/// Everything one definition file produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub timestamp: String,
    pub endpoints: Vec<EndpointResult>,
    pub scenarios: Vec<ScenarioResult>,
    pub duration_ms: u64,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.endpoints.iter().all(|e| e.passed)
            && self.scenarios.iter().all(|s| s.passed)
    }
}
