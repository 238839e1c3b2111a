//! WebSocket endpoint execution: one connection per attempt, actions
//! replayed in order.

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};

use super::{join_url, merge_headers, millis, value_to_text, RequestParts};
use crate::auth::ResolvedAuth;
use crate::definition::Endpoint;
use crate::error::Result;
use crate::model::{secs, EndpointResult, Failure, MessageRecord, Protocol, WssMessage};
use crate::retry::{AttemptClass, Classify, RetryController, Sleeper};
use crate::validator::{validate, Expectation};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One pass over the connection and its actions.
#[derive(Debug)]
struct WssAttempt {
    records: Vec<MessageRecord>,
    failure: Option<Failure>,
    class: AttemptClass,
    last_json: Option<Value>,
    elapsed: Duration,
}

impl WssAttempt {
    fn failed(failure: Failure, class: AttemptClass, elapsed: Duration) -> Self {
        Self {
            records: Vec::new(),
            failure: Some(failure),
            class,
            last_json: None,
            elapsed,
        }
    }
}

impl Classify for WssAttempt {
    fn classify(&self) -> AttemptClass {
        self.class
    }
}

#[derive(Debug)]
struct ActionError {
    detail: String,
    class: AttemptClass,
}

impl ActionError {
    fn transport(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            class: AttemptClass::Transport,
        }
    }

    fn terminal(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            class: AttemptClass::Terminal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WssExecutor {
    base_url: String,
    default_headers: BTreeMap<String, String>,
    auth: ResolvedAuth,
}

impl WssExecutor {
    pub fn new(
        base_url: impl Into<String>,
        default_headers: BTreeMap<String, String>,
        auth: ResolvedAuth,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers,
            auth,
        }
    }

    /// Connect, replay the endpoint's actions and close. A failing action
    /// aborts the rest; a retry starts over with a new connection.
    #[instrument(skip_all, fields(endpoint = %endpoint.name()))]
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        parts: RequestParts,
        sleeper: &dyn Sleeper,
    ) -> Result<EndpointResult> {
        let def = &endpoint.def;
        let url = websocket_url(&join_url(&self.base_url, &parts.url), &parts.query);

        let mut headers = self.default_headers.clone();
        merge_headers(&mut headers, self.auth.headers());
        merge_headers(&mut headers, &parts.headers);

        let url_ref = url.as_str();
        let headers_ref = &headers;
        let retried = RetryController::new(&endpoint.retry, sleeper)
            .run(def.name.as_str(), move || {
                run_once(endpoint, url_ref, headers_ref, sleeper)
            })
            .await;
        let attempt = retried.outcome;

        let mut result = EndpointResult {
            name: def.name.clone(),
            protocol: Protocol::Wss,
            tags: def.tags.clone(),
            passed: attempt.failure.is_none(),
            status: None,
            elapsed_ms: millis(attempt.elapsed),
            attempts: retried.attempts,
            failures: attempt.failure.into_iter().collect(),
            response: attempt.last_json,
            messages: attempt.records,
        };
        if let Some(limit_ms) = def.max_response_time {
            if result.elapsed_ms > limit_ms {
                result.failures.push(Failure::ResponseTime {
                    limit_ms,
                    elapsed_ms: result.elapsed_ms,
                });
                result.passed = false;
            }
        }

        if !result.passed {
            warn!(
                endpoint = %def.name,
                url = %url,
                attempts = result.attempts,
                "FAILED: {}",
                result
                    .failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }
        Ok(result)
    }
}

async fn run_once(
    endpoint: &Endpoint,
    url: &str,
    headers: &BTreeMap<String, String>,
    sleeper: &dyn Sleeper,
) -> WssAttempt {
    let def = &endpoint.def;
    let start = Instant::now();

    let mut request = match url.into_client_request() {
        Ok(request) => request,
        Err(e) => {
            return WssAttempt::failed(
                Failure::Configuration {
                    message: format!("invalid WebSocket URL '{url}': {e}"),
                },
                AttemptClass::Terminal,
                start.elapsed(),
            )
        }
    };
    for (name, value) in headers {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        let Some((name, value)) = parsed else {
            return WssAttempt::failed(
                Failure::Configuration {
                    message: format!("invalid header '{name}'"),
                },
                AttemptClass::Terminal,
                start.elapsed(),
            );
        };
        request.headers_mut().insert(name, value);
    }

    let mut ws = match tokio::time::timeout(def.timeout(), connect_async(request)).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            return WssAttempt::failed(
                Failure::Transport {
                    message: format!("connection failed: {e}"),
                },
                AttemptClass::Transport,
                start.elapsed(),
            )
        }
        Err(_) => {
            return WssAttempt::failed(
                Failure::Timeout {
                    after_ms: millis(def.timeout()),
                },
                AttemptClass::Timeout,
                start.elapsed(),
            )
        }
    };
    debug!(url, "connected");

    let mut attempt = WssAttempt {
        records: Vec::with_capacity(def.messages.len()),
        failure: None,
        class: AttemptClass::Terminal,
        last_json: None,
        elapsed: Duration::ZERO,
    };
    for (index, action) in def.messages.iter().enumerate() {
        let expect = endpoint.receive.get(index).and_then(Option::as_ref);
        let mut record = MessageRecord {
            action: action.action().to_string(),
            sent: None,
            received: None,
            passed: true,
        };
        let outcome = perform(&mut ws, action, expect, def.timeout(), sleeper, &mut record).await;
        debug!(index, action = action.action(), passed = outcome.is_ok(), "action done");
        match outcome {
            Ok(json) => {
                if json.is_some() {
                    attempt.last_json = json;
                }
                attempt.records.push(record);
            }
            Err(err) => {
                record.passed = false;
                attempt.records.push(record);
                attempt.failure = Some(Failure::Message {
                    index,
                    action: action.action().to_string(),
                    detail: err.detail,
                });
                attempt.class = if action.is_retry_eligible() {
                    err.class
                } else {
                    AttemptClass::Terminal
                };
                break;
            }
        }
    }

    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "close failed");
    }
    attempt.elapsed = start.elapsed();
    attempt
}

/// Perform one action. Returns the parsed payload for `receive_json`.
async fn perform(
    ws: &mut WsStream,
    action: &WssMessage,
    expect: Option<&Expectation>,
    default_timeout: Duration,
    sleeper: &dyn Sleeper,
    record: &mut MessageRecord,
) -> std::result::Result<Option<Value>, ActionError> {
    match action {
        WssMessage::Send { data } => {
            record.sent = Some(data.clone());
            send(ws, Message::Text(value_to_text(data))).await?;
        }
        WssMessage::SendJson { data } => {
            record.sent = Some(data.clone());
            send(ws, Message::Text(data.to_string())).await?;
        }
        WssMessage::SendBinary { data } => {
            let bytes = binary_payload(data)?;
            record.sent = Some(Value::String(format!("<{} bytes>", bytes.len())));
            send(ws, Message::Binary(bytes)).await?;
        }
        WssMessage::Ping { data } => {
            record.sent = Some(data.clone());
            send(ws, Message::Ping(value_to_text(data).into_bytes())).await?;
        }
        WssMessage::Pong { data } => {
            record.sent = Some(data.clone());
            send(ws, Message::Pong(value_to_text(data).into_bytes())).await?;
        }
        WssMessage::Wait { duration } => {
            sleeper.sleep(secs(*duration)).await;
        }
        WssMessage::Receive { expected, timeout } => {
            let wait = timeout.map(secs).unwrap_or(default_timeout);
            let text = receive(ws, wait).await?;
            record.received = Some(Value::String(text.clone()));
            if let Some(expected) = expected {
                let expected = value_to_text(expected);
                if text != expected {
                    return Err(ActionError::terminal(format!(
                        "expected '{expected}', got '{text}'"
                    )));
                }
            }
        }
        WssMessage::ReceiveJson { timeout, .. } => {
            let wait = timeout.map(secs).unwrap_or(default_timeout);
            let text = receive(ws, wait).await?;
            let json: Value = match serde_json::from_str(&text) {
                Ok(json) => json,
                Err(e) => {
                    record.received = Some(Value::String(text));
                    return Err(ActionError::terminal(format!("invalid JSON frame: {e}")));
                }
            };
            record.received = Some(json.clone());
            if let Some(expect) = expect {
                let mismatches = validate(expect, &json);
                if !mismatches.is_empty() {
                    return Err(ActionError::terminal(
                        mismatches
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; "),
                    ));
                }
            }
            return Ok(Some(json));
        }
    }
    Ok(None)
}

async fn send(ws: &mut WsStream, message: Message) -> std::result::Result<(), ActionError> {
    ws.send(message)
        .await
        .map_err(|e| ActionError::transport(format!("send failed: {e}")))
}

/// Wait for the next text or binary frame, skipping control frames.
async fn receive(ws: &mut WsStream, wait: Duration) -> std::result::Result<String, ActionError> {
    let deadline = deadline_after(wait);
    loop {
        let next = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, ws.next()).await,
            None => Ok(ws.next().await),
        };
        let frame = match next {
            Ok(frame) => frame,
            Err(_) => {
                return Err(ActionError {
                    detail: format!("no message within {}ms", millis(wait)),
                    class: AttemptClass::Timeout,
                })
            }
        };
        match frame {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Binary(bytes))) => {
                return Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ActionError::transport("connection closed by peer"))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ActionError::transport(format!("receive failed: {e}"))),
        }
    }
}

/// `None` when `wait` reaches past what the clock can represent; such a
/// receive waits without a deadline.
fn deadline_after(wait: Duration) -> Option<tokio::time::Instant> {
    tokio::time::Instant::now().checked_add(wait)
}

/// A string is sent as UTF-8; an array of integers as raw bytes.
fn binary_payload(data: &Value) -> std::result::Result<Vec<u8>, ActionError> {
    match data {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| ActionError::terminal(format!("{v} is not a byte")))
            })
            .collect(),
        other => Err(ActionError::terminal(format!(
            "send_binary needs a string or byte array, got {other}"
        ))),
    }
}

/// Rewrite an http(s) URL to ws(s) and append query parameters.
fn websocket_url(url: &str, query: &BTreeMap<String, Value>) -> String {
    let url = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    };
    if query.is_empty() {
        return url;
    }
    match Url::parse(&url) {
        Ok(mut parsed) => {
            parsed
                .query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (k, value_to_text(v))));
            parsed.to_string()
        }
        Err(_) => url,
    }
}
