//! HTTP endpoint execution.

use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{redirect, Client, RequestBuilder};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::{join_url, merge_headers, millis, to_reqwest_method, value_to_text, RequestParts};
use crate::auth::ResolvedAuth;
use crate::definition::Endpoint;
use crate::error::{Error, Result};
use crate::model::{EndpointResult, Failure, Protocol};
use crate::retry::{AttemptClass, Classify, RetryController, Sleeper};
use crate::validator::{validate, validate_headers};

/// Outcome of one HTTP attempt, consumed right after retry and validation.
#[derive(Debug)]
enum HttpAttempt {
    Response {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
        elapsed: Duration,
    },
    Timeout {
        elapsed: Duration,
    },
    Transport {
        message: String,
    },
    /// The request could not be built (bad header name, bad URL).
    Invalid {
        message: String,
    },
}

impl Classify for HttpAttempt {
    fn classify(&self) -> AttemptClass {
        match self {
            HttpAttempt::Response { status, .. } => AttemptClass::Status(*status),
            HttpAttempt::Timeout { .. } => AttemptClass::Timeout,
            HttpAttempt::Transport { .. } => AttemptClass::Transport,
            HttpAttempt::Invalid { .. } => AttemptClass::Terminal,
        }
    }
}

struct UploadFile {
    field: String,
    file_name: String,
    bytes: Vec<u8>,
}

/// Executes HTTP endpoints against one base URL with one resolved auth.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    no_redirect_client: Client,
    base_url: String,
    default_headers: BTreeMap<String, String>,
    auth: ResolvedAuth,
}

impl HttpExecutor {
    /// Use `client` for redirect-following requests; a second client that
    /// never follows redirects is built alongside it.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        default_headers: BTreeMap<String, String>,
        auth: ResolvedAuth,
    ) -> Result<Self> {
        let no_redirect_client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            no_redirect_client,
            base_url: base_url.into(),
            default_headers,
            auth,
        })
    }

    /// Execute `endpoint` with `parts` (already merged and resolved),
    /// retrying per the endpoint's policy, then validate the final response.
    ///
    /// Errors only for problems found before sending, such as an unreadable
    /// upload file.
    #[instrument(skip_all, fields(endpoint = %endpoint.name()))]
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        parts: RequestParts,
        sleeper: &dyn Sleeper,
    ) -> Result<EndpointResult> {
        let def = &endpoint.def;
        let url = join_url(&self.base_url, &parts.url);
        let uploads = read_uploads(&def.upload_files).await?;

        // default headers < auth < endpoint/override headers
        let mut headers = self.default_headers.clone();
        merge_headers(&mut headers, self.auth.headers());
        merge_headers(&mut headers, &parts.headers);

        let client = if def.allow_redirects {
            &self.client
        } else {
            &self.no_redirect_client
        };
        let query: Vec<(String, String)> = parts
            .query
            .iter()
            .map(|(k, v)| (k.clone(), value_to_text(v)))
            .collect();

        let build = || {
            let mut req = client
                .request(to_reqwest_method(def.method), &url)
                .timeout(def.timeout());
            for (name, value) in &headers {
                if def.is_multipart() && name.eq_ignore_ascii_case("content-type") {
                    continue;
                }
                req = req.header(name, value);
            }
            if !query.is_empty() {
                req = req.query(&query);
            }
            attach_body(
                req,
                def.method.sends_body(),
                &def.content_type,
                parts.body.as_ref(),
                def.is_multipart(),
                &uploads,
            )
        };

        debug!("{} {}", def.method, url);
        let retried = RetryController::new(&endpoint.retry, sleeper)
            .run(def.name.as_str(), || send(build()))
            .await;

        let mut result = EndpointResult {
            name: def.name.clone(),
            protocol: Protocol::Http,
            tags: def.tags.clone(),
            passed: false,
            status: None,
            elapsed_ms: 0,
            attempts: retried.attempts,
            failures: Vec::new(),
            response: None,
            messages: Vec::new(),
        };

        match retried.outcome {
            HttpAttempt::Response {
                status,
                headers,
                body,
                elapsed,
            } => {
                result.status = Some(status);
                result.elapsed_ms = millis(elapsed);

                if status != def.expected_status {
                    result.failures.push(Failure::Status {
                        expected: def.expected_status,
                        actual: status,
                    });
                }

                let parsed = serde_json::from_str::<Value>(&body)
                    .unwrap_or(Value::String(body));
                if let Some(expect) = &endpoint.body {
                    result
                        .failures
                        .extend(validate(expect, &parsed).into_iter().map(Failure::Body));
                }
                result.failures.extend(
                    validate_headers(&endpoint.headers, &headers)
                        .into_iter()
                        .map(Failure::Header),
                );
                if let Some(limit_ms) = def.max_response_time {
                    if result.elapsed_ms > limit_ms {
                        result.failures.push(Failure::ResponseTime {
                            limit_ms,
                            elapsed_ms: result.elapsed_ms,
                        });
                    }
                }
                result.response = Some(parsed);
            }
            HttpAttempt::Timeout { elapsed } => {
                result.elapsed_ms = millis(elapsed);
                result.failures.push(Failure::Timeout {
                    after_ms: millis(def.timeout()),
                });
            }
            HttpAttempt::Transport { message } => {
                result.failures.push(Failure::Transport { message });
            }
            HttpAttempt::Invalid { message } => {
                result.failures.push(Failure::Configuration { message });
            }
        }

        result.passed = result.failures.is_empty();
        if !result.passed {
            warn!(
                endpoint = %def.name,
                url = %url,
                status = ?result.status,
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

fn attach_body(
    req: RequestBuilder,
    sends_body: bool,
    content_type: &str,
    body: Option<&Value>,
    multipart: bool,
    uploads: &[UploadFile],
) -> RequestBuilder {
    if multipart {
        let mut form = Form::new();
        if let Some(Value::Object(fields)) = body {
            for (k, v) in fields {
                form = form.text(k.clone(), value_to_text(v));
            }
        }
        for upload in uploads {
            let part = Part::bytes(upload.bytes.clone()).file_name(upload.file_name.clone());
            form = form.part(upload.field.clone(), part);
        }
        return req.multipart(form);
    }

    let Some(body) = body.filter(|_| sends_body) else {
        return req;
    };
    if content_type.contains("json") {
        req.json(body)
    } else if content_type == "application/x-www-form-urlencoded" {
        let fields: Vec<(String, String)> = match body {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_text(v)))
                .collect(),
            _ => Vec::new(),
        };
        req.form(&fields)
    } else {
        req.header(CONTENT_TYPE, content_type)
            .body(value_to_text(body))
    }
}

async fn send(req: RequestBuilder) -> HttpAttempt {
    let start = Instant::now();
    let response = match req.send().await {
        Ok(response) => response,
        Err(e) => return classify_error(e, start.elapsed()),
    };

    let status = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    match response.text().await {
        Ok(body) => {
            let elapsed = start.elapsed();
            debug!(status, elapsed_ms = millis(elapsed), "response received");
            HttpAttempt::Response {
                status,
                headers,
                body,
                elapsed,
            }
        }
        Err(e) => classify_error(e, start.elapsed()),
    }
}

fn classify_error(e: reqwest::Error, elapsed: Duration) -> HttpAttempt {
    if e.is_timeout() {
        HttpAttempt::Timeout { elapsed }
    } else if e.is_builder() {
        HttpAttempt::Invalid {
            message: e.to_string(),
        }
    } else {
        HttpAttempt::Transport {
            message: error_chain(&e),
        }
    }
}

/// `reqwest` hides the useful cause (connection refused, DNS) in sources.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

async fn read_uploads(files: &BTreeMap<String, String>) -> Result<Vec<UploadFile>> {
    let mut uploads = Vec::with_capacity(files.len());
    for (field, path) in files {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::config(format!("cannot read upload file '{path}': {e}"))
        })?;
        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(field)
            .to_string();
        uploads.push(UploadFile {
            field: field.clone(),
            file_name,
            bytes,
        });
    }
    Ok(uploads)
}
