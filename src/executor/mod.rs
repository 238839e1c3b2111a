//! Request executors: one endpoint call, HTTP or WebSocket.

mod http;
mod wss;

pub use http::HttpExecutor;
pub use wss::WssExecutor;

use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::context::ScenarioContext;
use crate::error::Result;
use crate::model::{EndpointDefinition, HttpMethod};

/// The per-call parts of a request: what overrides and context
/// substitution may change before the executor adds base URL, default
/// headers and auth.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParts {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, Value>,
    pub body: Option<Value>,
}

impl RequestParts {
    pub fn from_endpoint(endpoint: &EndpointDefinition) -> Self {
        Self {
            url: endpoint.url.clone(),
            headers: endpoint.headers.clone(),
            query: endpoint.query_params.clone(),
            body: endpoint.body.clone(),
        }
    }

    /// Shallow-merge step overrides; override keys win.
    pub fn with_overrides(
        mut self,
        body: Option<&Value>,
        params: &BTreeMap<String, Value>,
        headers: &BTreeMap<String, String>,
    ) -> Self {
        if let Some(over) = body {
            self.body = Some(shallow_merge(self.body.as_ref(), over));
        }
        self.query
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merge_headers(&mut self.headers, headers);
        self
    }

    /// Substitute `{var}` tokens in the URL, headers, query and body.
    pub fn resolve(self, ctx: &ScenarioContext) -> Result<Self> {
        Ok(Self {
            url: ctx.resolve_str(&self.url)?,
            headers: ctx.resolve_headers(&self.headers)?,
            query: ctx.resolve_params(&self.query)?,
            body: self.body.as_ref().map(|b| ctx.resolve_value(b)).transpose()?,
        })
    }
}

/// Overlay `over` onto `base` one level deep. Non-object values are
/// replaced outright.
pub fn shallow_merge(base: Option<&Value>, over: &Value) -> Value {
    match (base, over) {
        (Some(Value::Object(base)), Value::Object(over)) => {
            let mut merged = base.clone();
            for (k, v) in over {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => over.clone(),
    }
}

/// Layer `over` onto `headers`. Names compare case-insensitively, so a
/// later `authorization` replaces an earlier `Authorization` instead of
/// sending both.
pub fn merge_headers(headers: &mut BTreeMap<String, String>, over: &BTreeMap<String, String>) {
    for (name, value) in over {
        headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        headers.insert(name.clone(), value.clone());
    }
}

/// Join a possibly relative URL onto `base`. Absolute URLs pass through.
pub fn join_url(base: &str, url: &str) -> String {
    if url.contains("://") || base.is_empty() {
        return url.to_string();
    }
    if url.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

pub(crate) fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

/// Text form of a JSON value for headers, query strings and text frames.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
