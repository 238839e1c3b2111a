//! Auth resolution, run once per suite before any request.

use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::executor::{join_url, to_reqwest_method};
use crate::model::AuthConfig;
use crate::validator::lookup_path;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers derived from the suite's auth config.
///
/// Owned by the runner and handed to each executor call; nothing is cached
/// globally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAuth {
    headers: BTreeMap<String, String>,
}

impl ResolvedAuth {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bearer(token: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        Self { headers }
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

/// Turn an auth config into request headers.
///
/// `login` performs its request here, carrying the suite's default headers;
/// a failed login or a response without a token at `token_json_path` is
/// fatal for the whole suite.
#[instrument(skip(config, client, default_headers), fields(base_url = %base_url))]
pub async fn resolve(
    config: Option<&AuthConfig>,
    client: &Client,
    base_url: &str,
    default_headers: &BTreeMap<String, String>,
) -> Result<ResolvedAuth> {
    match config {
        None | Some(AuthConfig::None) => Ok(ResolvedAuth::none()),
        Some(AuthConfig::Bearer { token }) => Ok(ResolvedAuth::bearer(token)),
        Some(AuthConfig::ApiKey {
            api_key_header,
            api_key_value,
        }) => {
            let mut headers = BTreeMap::new();
            headers.insert(api_key_header.clone(), api_key_value.clone());
            Ok(ResolvedAuth { headers })
        }
        Some(AuthConfig::Login {
            login_url,
            login_method,
            login_body,
            token_json_path,
        }) => {
            let url = join_url(base_url, login_url);
            let mut request = client
                .request(to_reqwest_method(*login_method), &url)
                .timeout(LOGIN_TIMEOUT);
            for (name, value) in default_headers {
                request = request.header(name, value);
            }
            if let Some(body) = login_body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::AuthResolution(format!("login request to {url} failed: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::AuthResolution(format!(
                    "login to {url} returned {status}"
                )));
            }
            let body: Value = response.json().await.map_err(|e| {
                Error::AuthResolution(format!("login response is not JSON: {e}"))
            })?;

            let token = match lookup_path(&body, token_json_path) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(Error::AuthResolution(format!(
                        "no token at '{token_json_path}' in login response"
                    )))
                }
            };
            info!("login successful, token acquired");
            Ok(ResolvedAuth::bearer(&token))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_configs_need_no_request() {
        let client = Client::new();
        let bearer = resolve(
            Some(&AuthConfig::Bearer {
                token: "t0k".into(),
            }),
            &client,
            "http://unused",
            &BTreeMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(bearer.headers()["Authorization"], "Bearer t0k");

        let key = resolve(
            Some(&AuthConfig::ApiKey {
                api_key_header: "X-Key".into(),
                api_key_value: "secret".into(),
            }),
            &client,
            "http://unused",
            &BTreeMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(key.headers()["X-Key"], "secret");

        let none = resolve(None, &client, "http://unused", &BTreeMap::new()).await.unwrap();
        assert!(none.headers().is_empty());
    }
}
