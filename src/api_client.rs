//! `reqwest`-backed dispatcher for fully injected calls.

use crate::model::{DispatchedResponse, HttpMethod, HttpTestData, UserIdentity};
use crate::runner::HttpDispatcher;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use reqwest::{Client, Method as ReqMethod};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, instrument};

/// Bytes escaped in a substituted path variable, so a value always
/// stays a single path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Sends calls with a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestDispatcher {
    client: Client,
    base_url: Option<String>,
    timeout: Duration,
}

impl ReqwestDispatcher {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Self {
        Self::with_client(Client::new(), base_url, timeout)
    }

    pub fn with_client(client: Client, base_url: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    fn resolve_url(&self, uri: &str) -> Result<String> {
        if uri.contains("://") {
            return Ok(uri.to_string());
        }
        let Some(base_url) = &self.base_url else {
            return Ok(uri.to_string());
        };
        // Without a trailing slash `join` would drop the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.clone()
        } else {
            format!("{base_url}/")
        };
        let base = url::Url::parse(&normalized)
            .context(format!("Invalid base URL: {base_url}"))?;
        if uri.is_empty() {
            return Ok(base.to_string());
        }
        let joined = base
            .join(uri.trim_start_matches('/'))
            .context(format!("Failed to join base URL '{base_url}' with '{uri}'"))?;
        Ok(joined.to_string())
    }
}

fn convert_method(method: HttpMethod) -> ReqMethod {
    match method {
        HttpMethod::Get => ReqMethod::GET,
        HttpMethod::Post => ReqMethod::POST,
        HttpMethod::Put => ReqMethod::PUT,
        HttpMethod::Delete => ReqMethod::DELETE,
        HttpMethod::Patch => ReqMethod::PATCH,
        HttpMethod::Head => ReqMethod::HEAD,
        HttpMethod::Options => ReqMethod::OPTIONS,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fill `{name}` segments of `uri` from `path_variables`, each value
/// percent-encoded as one path segment.
pub fn expand_path_variables(uri: &str, path_variables: &Map<String, Value>) -> Result<String> {
    static PATH_VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\{([^{}/]+)\}").expect("failed to compile path variable regex")
    });

    let mut missing = None;
    let expanded = PATH_VARIABLE_RE.replace_all(uri, |caps: &regex::Captures| {
        let name = &caps[1];
        match path_variables.get(name) {
            Some(value) => utf8_percent_encode(&as_text(value), PATH_SEGMENT).to_string(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                caps[0].to_string()
            }
        }
    });
    match missing {
        Some(name) => Err(anyhow!("path variable '{name}' used in '{uri}' is not set")),
        None => Ok(expanded.into_owned()),
    }
}

#[async_trait]
impl HttpDispatcher for ReqwestDispatcher {
    #[instrument(skip(self, test_data, user), fields(guid = %test_data.guid, method = ?test_data.method))]
    async fn dispatch(
        &self,
        test_data: &HttpTestData,
        user: Option<&UserIdentity>,
    ) -> Result<DispatchedResponse> {
        let request = &test_data.request;
        let uri = expand_path_variables(&test_data.uri, &request.path_variables)?;
        let url = self.resolve_url(&uri)?;

        let mut builder = self
            .client
            .request(convert_method(test_data.method), &url)
            .timeout(self.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), as_text(value));
        }
        let has_authorization = request
            .headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("authorization"));
        if let Some(token) = user.and_then(|u| u.access_token.as_deref()) {
            if !has_authorization {
                builder = builder.bearer_auth(token);
            }
        }

        if !request.query.is_empty() {
            let query: Vec<(&str, String)> = request
                .query
                .iter()
                .map(|(name, value)| (name.as_str(), as_text(value)))
                .collect();
            builder = builder.query(&query);
        }

        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }

        debug!("Sending request to {}", url);
        let response = builder.send().await.context("Failed to send request")?;
        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(value.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let text = response
            .text()
            .await
            .context("Failed to read response body")?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(DispatchedResponse {
            status,
            headers,
            body,
        })
    }
}
