/// Alert delivery: one JSON POST per alert, no retries.
use crate::alert::AlertPayload;
use crate::config::{ApiConfig, ConfigError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

/// Why an alert could not be delivered.
#[derive(Debug)]
pub enum AlertError {
    /// The endpoint answered with a 4xx/5xx status.
    Http { status: u16, body: String },
    /// The request never completed (DNS, refused connection, timeout, ...).
    Transport { source: reqwest::Error },
}

impl std::fmt::Display for AlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertError::Http { status, body } if body.is_empty() => {
                write!(f, "alert endpoint returned HTTP {status}")
            }
            AlertError::Http { status, body } => {
                write!(f, "alert endpoint returned HTTP {status}: {body}")
            }
            AlertError::Transport { source } => {
                write!(f, "failed to reach alert endpoint: {source}")
            }
        }
    }
}

impl std::error::Error for AlertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AlertError::Http { .. } => None,
            AlertError::Transport { source } => Some(source),
        }
    }
}

/// Posts alert payloads to the configured endpoint.
///
/// Cloning is cheap and clones share one connection pool, so a single
/// dispatcher can serve every watcher concurrently.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl Dispatcher {
    pub fn new(api: &ApiConfig) -> Result<Self, ConfigError> {
        let headers = build_headers(api)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "api".to_string(),
                reason: format!("http client error: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: api.endpoint.trim().to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one alert. Returns the response body on a 2xx status.
    pub async fn dispatch(&self, payload: &AlertPayload) -> Result<String, AlertError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            kind = payload.kind.as_str(),
            "sending alert"
        );
        let resp = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| AlertError::Transport { source: e })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AlertError::Transport { source: e })?;

        if !status.is_success() {
            return Err(AlertError::Http {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(
            status = status.as_u16(),
            kind = payload.kind.as_str(),
            "alert delivered"
        );
        Ok(body)
    }
}

/// Configured extra headers first, then the fixed JSON headers and the
/// bearer token, so the fixed ones always win.
fn build_headers(api: &ApiConfig) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &api.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            ConfigError::Invalid {
                field: format!("api.headers.{name}"),
                reason: e.to_string(),
            }
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| ConfigError::Invalid {
            field: format!("api.headers.{name}"),
            reason: e.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    if let Some(key) = api.key.as_deref().filter(|k| !k.is_empty()) {
        let mut value =
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| ConfigError::Invalid {
                field: "api.key".to_string(),
                reason: e.to_string(),
            })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}
