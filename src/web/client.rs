use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::config::settings::ClientConfig;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server could not be reached at all; the write may be queued.
    #[error("server unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Rejected { status: StatusCode, body: Value },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Device-side client for the sitelog web server.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body. Any 2xx returns the decoded body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut request = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }
        let response = request.send().await.map_err(classify)?;
        decode(response).await
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        let mut request = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(classify)?;
        decode(response).await
    }

    /// Liveness check against `GET /health`.
    pub async fn is_online(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn classify(err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ClientError::Unreachable(err)
    } else {
        ClientError::Other(anyhow::Error::new(err).context("HTTP request failed"))
    }
}

async fn decode(response: reqwest::Response) -> Result<Value, ClientError> {
    let status = response.status();
    let text = response.text().await.map_err(classify)?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    if status.is_success() {
        Ok(body)
    } else {
        Err(ClientError::Rejected { status, body })
    }
}
