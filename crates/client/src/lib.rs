//! Typed client for the TokenVault broker HTTP protocol.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BROKER_URL: &str = "http://127.0.0.1:9999";
pub const URL_ENV: &str = "TOKENVAULT_URL";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid broker url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to broker failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The broker answered with a non-success status.
    #[error("broker returned {status}: {message}")]
    Broker { status: u16, message: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Deserialize)]
pub struct PingResponse {
    pub message: String,
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreReceipt {
    pub status: String,
    pub project: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub name: String,
    pub port: u16,
    pub api_base_url: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub port: u16,
    #[serde(default)]
    pub state: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct StoreTokenBody<'a> {
    project: &'a str,
    token: &'a str,
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct BrokerClient {
    base_url: Url,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let invalid = |reason: String| ClientError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };

        let parsed = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
        if parsed.cannot_be_a_base() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("expected an http(s) base url".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: parsed,
            http,
        })
    }

    /// `$TOKENVAULT_URL` if set, otherwise the default loopback address.
    pub fn from_env() -> ClientResult<Self> {
        let url = std::env::var(URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
        Self::new(&url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn ping(&self) -> ClientResult<PingResponse> {
        let response = self.http.get(self.endpoint(&["ping"])?).send().await?;
        decode(response).await
    }

    pub async fn push_token(&self, project: &str, token: &str) -> ClientResult<StoreReceipt> {
        let response = self
            .http
            .post(self.endpoint(&["store"])?)
            .json(&StoreTokenBody { project, token })
            .send()
            .await?;
        decode(response).await
    }

    /// Latest token of `project`, or `None` when the broker has none.
    pub async fn fetch_token(&self, project: &str) -> ClientResult<Option<String>> {
        let response = self
            .http
            .get(self.endpoint(&["fetch", project])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: TokenBody = decode(response).await?;
        Ok(Some(body.token))
    }

    pub async fn list_projects(&self) -> ClientResult<Vec<ProjectSummary>> {
        let response = self.http.get(self.endpoint(&["projects"])?).send().await?;
        decode(response).await
    }

    pub async fn status(&self) -> ClientResult<StatusReport> {
        let response = self.http.get(self.endpoint(&["status"])?).send().await?;
        decode(response).await
    }

    fn endpoint(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    Err(ClientError::Broker {
        status: status.as_u16(),
        message: error_message(status, &text),
    })
}

fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected response")
            .to_string()
    } else {
        trimmed.to_string()
    }
}
