#![forbid(unsafe_code)]

//! Adapter over the remote video API.
//!
//! Only two operations exist, `search` and `list`. Dispatch by name goes
//! through [`ApiMethod`], so an unknown name fails before the rate limiter or
//! the network are touched.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::query::Attributes;
use crate::ratelimit::RateLimiter;

/// Upstream or transport failure, carrying a message fit for end users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
}

impl ClientError {
    pub fn unknown_method(name: &str) -> Self {
        Self {
            message: format!("search client has no method {name}"),
        }
    }

    pub fn upstream(detail: impl fmt::Display) -> Self {
        Self {
            message: format!("Error calling youtube api: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    Search,
    List,
}

impl ApiMethod {
    /// Remote resource the method is served from.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::List => "videos",
        }
    }
}

impl FromStr for ApiMethod {
    type Err = ClientError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "search" => Ok(Self::Search),
            "list" => Ok(Self::List),
            other => Err(ClientError::unknown_method(other)),
        }
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Search => "search",
            Self::List => "list",
        })
    }
}

/// One raw round trip to the remote API.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    async fn execute(
        &self,
        method: ApiMethod,
        part: &str,
        params: &Attributes,
    ) -> Result<Value, ClientError>;
}

/// Blocking `ureq` agent driven from the blocking thread pool.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
        }
    }

    fn call_blocking(
        &self,
        method: ApiMethod,
        part: &str,
        params: &Attributes,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/{}", self.base_url, method.endpoint());
        let mut request = self
            .agent
            .get(&url)
            .query("part", part)
            .query("key", &self.api_key);
        for (key, value) in params {
            let rendered = match value {
                Value::String(text) => text.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            request = request.query(key, &rendered);
        }

        match request.call() {
            Ok(response) => response
                .into_json::<Value>()
                .map_err(|err| ClientError::upstream(format!("invalid response body: {err}"))),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_json::<Value>().ok();
                let detail = body
                    .as_ref()
                    .and_then(|body| body.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("HTTP status {code}"));
                Err(ClientError::upstream(detail))
            }
            Err(ureq::Error::Transport(transport)) => Err(ClientError::upstream(transport)),
        }
    }
}

#[async_trait]
impl SearchTransport for HttpTransport {
    async fn execute(
        &self,
        method: ApiMethod,
        part: &str,
        params: &Attributes,
    ) -> Result<Value, ClientError> {
        let transport = self.clone();
        let part = part.to_owned();
        let params = params.clone();
        tokio::task::spawn_blocking(move || transport.call_blocking(method, &part, &params))
            .await
            .map_err(|err| ClientError::upstream(format!("request task failed: {err}")))?
    }
}

/// Rate-limited entry point to the remote API. Retries are left to callers.
#[derive(Clone)]
pub struct SearchClient {
    transport: Arc<dyn SearchTransport>,
    limiter: RateLimiter,
}

impl SearchClient {
    pub fn new(transport: Arc<dyn SearchTransport>, limiter: RateLimiter) -> Self {
        Self { transport, limiter }
    }

    /// Name-based dispatch. The allow-list check runs first.
    pub async fn call(
        &self,
        name: &str,
        part: &str,
        params: &Attributes,
    ) -> Result<Value, ClientError> {
        let method: ApiMethod = name.parse()?;
        self.dispatch(method, part, params).await
    }

    pub async fn search(&self, part: &str, params: &Attributes) -> Result<Value, ClientError> {
        self.dispatch(ApiMethod::Search, part, params).await
    }

    pub async fn list(&self, part: &str, params: &Attributes) -> Result<Value, ClientError> {
        self.dispatch(ApiMethod::List, part, params).await
    }

    async fn dispatch(
        &self,
        method: ApiMethod,
        part: &str,
        params: &Attributes,
    ) -> Result<Value, ClientError> {
        self.limiter.acquire().await;
        debug!(%method, part, "calling remote api");
        self.transport.execute(method, part, params).await
    }
}
