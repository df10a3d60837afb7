//! HTTP request handler.
//!
//! [`UrlHandler`] calls a URL as a job. The response body becomes the run's
//! output; a non-success status fails the run with the status and the end of
//! the body. The request is dropped when the run is cancelled.
//!
//! ```rust
//! use tickwork::UrlHandler;
//!
//! let ping = UrlHandler::get("https://status.example.com/ping").unwrap();
//! assert_eq!(ping.method(), "GET");
//!
//! let warm = UrlHandler::builder("https://app.example.com/cache/warm")
//!     .method("post")
//!     .header("authorization", "Bearer token")
//!     .body(r#"{"scope":"all"}"#)
//!     .build()
//!     .unwrap();
//! assert_eq!(warm.method(), "POST");
//! ```

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use std::collections::BTreeMap;
use std::time::Duration;

use super::command::{MAX_STDERR_LEN, tail};
use crate::core::job::{HandlerError, JobContext, JobError, JobHandler};

/// Request timeout when none is set.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Redirects followed before the request fails.
const MAX_REDIRECTS: usize = 3;

/// A job handler that sends an HTTP request.
#[derive(Debug, Clone)]
pub struct UrlHandler {
    client: Client,
    method: Method,
    url: Url,
    headers: BTreeMap<String, String>,
    body: Option<String>,
    timeout: Duration,
}

impl UrlHandler {
    /// Create a new builder for a request to `url`.
    pub fn builder(url: impl Into<String>) -> UrlHandlerBuilder {
        UrlHandlerBuilder::new(url)
    }

    /// A plain GET request.
    pub fn get(url: impl Into<String>) -> Result<Self, JobError> {
        Self::builder(url).build()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &str {
        self.method.as_str()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, ctx: &JobContext) -> Result<Option<String>, HandlerError> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .timeout(self.timeout)
            .header("x-tickwork-job-id", ctx.job_id.as_str())
            .header("x-tickwork-run-id", ctx.run_id.to_string())
            .header("x-tickwork-attempt", ctx.attempt.to_string());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.request_error(e))?;
        let text = text.trim_end();

        if !status.is_success() {
            tracing::debug!(url = %self.url, status = status.as_u16(), "Request failed");
            return Err(HandlerError::HttpStatus {
                status: status.as_u16(),
                body: tail(text, MAX_STDERR_LEN),
            });
        }
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    fn request_error(&self, e: reqwest::Error) -> HandlerError {
        if e.is_timeout() {
            HandlerError::Timeout(self.timeout)
        } else if e.is_connect() {
            HandlerError::Transient(format!("{}: {}", self.url, e))
        } else {
            HandlerError::ExecutionFailed(format!("{}: {}", self.url, e))
        }
    }
}

#[async_trait]
impl JobHandler for UrlHandler {
    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
        // Dropping the request future aborts the connection.
        tokio::select! {
            result = self.send(&ctx) => result,
            _ = ctx.cancelled() => Err(HandlerError::ExecutionFailed(format!(
                "request to {} cancelled",
                self.url
            ))),
        }
    }
}

/// Builder for creating `UrlHandler` instances.
#[derive(Debug, Clone)]
pub struct UrlHandlerBuilder {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
    timeout: Duration,
    client: Option<Client>,
}

impl UrlHandlerBuilder {
    /// Create a new builder for a GET request to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET.to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: None,
        }
    }

    /// HTTP method, case-insensitive.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add several request headers.
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Request body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send through an existing client instead of building one.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<UrlHandler, JobError> {
        let url = Url::parse(&self.url)
            .map_err(|e| JobError::InvalidConfig(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(JobError::InvalidConfig(format!(
                "url '{}' must use http or https",
                self.url
            )));
        }

        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| JobError::InvalidConfig(format!("invalid HTTP method '{}'", self.method)))?;

        if self.timeout.is_zero() {
            return Err(JobError::InvalidConfig(
                "request timeout must be positive".into(),
            ));
        }

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
                .build()
                .map_err(|e| JobError::InvalidConfig(format!("HTTP client: {}", e)))?,
        };

        Ok(UrlHandler {
            client,
            method,
            url,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
        })
    }
}
