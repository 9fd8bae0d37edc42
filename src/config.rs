use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Pure hook applied to every outgoing request, for auth tokens and
/// similar per-deployment concerns.
pub type RequestTransform =
    Arc<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

/// Engine configuration. Every recognized field is enumerated here; there
/// is no bag of dynamic parameters.
#[derive(Clone)]
pub struct UploaderConfig {
    pub check_endpoint: String,
    pub status_endpoint: String,
    pub upload_endpoint: String,
    pub merge_endpoint: String,
    /// Static headers attached to every request.
    pub headers: HashMap<String, String>,
    /// Per-request timeout; an elapsed timeout is a retryable failure.
    pub request_timeout: Duration,
    pub max_retry: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub transform: Option<RequestTransform>,
}

impl UploaderConfig {
    /// Conventional endpoint layout under one base URL.
    pub fn for_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            check_endpoint: format!("{base}/check"),
            status_endpoint: format!("{base}/status"),
            upload_endpoint: format!("{base}/upload"),
            merge_endpoint: format!("{base}/merge"),
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry: self.max_retry,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            check_endpoint: String::new(),
            status_endpoint: String::new(),
            upload_endpoint: String::new(),
            merge_endpoint: String::new(),
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(30),
            max_retry: retry.max_retry,
            initial_backoff: retry.initial_backoff,
            max_backoff: retry.max_backoff,
            transform: None,
        }
    }
}

impl fmt::Debug for UploaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploaderConfig")
            .field("check_endpoint", &self.check_endpoint)
            .field("status_endpoint", &self.status_endpoint)
            .field("upload_endpoint", &self.upload_endpoint)
            .field("merge_endpoint", &self.merge_endpoint)
            .field("headers", &self.headers)
            .field("request_timeout", &self.request_timeout)
            .field("max_retry", &self.max_retry)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}
