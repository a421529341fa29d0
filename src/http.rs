use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};

use crate::error::HarvestError;

/// Selects the error variants a client instance reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Portal,
    Query,
}

impl Service {
    fn transport_error(self, message: String) -> HarvestError {
        match self {
            Service::Portal => HarvestError::PortalHttp(message),
            Service::Query => HarvestError::QueryHttp(message),
        }
    }

    fn status_error(self, status: u16, message: String) -> HarvestError {
        match self {
            Service::Portal => HarvestError::PortalStatus { status, message },
            Service::Query => HarvestError::QueryStatus { status, message },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl RetryPolicy {
    /// Sleep before retry `attempt` (1-based): `base^(attempt-1) + 0.1*attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let seconds = self.backoff_base.powi(attempt as i32 - 1) + 0.1 * f64::from(attempt);
        Duration::from_secs_f64(seconds)
    }
}

/// A response that passed the genuine-success checks; the body is fully read.
#[derive(Debug, Clone)]
pub struct CheckedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl CheckedResponse {
    pub fn is_json(&self) -> bool {
        self.content_type.contains("json")
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

enum AttemptError {
    Retryable(String),
    Fatal(HarvestError),
}

#[derive(Clone)]
pub struct ResilientClient {
    client: Client,
    service: Service,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(
        service: Service,
        user_agent: &str,
        policy: RetryPolicy,
    ) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|err| service.transport_error(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(policy.connect_timeout)
            .timeout(policy.read_timeout)
            .build()
            .map_err(|err| service.transport_error(err.to_string()))?;
        Ok(Self {
            client,
            service,
            policy,
        })
    }

    pub fn get(&self, url: &str, params: &[(&str, String)]) -> Result<CheckedResponse, HarvestError> {
        run_with_retries(self.service, &self.policy, url, || {
            let response = self
                .client
                .get(url)
                .query(params)
                .send()
                .map_err(|err| classify_send_error(self.service, &err))?;
            check_response(self.service, url, response)
        })
    }

    pub fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        accept: Option<&str>,
    ) -> Result<CheckedResponse, HarvestError> {
        run_with_retries(self.service, &self.policy, url, || {
            let mut request = self.client.post(url).form(form);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request
                .send()
                .map_err(|err| classify_send_error(self.service, &err))?;
            check_response(self.service, url, response)
        })
    }
}

fn run_with_retries<T>(
    service: Service,
    policy: &RetryPolicy,
    url: &str,
    mut attempt_fn: impl FnMut() -> Result<T, AttemptError>,
) -> Result<T, HarvestError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let message = match attempt_fn() {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Retryable(message)) => message,
        };
        if attempt > policy.max_retries {
            return Err(service.transport_error(message));
        }
        let delay = policy.backoff_delay(attempt);
        tracing::warn!(
            "[retry {attempt}/{max}] {url} -> {message}; sleeping {sleep:.1}s",
            max = policy.max_retries,
            sleep = delay.as_secs_f64(),
        );
        thread::sleep(delay);
    }
}

fn classify_send_error(service: Service, err: &reqwest::Error) -> AttemptError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AttemptError::Retryable(err.to_string())
    } else {
        AttemptError::Fatal(service.transport_error(err.to_string()))
    }
}

fn check_response(
    service: Service,
    url: &str,
    response: reqwest::blocking::Response,
) -> Result<CheckedResponse, AttemptError> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    // A read that stalls mid-body is retried like a stalled connect.
    let body = response
        .text()
        .map_err(|err| AttemptError::Retryable(format!("body read failed: {err}")))?;

    let peek = if content_type.contains("text/") || content_type.contains("html") {
        body.chars().take(4000).collect()
    } else {
        String::new()
    };

    if matches!(status, 429 | 500 | 502 | 503 | 504) {
        return Err(AttemptError::Retryable(format!("retryable status {status}")));
    }
    // Some servers report internal timeouts as client errors.
    if status == 400 && is_timeout_like(&peek) {
        return Err(AttemptError::Retryable(
            "status 400 with timeout-like body".to_string(),
        ));
    }
    if !(200..300).contains(&status) {
        return Err(AttemptError::Fatal(
            service.status_error(status, snippet(&body)),
        ));
    }
    // And some report errors with a success status and an HTML page.
    if peek.contains("<html") && peek.contains("error") {
        return Err(AttemptError::Fatal(HarvestError::ErrorPage {
            url: url.to_string(),
        }));
    }

    Ok(CheckedResponse {
        status,
        content_type,
        body,
    })
}

fn is_timeout_like(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    lowered.contains("timeout") || lowered.contains("time out") || lowered.contains("timed out")
}

fn snippet(body: &str) -> String {
    body.chars().take(500).collect()
}
