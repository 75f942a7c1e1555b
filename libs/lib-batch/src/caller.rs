//! Outbound HTTP with pacing and bounded retries.
//!
//! Every attempt first passes the [`RateGate`]. 429, 5xx and network
//! failures are retried with exponential backoff plus jitter; any other
//! non-success status fails immediately.

use std::sync::Arc;
use std::time::Duration;

use lib_utils::text::preview;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::{CallError, TransportError};
use crate::rate_gate::RateGate;

pub type HttpClient = reqwest::blocking::Client;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl CallRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer_auth(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self.header("Content-Type", "application/json"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub status: u16,
    pub body: String,
}

impl CallResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Sends one request, once.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &CallRequest) -> Result<CallResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: HttpClient,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = HttpClient::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: HttpClient) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn execute(&self, request: &CallRequest) -> Result<CallResponse, TransportError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|e| {
            if e.is_builder() {
                TransportError::InvalidRequest(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(CallResponse { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(1500),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the failed attempt `attempt` (0-based), before jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff.saturating_mul(factor)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        self.base_backoff(attempt) + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Success(CallResponse),
    Retryable(String),
    Permanent { status: u16, body: String },
    Invalid(String),
}

pub fn classify(result: Result<CallResponse, TransportError>) -> Outcome {
    match result {
        Ok(response) if response.is_success() => Outcome::Success(response),
        Ok(response) => {
            let retryable = response.status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                || response.status >= 500;
            if retryable {
                Outcome::Retryable(format!("HTTP {}: {}", response.status, preview(&response.body, 500)))
            } else {
                Outcome::Permanent {
                    status: response.status,
                    body: response.body,
                }
            }
        }
        Err(TransportError::Network(message)) => Outcome::Retryable(message),
        Err(TransportError::InvalidRequest(message)) => Outcome::Invalid(message),
    }
}

pub struct ResilientCaller {
    transport: Arc<dyn Transport>,
    gate: Arc<RateGate>,
    clock: SharedClock,
    policy: RetryPolicy,
}

impl ResilientCaller {
    pub fn new(
        transport: Arc<dyn Transport>,
        gate: Arc<RateGate>,
        clock: SharedClock,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            gate,
            clock,
            policy,
        }
    }

    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    pub fn call(&self, request: &CallRequest) -> Result<CallResponse, CallError> {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            self.gate.acquire();

            match classify(self.transport.execute(request)) {
                Outcome::Success(response) => return Ok(response),
                Outcome::Permanent { status, body } => {
                    tracing::error!(status, url = %request.url, "Non-retryable API error: {}", preview(&body, 500));
                    return Err(CallError::Permanent { status, body });
                }
                Outcome::Invalid(message) => return Err(CallError::InvalidRequest(message)),
                Outcome::Retryable(message) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        url = %request.url,
                        "API call failed: {message}"
                    );
                    last_error = message;
                }
            }

            if attempt + 1 < attempts {
                let delay = self.policy.backoff_with_jitter(attempt);
                tracing::info!(delay_ms = delay.as_millis() as u64, "Retrying after backoff");
                self.clock.sleep(delay);
            }
        }

        Err(CallError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    pub fn call_json<T: DeserializeOwned>(&self, request: &CallRequest) -> anyhow::Result<T> {
        let response = self.call(request)?;
        response.json().map_err(|e| {
            anyhow::anyhow!(
                "unexpected response body ({e}): {}",
                preview(&response.body, 300)
            )
        })
    }
}
