//! Push/pull transport: the five service endpoints behind a seam.
//!
//! The transport never retries; a failed call aborts the cycle and the next
//! scheduled cycle tries again. Nothing is lost because device state only
//! persists at cycle end.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::{DeltaResponse, HealthResponse, PushRequest, PushResponse, ResetResponse, StateResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server rejected credentials")]
    Unauthorized,
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

pub trait Transport {
    fn health(&self) -> Result<HealthResponse, TransportError>;
    fn state(&self) -> Result<StateResponse, TransportError>;
    fn delta(&self, since: DateTime<Utc>) -> Result<DeltaResponse, TransportError>;
    fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError>;
    fn reset(&self) -> Result<ResetResponse, TransportError>;
}

/// The real HTTPS transport with bearer auth.
pub struct HttpTransport {
    base: String,
    token: String,
    http: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(server_url: &str, token: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base: server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn handle<T: DeserializeOwned>(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json()?)
    }
}

impl Transport for HttpTransport {
    fn health(&self) -> Result<HealthResponse, TransportError> {
        let response = self.http.get(format!("{}/health", self.base)).send()?;
        self.handle(response)
    }

    fn state(&self) -> Result<StateResponse, TransportError> {
        let response = self
            .http
            .get(format!("{}/state", self.base))
            .bearer_auth(&self.token)
            .send()?;
        self.handle(response)
    }

    fn delta(&self, since: DateTime<Utc>) -> Result<DeltaResponse, TransportError> {
        let response = self
            .http
            .get(format!("{}/delta", self.base))
            .query(&[("since", since.to_rfc3339_opts(SecondsFormat::Micros, true))])
            .bearer_auth(&self.token)
            .send()?;
        self.handle(response)
    }

    fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        let response = self
            .http
            .post(format!("{}/push", self.base))
            .bearer_auth(&self.token)
            .json(request)
            .send()?;
        self.handle(response)
    }

    fn reset(&self) -> Result<ResetResponse, TransportError> {
        let response = self
            .http
            .delete(format!("{}/reset", self.base))
            .bearer_auth(&self.token)
            .send()?;
        self.handle(response)
    }
}
