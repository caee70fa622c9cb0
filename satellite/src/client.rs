//! HTTP submission to the groundstation.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::types::{HeartbeatPayload, TelemetryPayload};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("bad groundstation url: {0}")]
    Url(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("groundstation rejected submission ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    heartbeat: Url,
    stats: Url,
}

impl Client {
    pub fn new(base: &Url, timeout: Duration) -> Result<Self, SubmitError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            heartbeat: base.join("api/heartbeat")?,
            stats: base.join("api/stats")?,
        })
    }

    async fn post<T: Serialize>(&self, url: &Url, body: &T) -> Result<(), SubmitError> {
        let resp = self.http.post(url.clone()).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SubmitError::Rejected { status, body })
    }

    pub async fn heartbeat(&self, payload: &HeartbeatPayload) -> Result<(), SubmitError> {
        self.post(&self.heartbeat, payload).await
    }

    /// A rejected submission is dropped by the caller; nothing is buffered.
    pub async fn submit(&self, payload: &TelemetryPayload) -> Result<(), SubmitError> {
        self.post(&self.stats, payload).await
    }
}
