use async_trait::async_trait;
use std::time::Duration;

use super::payload::OutboundEventPayload;
use crate::config::CoreSection;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Core rejected event with status {0}")]
    Status(reqwest::StatusCode),
}

/// Delivery seam for outbound events. The production implementation talks
/// to core over HTTP; tests substitute a recording sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, payload: &OutboundEventPayload) -> Result<(), RelayError>;
}

/// HTTP client for the core control plane.
///
/// Every delivery attempt is bounded by the configured timeout; callers that
/// must not block dispatch the send on a detached task and treat failure as
/// a logged warning.
pub struct CoreClient {
    http: reqwest::Client,
    events_url: String,
    token: String,
}

impl CoreClient {
    pub fn new(core: &CoreSection, timeout: Duration) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let events_url = format!(
            "{}/v1/agents/{}/events",
            core.url.trim_end_matches('/'),
            urlencoding::encode(&core.name)
        );
        Ok(Self {
            http,
            events_url,
            token: core.token.clone(),
        })
    }
}

#[async_trait]
impl EventSink for CoreClient {
    async fn send(&self, payload: &OutboundEventPayload) -> Result<(), RelayError> {
        let response = self
            .http
            .post(&self.events_url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::Status(response.status()));
        }
        Ok(())
    }
}
