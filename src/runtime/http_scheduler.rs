use crate::error::SchedulerError;
use crate::protocol::wire::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};
use crate::runtime::scheduler::SchedulerClient;
use async_trait::async_trait;
use std::time::Duration;

pub const REGISTER_API: &str = "/register";
pub const HEARTBEAT_API: &str = "/heartbeat";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to the scheduler's JSON-over-HTTP API.
pub struct HttpScheduler {
    client: reqwest::Client,
    base_url: String,
}

impl HttpScheduler {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, api: &str) -> String {
        format!("{}{}", self.base_url, api)
    }
}

#[async_trait]
impl SchedulerClient for HttpScheduler {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, SchedulerError> {
        let response = self
            .client
            .post(self.endpoint(REGISTER_API))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, SchedulerError> {
        let response = self
            .client
            .post(self.endpoint(HEARTBEAT_API))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
