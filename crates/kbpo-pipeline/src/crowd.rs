//! Crowd collaborator clients
//!
//! The pipeline posts one HIT per question and later collects the workers'
//! assignments. [`HttpCrowdClient`] talks to a marketplace bridge over HTTP
//! with retry and exponential backoff; [`MockCrowd`] keeps everything in
//! memory for tests and offline runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbpo_core::{BatchType, CrowdConfig, KbpoError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

// ============================================================================
// Types
// ============================================================================

/// What to post for one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRequest {
    pub question_id: String,
    pub batch_type: BatchType,
    pub params: Value,
    pub max_assignments: u32,
    pub lifetime_secs: u64,
    pub reward_cents: u32,
}

/// One worker's answer as returned by the collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrowdAssignment {
    pub id: String,
    pub worker_id: String,
    pub response: Value,
    pub submitted_at: DateTime<Utc>,
}

/// Crowd marketplace seam
#[async_trait]
pub trait CrowdClient: Send + Sync {
    /// Post a task; returns its handle
    async fn post_hit(&self, request: &HitRequest) -> Result<String>;

    /// Withdraw outstanding assignments of a task
    async fn cancel_hit(&self, hit_id: &str) -> Result<()>;

    /// Assignments submitted so far
    async fn fetch_assignments(&self, hit_id: &str) -> Result<Vec<CrowdAssignment>>;
}

// ============================================================================
// HTTP Client
// ============================================================================

#[derive(Debug, Deserialize)]
struct PostHitResponse {
    hit_id: String,
}

#[derive(Debug, Deserialize)]
struct AssignmentsResponse {
    assignments: Vec<CrowdAssignment>,
}

/// Client for a crowd marketplace bridge
pub struct HttpCrowdClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry_attempts: u32,
    backoff: Duration,
}

impl HttpCrowdClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            retry_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }

    /// Create from config
    pub fn from_config(config: &CrowdConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            retry_attempts: config.retry_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
            ..Self::new(config.endpoint.clone())
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, retrying on transport errors, 429 and 5xx
    async fn send<F>(&self, what: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            let mut request = build(&self.client);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable {
                        return Err(KbpoError::Crowd(format!("{what} failed ({status}): {body}")));
                    }
                    format!("{status}: {body}")
                }
                Err(e) => format!("request failed: {e}"),
            };

            if attempt >= self.retry_attempts {
                return Err(KbpoError::Crowd(format!(
                    "{what} failed after {} attempts: {failure}",
                    attempt + 1
                )));
            }
            attempt += 1;
            warn!(what, attempt, delay_ms = delay.as_millis() as u64, %failure, "retrying crowd request");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

#[async_trait]
impl CrowdClient for HttpCrowdClient {
    async fn post_hit(&self, request: &HitRequest) -> Result<String> {
        let url = self.url("/hits");
        let response = self
            .send("post hit", |c| c.post(&url).json(request))
            .await?;
        let body: PostHitResponse = response
            .json()
            .await
            .map_err(|e| KbpoError::Crowd(format!("Failed to parse hit response: {e}")))?;
        debug!(question_id = %request.question_id, hit_id = %body.hit_id, "posted hit");
        Ok(body.hit_id)
    }

    async fn cancel_hit(&self, hit_id: &str) -> Result<()> {
        let url = self.url(&format!("/hits/{hit_id}"));
        self.send("cancel hit", |c| c.delete(&url)).await?;
        Ok(())
    }

    async fn fetch_assignments(&self, hit_id: &str) -> Result<Vec<CrowdAssignment>> {
        let url = self.url(&format!("/hits/{hit_id}/assignments"));
        let response = self.send("fetch assignments", |c| c.get(&url)).await?;
        let body: AssignmentsResponse = response
            .json()
            .await
            .map_err(|e| KbpoError::Crowd(format!("Failed to parse assignments: {e}")))?;
        Ok(body.assignments)
    }
}

// ============================================================================
// In-memory Crowd
// ============================================================================

/// A posted task as seen by [`MockCrowd`]
#[derive(Debug, Clone)]
pub struct MockHit {
    pub request: HitRequest,
    pub cancelled: bool,
    pub assignments: Vec<CrowdAssignment>,
}

#[derive(Debug, Default)]
struct MockState {
    hits: BTreeMap<String, MockHit>,
    next_id: usize,
    fail_cancel: bool,
}

/// Crowd held in memory; answers are supplied by the caller
#[derive(Debug, Default)]
pub struct MockCrowd {
    state: Mutex<MockState>,
}

impl MockCrowd {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| KbpoError::Crowd("mock crowd state poisoned".to_string()))
    }

    /// Make every following cancellation fail
    pub fn fail_cancellations(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_cancel = fail;
        Ok(())
    }

    /// Record a worker's answer on a task
    pub fn answer(&self, hit_id: &str, worker_id: &str, response: Value) -> Result<String> {
        let mut state = self.lock()?;
        let hit = state
            .hits
            .get_mut(hit_id)
            .ok_or_else(|| KbpoError::NotFound(format!("hit {hit_id}")))?;
        let id = format!("{hit_id}-a{}", hit.assignments.len() + 1);
        hit.assignments.push(CrowdAssignment {
            id: id.clone(),
            worker_id: worker_id.to_string(),
            response,
            submitted_at: Utc::now(),
        });
        Ok(id)
    }

    pub fn hits(&self) -> Result<Vec<(String, MockHit)>> {
        Ok(self
            .lock()?
            .hits
            .iter()
            .map(|(id, hit)| (id.clone(), hit.clone()))
            .collect())
    }

    /// Handle of the latest task posted for a question
    pub fn hit_for_question(&self, question_id: &str) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .hits
            .iter()
            .filter(|(_, h)| h.request.question_id == question_id)
            .map(|(id, _)| id.clone())
            .last())
    }

    pub fn cancelled(&self) -> Result<usize> {
        Ok(self.lock()?.hits.values().filter(|h| h.cancelled).count())
    }
}

#[async_trait]
impl CrowdClient for MockCrowd {
    async fn post_hit(&self, request: &HitRequest) -> Result<String> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = format!("hit{:05}", state.next_id);
        state.hits.insert(
            id.clone(),
            MockHit {
                request: request.clone(),
                cancelled: false,
                assignments: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn cancel_hit(&self, hit_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_cancel {
            return Err(KbpoError::Crowd(format!("cannot cancel {hit_id}")));
        }
        let hit = state
            .hits
            .get_mut(hit_id)
            .ok_or_else(|| KbpoError::NotFound(format!("hit {hit_id}")))?;
        hit.cancelled = true;
        Ok(())
    }

    async fn fetch_assignments(&self, hit_id: &str) -> Result<Vec<CrowdAssignment>> {
        let state = self.lock()?;
        let hit = state
            .hits
            .get(hit_id)
            .ok_or_else(|| KbpoError::NotFound(format!("hit {hit_id}")))?;
        Ok(hit.assignments.clone())
    }
}
