//! The narrow interface the core uses to reach language models. Provider
//! clients live outside this crate and implement [`LlmClient`].
use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// How a failed generation should be treated by the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LlmErrorKind {
    RateLimited,
    Timeout,
    Connection,
    ServerError,
    Authentication,
    InvalidRequest,
    ContentFiltered,
    Other,
}

impl LlmErrorKind {
    /// Transient failures; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::Timeout | LlmErrorKind::Connection | LlmErrorKind::ServerError
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short name used in logs, e.g. the provider.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        messages: &[LlmMessage],
        model: &str,
        options: &Map<String, Value>,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per client, the first one included.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, retry: usize) -> Duration {
        let factor = self.multiplier.saturating_pow(retry as u32);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Tries each client in turn. Retryable errors are retried with backoff on
/// the same client; anything else, or running out of attempts, moves on to
/// the next one. The last error is returned when every client failed.
pub struct FallbackClient {
    clients: Vec<Arc<dyn LlmClient>>,
    policy: RetryPolicy,
}

impl FallbackClient {
    pub fn new(clients: Vec<Arc<dyn LlmClient>>) -> Self {
        Self {
            clients,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for FallbackClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.clients.iter().map(|c| c.name()).collect();
        f.debug_struct("FallbackClient")
            .field("clients", &names)
            .field("policy", &self.policy)
            .finish()
    }
}

#[async_trait]
impl LlmClient for FallbackClient {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn generate(
        &self,
        messages: &[LlmMessage],
        model: &str,
        options: &Map<String, Value>,
    ) -> Result<String, LlmError> {
        let mut last = LlmError::new(LlmErrorKind::Other, "no clients configured");
        for client in &self.clients {
            for attempt in 0..self.policy.max_attempts.max(1) {
                match client.generate(messages, model, options).await {
                    Ok(text) => return Ok(text),
                    Err(e) if e.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                        let delay = self.policy.delay_for(attempt);
                        warn!(client = client.name(), attempt = attempt + 1, ?delay, "retrying: {e}");
                        sleep(delay).await;
                    }
                    Err(e) => {
                        warn!(client = client.name(), "giving up on client: {e}");
                        last = e;
                        break;
                    }
                }
            }
            info!(client = client.name(), "falling back to next client");
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Scripted {
        name: &'static str,
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(name: &'static str, replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl LlmClient for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _: &[LlmMessage], _: &str, _: &Map<String, Value>) -> Result<String, LlmError> {
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::new(LlmErrorKind::Other, "script exhausted")))
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2,
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let flaky = Scripted::new(
            "flaky",
            vec![
                Err(LlmError::new(LlmErrorKind::RateLimited, "slow down")),
                Ok("hello".into()),
            ],
        );
        let client = FallbackClient::new(vec![flaky.clone() as Arc<dyn LlmClient>]).with_policy(fast());
        let out = client
            .generate(&[LlmMessage::user("hi")], "m", &Map::new())
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn falls_back_on_permanent_errors() {
        let primary = Scripted::new("primary", vec![Err(LlmError::new(LlmErrorKind::Authentication, "bad key"))]);
        let backup = Scripted::new("backup", vec![Ok("from backup".into())]);
        let client = FallbackClient::new(vec![primary.clone() as Arc<dyn LlmClient>, backup.clone()]).with_policy(fast());
        let out = client.generate(&[], "m", &Map::new()).await.unwrap();
        assert_eq!(out, "from backup");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn reports_last_error() {
        let down = Scripted::new(
            "down",
            vec![
                Err(LlmError::new(LlmErrorKind::Connection, "refused")),
                Err(LlmError::new(LlmErrorKind::Connection, "refused")),
                Err(LlmError::new(LlmErrorKind::Connection, "refused")),
            ],
        );
        let client = FallbackClient::new(vec![down.clone() as Arc<dyn LlmClient>]).with_policy(fast());
        let err = client.generate(&[], "m", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Connection);
        assert_eq!(down.calls(), 3);

        let none = FallbackClient::new(Vec::new());
        assert_eq!(none.generate(&[], "m", &Map::new()).await.unwrap_err().kind, LlmErrorKind::Other);
    }

    #[test]
    fn backoff_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(10), Duration::from_secs(10));
        assert!(!LlmErrorKind::InvalidRequest.is_retryable());
    }
}
