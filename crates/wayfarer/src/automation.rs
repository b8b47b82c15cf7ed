//! The automation boundary.
//!
//! The engine treats every browser action as an opaque async call returning
//! a result object plus the tab's updated URL. The real driver lives behind
//! this trait; tests and embedders provide their own implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::AutomationError;

/// Result of one boundary call.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub result: Value,
    pub current_url: Option<String>,
}

impl ActionOutcome {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            current_url: None,
        }
    }

    pub fn with_url(result: Value, url: impl Into<String>) -> Self {
        Self {
            result,
            current_url: Some(url.into()),
        }
    }
}

#[async_trait]
pub trait AutomationBridge: Send + Sync {
    async fn navigate(&self, tab: &str, url: &str) -> Result<ActionOutcome, AutomationError>;

    async fn click(&self, tab: &str, target: &str) -> Result<ActionOutcome, AutomationError>;

    async fn type_text(
        &self,
        tab: &str,
        target: &str,
        text: &str,
    ) -> Result<ActionOutcome, AutomationError>;

    /// Delegate an ambiguous instruction to the AI-driven action chooser.
    async fn act(&self, tab: &str, instruction: &str) -> Result<ActionOutcome, AutomationError>;

    async fn extract(
        &self,
        tab: &str,
        instruction: &str,
        schema: Option<&Value>,
    ) -> Result<ActionOutcome, AutomationError>;

    async fn screenshot(&self, tab: &str) -> Result<ActionOutcome, AutomationError>;
}

/// Bounded-retry wrapper for timeout-class failures.
///
/// Retrying lives here at the boundary; the executor never re-drives an
/// action itself.
pub struct RetryBridge<B> {
    inner: B,
    max_attempts: u32,
    settle: Duration,
}

impl<B: AutomationBridge> RetryBridge<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            max_attempts: 3,
            settle: Duration::from_millis(500),
        }
    }

    pub fn with_policy(inner: B, max_attempts: u32, settle: Duration) -> Self {
        Self {
            inner,
            max_attempts,
            settle,
        }
    }

    async fn retry<F, Fut>(&self, what: &str, call: F) -> Result<ActionOutcome, AutomationError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<ActionOutcome, AutomationError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!("{} attempt {}/{} timed out, retrying", what, attempt, self.max_attempts);
                    tokio::time::sleep(self.settle).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{} failed after {} attempt(s): {}", what, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<B: AutomationBridge> AutomationBridge for RetryBridge<B> {
    async fn navigate(&self, tab: &str, url: &str) -> Result<ActionOutcome, AutomationError> {
        self.retry("navigate", || self.inner.navigate(tab, url)).await
    }

    async fn click(&self, tab: &str, target: &str) -> Result<ActionOutcome, AutomationError> {
        self.retry("click", || self.inner.click(tab, target)).await
    }

    async fn type_text(
        &self,
        tab: &str,
        target: &str,
        text: &str,
    ) -> Result<ActionOutcome, AutomationError> {
        self.retry("type_text", || self.inner.type_text(tab, target, text))
            .await
    }

    async fn act(&self, tab: &str, instruction: &str) -> Result<ActionOutcome, AutomationError> {
        self.retry("act", || self.inner.act(tab, instruction)).await
    }

    async fn extract(
        &self,
        tab: &str,
        instruction: &str,
        schema: Option<&Value>,
    ) -> Result<ActionOutcome, AutomationError> {
        self.retry("extract", || self.inner.extract(tab, instruction, schema))
            .await
    }

    async fn screenshot(&self, tab: &str) -> Result<ActionOutcome, AutomationError> {
        self.retry("screenshot", || self.inner.screenshot(tab)).await
    }
}

/// Blanket passthrough so `Arc<dyn AutomationBridge>` composes with the
/// retry wrapper and executor generics.
#[async_trait]
impl AutomationBridge for Arc<dyn AutomationBridge> {
    async fn navigate(&self, tab: &str, url: &str) -> Result<ActionOutcome, AutomationError> {
        self.as_ref().navigate(tab, url).await
    }

    async fn click(&self, tab: &str, target: &str) -> Result<ActionOutcome, AutomationError> {
        self.as_ref().click(tab, target).await
    }

    async fn type_text(
        &self,
        tab: &str,
        target: &str,
        text: &str,
    ) -> Result<ActionOutcome, AutomationError> {
        self.as_ref().type_text(tab, target, text).await
    }

    async fn act(&self, tab: &str, instruction: &str) -> Result<ActionOutcome, AutomationError> {
        self.as_ref().act(tab, instruction).await
    }

    async fn extract(
        &self,
        tab: &str,
        instruction: &str,
        schema: Option<&Value>,
    ) -> Result<ActionOutcome, AutomationError> {
        self.as_ref().extract(tab, instruction, schema).await
    }

    async fn screenshot(&self, tab: &str) -> Result<ActionOutcome, AutomationError> {
        self.as_ref().screenshot(tab).await
    }
}
