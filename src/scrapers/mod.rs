//! Browser-driven collection of catalog records.

pub mod browser;
pub mod collect;
pub mod gate;
pub mod http;

#[cfg(feature = "browser")]
pub use browser::SharedSession;
pub use browser::{BrowserSession, BrowserSessionConfig};
pub use collect::LinkCollector;
pub use http::{AuthenticatedClient, FetchedPayload, SessionCookie, SessionFetch};

use anyhow::Result;
use async_trait::async_trait;

/// Surface the collector needs from a live browser page.
///
/// One implementation drives a real Chromium tab; tests script their own
/// pages. Navigation is strictly sequential — implementations may assume a
/// single caller at a time.
#[async_trait]
pub trait PageDriver: Send {
    /// Navigate to a URL and wait for the page to settle.
    async fn goto(&mut self, url: &str) -> Result<()>;

    /// Full rendered HTML of the current page.
    async fn content(&mut self) -> Result<String>;

    /// Run a script against the live page and return its JSON value.
    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value>;

    /// Run a script expected to resolve to a boolean.
    async fn evaluate_bool(&mut self, script: &str) -> Result<bool> {
        Ok(self.evaluate(script).await?.as_bool().unwrap_or(false))
    }

    /// Pause to let asynchronous page content finish rendering.
    async fn settle(&mut self, millis: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
    }
}
