//! Interstitial gate handling for the catalog's entry pages.
//!
//! The catalog fronts its listings with a robot check and an age
//! verification prompt. Both are plain DOM buttons, so they are clicked
//! through evaluated scripts. A session that already carries verification
//! cookies shows neither prompt and passes straight through.

use anyhow::Result;
use tracing::{error, info};

use super::PageDriver;

const ROBOT_PROMPT: &str = "I am not a robot";
const AGE_PROMPT: &str = "Are you 18 years of age";

const ROBOT_CLICK: &str = r#"(() => {
    const btn = document.querySelector('input.usa-button[value="I am not a robot"]');
    if (btn) { btn.click(); return true; }
    return false;
})()"#;

const AGE_CLICK: &str = r#"(() => {
    const btn = document.getElementById('age-button-yes');
    if (btn) { btn.click(); return true; }
    return false;
})()"#;

/// Click through whichever gates the current page presents.
///
/// Checks page content before each click so cached sessions are not broken
/// by blind clicking. Click failures are logged, not fatal: the collector
/// will notice an unusable page on its own.
pub async fn pass_gates<P: PageDriver + ?Sized>(page: &mut P) -> Result<()> {
    page.settle(2000).await;
    let content = page.content().await?;

    if content.contains(ROBOT_PROMPT) {
        info!("clicking through robot check");
        match page.evaluate_bool(ROBOT_CLICK).await {
            Ok(true) => page.settle(3000).await,
            Ok(false) => error!("robot check button not found"),
            Err(e) => error!("robot check click failed: {}", e),
        }
    }

    let content = page.content().await?;
    if content.contains(AGE_PROMPT) {
        info!("clicking through age verification");
        match page.evaluate_bool(AGE_CLICK).await {
            Ok(true) => page.settle(3000).await,
            Ok(false) => error!("age verification button not found"),
            Err(e) => error!("age verification click failed: {}", e),
        }
    } else {
        info!("session already verified");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Scripted page: serves canned content and records evaluated scripts.
    struct FakeGatePage {
        contents: Vec<String>,
        clicks: Vec<String>,
    }

    #[async_trait]
    impl PageDriver for FakeGatePage {
        async fn goto(&mut self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn content(&mut self) -> Result<String> {
            if self.contents.len() > 1 {
                Ok(self.contents.remove(0))
            } else {
                Ok(self.contents[0].clone())
            }
        }

        async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value> {
            self.clicks.push(script.to_string());
            Ok(serde_json::Value::Bool(true))
        }

        async fn settle(&mut self, _millis: u64) {}
    }

    #[tokio::test]
    async fn test_passes_both_gates_in_order() {
        let mut page = FakeGatePage {
            contents: vec![
                format!("<html>{ROBOT_PROMPT}</html>"),
                format!("<html>{AGE_PROMPT}</html>"),
            ],
            clicks: Vec::new(),
        };
        pass_gates(&mut page).await.unwrap();
        assert_eq!(page.clicks.len(), 2);
        assert!(page.clicks[0].contains("usa-button"));
        assert!(page.clicks[1].contains("age-button-yes"));
    }

    #[tokio::test]
    async fn test_verified_session_clicks_nothing() {
        let mut page = FakeGatePage {
            contents: vec!["<html>results</html>".to_string()],
            clicks: Vec::new(),
        };
        pass_gates(&mut page).await.unwrap();
        assert!(page.clicks.is_empty());
    }
}
