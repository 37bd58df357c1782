//! Session-cookie HTTP fetching shared by download workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};

/// User agent matching the browser session, so cookie-backed requests look
/// like they come from the same client.
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Raw result of one authenticated fetch.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl FetchedPayload {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authenticated request-fetch primitive: returns status code and raw bytes
/// using the browser session's cookies.
#[async_trait]
pub trait SessionFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPayload>;
}

/// A cookie exported from the browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

/// reqwest client carrying cookies exported from the browser session.
///
/// reqwest clients are cheap to clone and safe for concurrent use, so one
/// instance serves every download worker.
#[derive(Clone)]
pub struct AuthenticatedClient {
    client: reqwest::Client,
}

impl AuthenticatedClient {
    /// Build a client whose cookie jar is seeded from browser cookies.
    /// Cookies without a name or domain are skipped.
    pub fn from_cookies(cookies: &[SessionCookie], timeout: Duration) -> Result<Self> {
        let jar = Jar::default();
        for cookie in cookies {
            if cookie.name.is_empty() || cookie.domain.is_empty() {
                continue;
            }
            let scheme = if cookie.secure { "https" } else { "http" };
            let origin = format!("{}://{}/", scheme, cookie.domain.trim_start_matches('.'));
            if let Ok(url) = origin.parse::<reqwest::Url>() {
                let cookie_str = format!(
                    "{}={}; Domain={}; Path={}",
                    cookie.name, cookie.value, cookie.domain, cookie.path
                );
                jar.add_cookie_str(&cookie_str, &url);
            }
        }

        let client = reqwest::Client::builder()
            .cookie_provider(Arc::new(jar))
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SessionFetch for AuthenticatedClient {
    async fn fetch(&self, url: &str) -> Result<FetchedPayload> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/pdf, */*")
            .send()
            .await
            .with_context(|| format!("request failed for {url}"))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("body read failed for {url}"))?;

        Ok(FetchedPayload {
            status,
            bytes: bytes.to_vec(),
        })
    }
}
