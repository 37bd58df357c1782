//! Browser-backed session for the gate-protected catalog.
//!
//! Uses chromiumoxide (CDP) with stealth evasion so the catalog's bot
//! detection treats the session like a regular browser. The session owns a
//! single page; navigation through it is strictly sequential.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[cfg(feature = "browser")]
use std::sync::Arc;
#[cfg(feature = "browser")]
use std::time::Duration;

#[cfg(feature = "browser")]
use anyhow::Context;
#[cfg(feature = "browser")]
use async_trait::async_trait;
#[cfg(feature = "browser")]
use tokio::sync::Mutex;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;

#[cfg(feature = "browser")]
use super::http::USER_AGENT;
use super::http::{FetchedPayload, SessionCookie};
#[cfg(feature = "browser")]
use super::{PageDriver, SessionFetch};

/// Browser session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSessionConfig {
    /// Run in headless mode (default: true).
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Page navigation timeout in seconds.
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout: u64,

    /// Inject stealth evasion scripts after each navigation (default: true).
    #[serde(default = "default_stealth")]
    pub stealth: bool,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,

    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to an existing browser instead of launching one.
    #[serde(default)]
    pub remote_url: Option<String>,
}

fn default_headless() -> bool {
    true
}

fn default_navigation_timeout() -> u64 {
    60
}

fn default_stealth() -> bool {
    true
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            navigation_timeout: default_navigation_timeout(),
            stealth: default_stealth(),
            chrome_args: Vec::new(),
            remote_url: None,
        }
    }
}

/// Stealth evasion JavaScript injected into pages.
/// Based on puppeteer-extra-plugin-stealth techniques.
#[cfg(feature = "browser")]
const STEALTH_SCRIPTS: &[&str] = &[
    // Remove webdriver property
    r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    "#,
    // Fix chrome object
    r#"
    window.chrome = {
        runtime: {},
        loadTimes: function() {},
        csi: function() {},
        app: {}
    };
    "#,
    // Fix permissions
    r#"
    const originalQuery = window.navigator.permissions.query;
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications' ?
        Promise.resolve({ state: Notification.permission }) :
        originalQuery(parameters)
    );
    "#,
    // Fix plugins (make it look like regular Chrome)
    r#"
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
            { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
        ],
        configurable: true
    });
    "#,
    // Fix languages
    r#"
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
        configurable: true
    });
    "#,
    // Fix WebGL vendor/renderer (common detection vector)
    r#"
    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) {
            return 'Intel Inc.';
        }
        if (parameter === 37446) {
            return 'Intel Iris OpenGL Engine';
        }
        return getParameter.call(this, parameter);
    };
    "#,
];

/// Live browser session: one launched (or remote) Chromium and one page.
#[cfg(feature = "browser")]
pub struct BrowserSession {
    config: BrowserSessionConfig,
    browser: Browser,
    page: Page,
}

#[cfg(feature = "browser")]
impl BrowserSession {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        // Common install locations
        "/opt/google/chrome/google-chrome",
    ];

    /// Find a Chrome/Chromium executable.
    fn find_chrome() -> Result<std::path::PathBuf> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        info!("Found Chrome in PATH: {}", path);
                        return Ok(std::path::PathBuf::from(path));
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "Chrome/Chromium not found. Please install it:\n\
             - Arch/Manjaro: sudo pacman -S chromium\n\
             - Ubuntu/Debian: sudo apt install chromium-browser\n\
             - Fedora: sudo dnf install chromium"
        ))
    }

    /// Launch a browser (or connect to a remote one) and open the session
    /// page with a realistic user agent.
    pub async fn launch(config: BrowserSessionConfig) -> Result<Self> {
        let browser = if let Some(remote_url) = config.remote_url.clone() {
            Self::connect_remote(&remote_url).await?
        } else {
            Self::launch_local(&config).await?
        };

        let page = browser.new_page("about:blank").await?;
        page.execute(SetUserAgentOverrideParams::new(USER_AGENT.to_string()))
            .await?;

        Ok(Self {
            config,
            browser,
            page,
        })
    }

    async fn launch_local(config: &BrowserSessionConfig) -> Result<Browser> {
        info!("Launching browser (headless={})", config.headless);

        let chrome_path = Self::find_chrome()?;
        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);

        // with_head means NOT headless, confusingly
        if !config.headless {
            builder = builder.with_head();
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--no-sandbox") // Often needed for headless in containers
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer");

        for arg in &config.chrome_args {
            builder = builder.arg(arg);
        }

        let browser_config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }

    /// Connect to a remote Chrome instance via its DevTools endpoint.
    async fn connect_remote(url: &str) -> Result<Browser> {
        info!("Connecting to remote browser at {}", url);

        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let client = reqwest::Client::new();
        let resp: serde_json::Value = client
            .get(&version_url)
            .send()
            .await
            .context("Failed to connect to remote browser")?
            .json()
            .await
            .context("Failed to parse browser version info")?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("No webSocketDebuggerUrl in response"))?;

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .context("Failed to connect to remote browser")?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }

    /// Navigate the session page and wait for it to settle.
    pub async fn goto(&self, url: &str) -> Result<()> {
        info!("Navigating to {}", url);
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid URL: {}", e))?;
        self.page.execute(nav_params).await?;

        self.wait_ready().await;

        if self.config.stealth {
            self.apply_stealth().await;
        }

        // Late-loading scripts and async content
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    /// Wait for document.readyState instead of a fixed timeout.
    async fn wait_ready(&self) {
        let wait_script = r#"
            new Promise((resolve) => {
                if (document.readyState === 'complete' || document.readyState === 'interactive') {
                    resolve(document.readyState);
                } else {
                    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                    setTimeout(() => resolve('timeout'), 10000);
                }
            })
        "#;

        let timeout = Duration::from_secs(self.config.navigation_timeout);
        match tokio::time::timeout(timeout, self.page.evaluate(wait_script.to_string())).await {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => {
                // Script execution can fail on non-HTML pages (PDFs)
                debug!("Could not check ready state: {}", e);
            }
            Err(_) => {
                warn!("Timeout waiting for page ready state");
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    /// Apply stealth evasion scripts. Best-effort: failures are expected on
    /// non-HTML pages and during transitions.
    async fn apply_stealth(&self) {
        for script in STEALTH_SCRIPTS {
            if let Err(e) = self.page.evaluate(script.to_string()).await {
                debug!("Stealth script injection skipped: {}", e);
            }
        }
    }

    /// Full rendered HTML of the session page.
    pub async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    /// Evaluate a script against the session page.
    pub async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(script.to_string()).await?;
        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    /// Cookies currently held by the session page.
    pub async fn cookies(&self) -> Result<Vec<SessionCookie>> {
        let cookies = self.page.get_cookies().await?;
        debug!("Got {} cookies from browser", cookies.len());
        Ok(cookies
            .iter()
            .map(|c| SessionCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    /// Fetch a binary file via JavaScript `fetch()` from a page context.
    ///
    /// Runs inside the browser so the request carries the session's cookies
    /// and passes origin checks that block direct HTTP clients. The payload
    /// crosses the CDP boundary base64-encoded.
    pub async fn fetch_binary(
        &self,
        url: &str,
        context_url: Option<&str>,
    ) -> Result<FetchedPayload> {
        let page = if let Some(ctx_url) = context_url {
            debug!("Establishing fetch context at {}", ctx_url);
            let page = self.browser.new_page(ctx_url).await?;
            page.execute(SetUserAgentOverrideParams::new(USER_AGENT.to_string()))
                .await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            page
        } else {
            self.browser.new_page("about:blank").await?
        };

        debug!("Fetching binary from {}", url);
        let fetch_script = format!(
            r#"
            (async () => {{
                try {{
                    const response = await fetch('{}', {{
                        method: 'GET',
                        credentials: 'include',
                        headers: {{ 'Accept': 'application/pdf, */*' }}
                    }});

                    if (!response.ok) {{
                        return {{ status: response.status }};
                    }}

                    const blob = await response.blob();
                    const arrayBuffer = await blob.arrayBuffer();
                    const bytes = new Uint8Array(arrayBuffer);

                    let binary = '';
                    for (let i = 0; i < bytes.length; i++) {{
                        binary += String.fromCharCode(bytes[i]);
                    }}

                    return {{
                        status: response.status,
                        data: btoa(binary)
                    }};
                }} catch (e) {{
                    return {{ error: e.toString() }};
                }}
            }})()
            "#,
            url
        );

        let result: serde_json::Value = page
            .evaluate(fetch_script)
            .await?
            .into_value()
            .context("Failed to parse fetch result")?;

        // Close the page to prevent tab accumulation
        let _ = page.close().await;

        if let Some(error) = result.get("error").and_then(|e| e.as_str()) {
            return Err(anyhow::anyhow!("in-page fetch failed: {}", error));
        }

        let status = result.get("status").and_then(|s| s.as_u64()).unwrap_or(0) as u16;
        let data_b64 = result.get("data").and_then(|d| d.as_str()).unwrap_or("");

        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .context("Failed to decode base64 data")?;

        Ok(FetchedPayload { status, bytes })
    }

    /// Close the browser.
    pub async fn close(&mut self) {
        let _ = self.browser.close().await;
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl PageDriver for BrowserSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        BrowserSession::goto(self, url).await
    }

    async fn content(&mut self) -> Result<String> {
        BrowserSession::content(self).await
    }

    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value> {
        BrowserSession::evaluate(self, script).await
    }
}

/// Cloneable handle to the single browser session.
///
/// Every operation holds the session lock for its duration, keeping page
/// navigation strictly sequential no matter how many handles exist.
#[cfg(feature = "browser")]
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<BrowserSession>>,
}

#[cfg(feature = "browser")]
impl SharedSession {
    pub fn new(session: BrowserSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub async fn cookies(&self) -> Result<Vec<SessionCookie>> {
        self.inner.lock().await.cookies().await
    }

    pub async fn close(&self) {
        self.inner.lock().await.close().await;
    }

    /// A fetcher that downloads through the session's in-page `fetch()`.
    ///
    /// Fetches serialize against navigation on the session lock, which makes
    /// this the inline, back-pressured download mode; the cookie-jar
    /// [`super::AuthenticatedClient`] is the concurrent alternative.
    pub fn in_page_fetcher(&self, context_url: Option<String>) -> InPageFetcher {
        InPageFetcher {
            session: self.inner.clone(),
            context_url,
        }
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl PageDriver for SharedSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.inner.lock().await.goto(url).await
    }

    async fn content(&mut self) -> Result<String> {
        self.inner.lock().await.content().await
    }

    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value> {
        self.inner.lock().await.evaluate(script).await
    }
}

/// [`SessionFetch`] adapter over the in-page fetch primitive.
#[cfg(feature = "browser")]
pub struct InPageFetcher {
    session: Arc<Mutex<BrowserSession>>,
    context_url: Option<String>,
}

#[cfg(feature = "browser")]
#[async_trait]
impl SessionFetch for InPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPayload> {
        self.session
            .lock()
            .await
            .fetch_binary(url, self.context_url.as_deref())
            .await
    }
}

// Stub for when the browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct BrowserSession;

#[cfg(not(feature = "browser"))]
impl BrowserSession {
    pub async fn launch(_config: BrowserSessionConfig) -> Result<Self> {
        Err(anyhow::anyhow!(
            "Browser support not compiled. Rebuild with: cargo build --features browser"
        ))
    }

    pub async fn cookies(&self) -> Result<Vec<SessionCookie>> {
        Err(anyhow::anyhow!("Browser support not compiled"))
    }

    pub async fn fetch_binary(
        &self,
        _url: &str,
        _context_url: Option<&str>,
    ) -> Result<FetchedPayload> {
        Err(anyhow::anyhow!("Browser support not compiled"))
    }

    pub async fn close(&mut self) {}
}
