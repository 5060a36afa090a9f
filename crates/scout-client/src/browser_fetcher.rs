use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::{Browser, BrowserConfig, Page};
use chrono::Utc;
use futures::StreamExt;
use scout_core::detect::script_required;
use scout_core::error::{AppError, FetchError};
use scout_core::models::{Content, TransportKind};
use scout_core::traits::Transport;

/// Headless-browser transport using Chromium via the Chrome DevTools Protocol.
///
/// Renders JavaScript before returning the HTML, for portfolio pages built
/// as SPAs and for origins that serve a challenge page to plain clients.
///
/// A single Chromium process is shared across all clones of this struct;
/// each fetch opens a new tab, grabs the rendered HTML, and closes the tab.
#[derive(Clone)]
pub struct BrowserTransport {
    browser: Arc<Browser>,
}

impl BrowserTransport {
    /// Launches a headless Chromium browser.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$CHROME_BIN`,
    /// `$PATH`, or one of the well-known install locations.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags, so prefer the real binary when it can be found.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .arg("--window-size=1920,1080")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }

    fn find_chrome_binary() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        [
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
    }

    /// Opens a blank tab, then navigates, waits for `<body>` and reads the
    /// HTML within `timeout`. The tab is closed on every exit path.
    async fn render(&self, url: &str, timeout: Duration) -> Result<(String, String), FetchError> {
        let page = tokio::time::timeout(timeout, self.browser.new_page("about:blank"))
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
            .map_err(|e| FetchError::Network(format!("Failed to open browser tab: {e}")))?;
        let tab = TabGuard(Some(page.clone()));

        let rendered = tokio::time::timeout(timeout, Self::load(&page, url))
            .await
            .unwrap_or(Err(FetchError::Timeout(timeout)));

        tab.close().await;
        rendered
    }

    async fn load(page: &Page, url: &str) -> Result<(String, String), FetchError> {
        page.goto(url)
            .await
            .map_err(|e| FetchError::Network(format!("Failed to navigate to {url}: {e}")))?;
        // <body> present is the minimal signal of a render.
        page.find_element("body")
            .await
            .map_err(|e| FetchError::Network(format!("Page did not render body: {e}")))?;
        let html = page
            .content()
            .await
            .map_err(|e| FetchError::Network(format!("Failed to read page content: {e}")))?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        Ok((html, final_url))
    }
}

/// Closes its tab when dropped, so a fetch abandoned by a timeout or
/// cancellation does not leave the tab open in the shared browser.
struct TabGuard(Option<Page>);

impl TabGuard {
    async fn close(mut self) {
        if let Some(page) = self.0.take()
            && let Err(e) = page.close().await
        {
            tracing::debug!(error = %e, "Failed to close browser tab");
        }
    }
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        if let Some(page) = self.0.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

impl Transport for BrowserTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Browser
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Content, FetchError> {
        let started = Instant::now();

        let (body, final_url) = self.render(url, timeout).await?;

        if let Some(reason) = script_required(200, &body) {
            return Err(FetchError::ScriptRequired(format!(
                "{reason} after browser render"
            )));
        }

        Ok(Content {
            url: url.to_string(),
            final_url,
            body,
            status: 200,
            transport: TransportKind::Browser,
            fetched_at: Utc::now(),
            latency: started.elapsed(),
        })
    }
}
