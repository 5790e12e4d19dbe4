//! Browser Management Module
//!
//! Handles Chromium lifecycle, configuration, and hook-up of the interception
//! loop. One browser session is active at a time; starting a new one tears
//! down the old session after aborting its suspended exchanges.

use crate::error::{BrowserEngineError, EngineResult};
use crate::intercept;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use intercept_core::Coordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Browser launch options
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Run without a visible window. The operator usually drives the session
    /// by hand, so headed is the default.
    pub headless: bool,
    /// Chromium executable override; autodetected when unset.
    pub executable: Option<PathBuf>,
    /// Additional Chrome arguments
    pub extra_args: Vec<String>,
    /// Window size
    pub window_size: Option<(u32, u32)>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            executable: None,
            extra_args: Vec::new(),
            window_size: Some((1920, 1080)),
        }
    }
}

struct ManagedBrowser {
    browser: Browser,
    user_data_dir: PathBuf,
    handler_task: JoinHandle<()>,
    intercept_task: JoinHandle<()>,
}

impl ManagedBrowser {
    async fn close(mut self) {
        self.intercept_task.abort();
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        info!("Browser closed");

        if self.user_data_dir.exists() {
            info!("Cleaning up browser profile: {:?}", self.user_data_dir);
            if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
                warn!("Failed to remove browser profile dir: {:?}", e);
            }
        }
    }
}

/// Launches the instrumented browser and wires its traffic through the
/// interception coordinator.
pub struct BrowserDriver {
    coordinator: Arc<Coordinator>,
    options: BrowserOptions,
    active: RwLock<Option<ManagedBrowser>>,
}

impl BrowserDriver {
    pub fn new(coordinator: Arc<Coordinator>, options: BrowserOptions) -> Self {
        Self {
            coordinator,
            options,
            active: RwLock::new(None),
        }
    }

    /// Launch a browser session and navigate to `url`. Any previous session
    /// is stopped first.
    pub async fn start(&self, url: &str) -> EngineResult<()> {
        self.stop().await?;

        let mut config_builder = BrowserConfig::builder();

        // Unique profile dir to avoid SingletonLock errors between runs.
        let user_data_dir =
            std::env::temp_dir().join(format!("mirage_browser_{}", Uuid::new_v4()));
        config_builder = config_builder.user_data_dir(&user_data_dir);

        if !self.options.headless {
            config_builder = config_builder.with_head();
        }
        if let Some(exe) = &self.options.executable {
            config_builder = config_builder.chrome_executable(exe.clone());
        }
        if let Some((width, height)) = self.options.window_size {
            config_builder = config_builder.arg(format!("--window-size={},{}", width, height));
        }
        for arg in &self.options.extra_args {
            config_builder = config_builder.arg(arg);
        }

        // TLS trust is the browser's problem, not ours: certificate errors
        // are ignored so interception works on HTTPS origins.
        config_builder = config_builder
            .arg("--ignore-certificate-errors")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        let config = config_builder
            .build()
            .map_err(BrowserEngineError::BrowserLaunch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserEngineError::BrowserLaunch(format!("{}", e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser event error: {:?}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserEngineError::BrowserLaunch(format!("{}", e)))?;

        let intercept_task = intercept::spawn(page.clone(), self.coordinator.clone()).await?;

        info!(
            "Browser launched (headless: {}), navigating to {}",
            self.options.headless, url
        );
        if let Err(e) = page.goto(url).await {
            warn!("Navigation to {} failed: {}", url, e);
        }

        let mut guard = self.active.write().await;
        *guard = Some(ManagedBrowser {
            browser,
            user_data_dir,
            handler_task,
            intercept_task,
        });
        Ok(())
    }

    /// Stop the active session. Every suspended exchange is aborted and the
    /// operator is notified before the browser goes away.
    pub async fn stop(&self) -> EngineResult<()> {
        let mut guard = self.active.write().await;
        if let Some(managed) = guard.take() {
            self.coordinator.drop_all();
            managed.close().await;
        }
        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }
}
