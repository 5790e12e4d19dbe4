//! Mirage Operator Console
//!
//! Hosts the management HTTP surface, the `/ws` operator channel, the
//! project store and the glue between the traffic-mediation engine and the
//! browser driver.

use browser_engine::{BrowserDriver, BrowserOptions, ReplayExecutor};
use intercept_core::{Coordinator, CoordinatorConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod api;
pub mod project;
pub mod protocol;
pub mod router;

/// Error types for console operations
pub mod error;

pub use error::{ConsoleError, ConsoleResult};
pub use project::{Project, ProjectStore, ProjectSummary, RepeaterTab};
pub use router::ChannelRegistry;

/// Static startup configuration.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Directory holding the project JSON documents
    pub projects_dir: PathBuf,
    /// Chromium executable override
    pub browser_executable: Option<PathBuf>,
    /// Launch the browser without a visible window
    pub headless: bool,
    /// Degraded-mode grace period in seconds
    pub grace_secs: u64,
    /// Autosave debounce interval in seconds
    pub autosave_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8000,
            projects_dir: PathBuf::from("./projects"),
            browser_executable: None,
            headless: false,
            grace_secs: 5,
            autosave_secs: 3,
        }
    }
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub driver: Arc<BrowserDriver>,
    pub replay: Arc<ReplayExecutor>,
    pub store: ProjectStore,
    pub channels: Arc<ChannelRegistry>,
    /// The live project: capture log plus operator configuration.
    pub project: Arc<RwLock<Project>>,
    dirty: Arc<AtomicBool>,
}

impl AppState {
    /// Flag the live project for the next autosave tick.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

/// The console server.
pub struct Console {
    config: ConsoleConfig,
}

impl Console {
    pub fn new(config: ConsoleConfig) -> Self {
        Self { config }
    }

    /// Build the full application state without binding a listener.
    pub fn build_state(&self) -> AppState {
        let grace_period = Duration::from_secs(self.config.grace_secs.max(1));
        let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
            grace_period,
            max_suspension_age: grace_period * 4,
        }));
        coordinator.spawn_janitor();

        let driver = Arc::new(BrowserDriver::new(
            coordinator.clone(),
            BrowserOptions {
                headless: self.config.headless,
                executable: self.config.browser_executable.clone(),
                ..Default::default()
            },
        ));

        let state = AppState {
            coordinator: coordinator.clone(),
            driver,
            replay: Arc::new(ReplayExecutor::new()),
            store: ProjectStore::new(&self.config.projects_dir),
            channels: Arc::new(ChannelRegistry::new(coordinator)),
            project: Arc::new(RwLock::new(Project::new("untitled"))),
            dirty: Arc::new(AtomicBool::new(false)),
        };

        router::spawn_event_pump(state.clone());
        spawn_autosave(
            state.clone(),
            Duration::from_secs(self.config.autosave_secs.max(1)),
        );
        state
    }

    /// Bind the listener and serve until the process exits.
    pub async fn start(self) -> ConsoleResult<()> {
        let state = self.build_state();
        let app = api::router(state);

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Mirage console listening on http://{}", addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Debounced autosave: persists the live project when it changed since the
/// last tick. Failures are surfaced to the operator and retried; they never
/// touch in-memory state.
fn spawn_autosave(state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if !state.dirty.swap(false, Ordering::Relaxed) {
                continue;
            }
            let mut project = state.project.write().await;
            if let Err(e) = state.store.save(&mut project).await {
                warn!("Autosave failed: {}", e);
                state.dirty.store(true, Ordering::Relaxed);
                drop(project);
                state
                    .channels
                    .broadcast(protocol::Outbound::Notice {
                        message: format!("autosave failed: {}", e),
                    })
                    .await;
            }
        }
    })
}
