//! Project Store
//!
//! Named projects persisted as a flat directory of JSON documents. Unknown
//! fields in a document survive a load/save round-trip, so newer clients can
//! stash state without this process understanding it.

use crate::error::{ConsoleError, ConsoleResult};
use intercept_core::{
    Exchange, ExchangeState, ExclusionRule, RequestCapture, ResponseCapture, ResponseRecord,
    RewriteRule,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn default_target_url() -> String {
    "https://example.com".to_string()
}

/// Operator-owned named buffer holding raw request text and the last
/// response text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeaterTab {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub response: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A full project document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub created: String,
    #[serde(rename = "lastModified", default)]
    pub last_modified: String,
    #[serde(rename = "targetUrl", default = "default_target_url")]
    pub target_url: String,
    #[serde(default)]
    pub requests: Vec<Exchange>,
    #[serde(rename = "exclusionRules", default)]
    pub exclusion_rules: Vec<ExclusionRule>,
    #[serde(rename = "historyFilter", default)]
    pub history_filter: String,
    #[serde(rename = "hideStatic", default)]
    pub hide_static: bool,
    #[serde(rename = "repeaterTabs", default)]
    pub repeater_tabs: Vec<RepeaterTab>,
    #[serde(rename = "matchReplaceRules", default)]
    pub match_replace_rules: Vec<RewriteRule>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            name: name.into(),
            created: now.clone(),
            last_modified: now,
            target_url: default_target_url(),
            requests: Vec::new(),
            exclusion_rules: Vec::new(),
            history_filter: String::new(),
            hide_static: false,
            repeater_tabs: Vec::new(),
            match_replace_rules: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Append a visible request capture to the history.
    pub fn push_request(&mut self, capture: &RequestCapture) {
        self.requests.push(Exchange {
            id: capture.id.clone(),
            seq: capture.seq,
            method: capture.method.clone(),
            url: capture.url.clone(),
            headers: capture.headers.clone(),
            body: capture.body.clone(),
            resource_type: capture.resource_type.clone(),
            timestamp: capture.timestamp,
            response: None,
            state: ExchangeState::InFlight,
            dropped: false,
            intercept_response: false,
        });
    }

    /// Attach a response capture to its originating exchange by `req_id`.
    pub fn attach_response(&mut self, capture: &ResponseCapture) {
        if let Some(exchange) = self
            .requests
            .iter_mut()
            .rev()
            .find(|e| e.id == capture.req_id)
        {
            exchange.response = Some(ResponseRecord {
                status: capture.status,
                headers: capture.headers.clone(),
                body: capture.body.clone(),
                error: capture.error.clone(),
            });
            exchange.state = ExchangeState::Completed;
        }
    }

    /// Mark an exchange dropped, keeping its seq in the history.
    pub fn mark_dropped(&mut self, id: &str) {
        if let Some(exchange) = self.requests.iter_mut().rev().find(|e| e.id == id) {
            exchange.dropped = true;
            exchange.state = ExchangeState::Dropped;
        }
    }

    /// Retroactively purge history entries matching the given exclusion
    /// rules. Returns the number of removed exchanges.
    pub fn purge_excluded(&mut self, rules: &[ExclusionRule]) -> usize {
        let before = self.requests.len();
        self.requests
            .retain(|exchange| !intercept_core::is_excluded(&exchange.url, rules));
        before - self.requests.len()
    }
}

/// Summary row for the project list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub name: String,
    pub created: String,
    #[serde(rename = "lastModified")]
    pub last_modified: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    #[serde(rename = "requestCount")]
    pub request_count: usize,
}

/// Flat-directory JSON store, one document per project.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_root(&self) -> ConsoleResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// File path for a project, with the name sanitised for the filesystem.
    fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
            .collect();
        self.root.join(format!("{}.json", safe.trim()))
    }

    /// List saved projects, most recently modified first.
    pub async fn list(&self) -> ConsoleResult<Vec<ProjectSummary>> {
        self.ensure_root().await?;
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_document(&path).await {
                Ok(project) => summaries.push(ProjectSummary {
                    name: project.name,
                    created: project.created,
                    last_modified: project.last_modified,
                    target_url: project.target_url,
                    request_count: project.requests.len(),
                }),
                Err(e) => warn!("Skipping unreadable project {:?}: {}", path, e),
            }
        }
        summaries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(summaries)
    }

    /// Create and persist a fresh project.
    pub async fn create(&self, name: &str) -> ConsoleResult<Project> {
        let mut project = Project::new(name);
        self.save(&mut project).await?;
        info!("Created project '{}'", name);
        Ok(project)
    }

    /// Load a project by name; `None` when it does not exist.
    pub async fn load(&self, name: &str) -> ConsoleResult<Option<Project>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_document(&path).await?))
    }

    /// Persist a project, bumping `lastModified`.
    pub async fn save(&self, project: &mut Project) -> ConsoleResult<()> {
        self.ensure_root().await?;
        project.last_modified = chrono::Utc::now().to_rfc3339();
        let json = serde_json::to_string_pretty(project)?;
        tokio::fs::write(self.path_for(&project.name), json).await?;
        Ok(())
    }

    /// Delete a project document. Returns whether one existed.
    pub async fn delete(&self, name: &str) -> ConsoleResult<bool> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        info!("Deleted project '{}'", name);
        Ok(true)
    }

    async fn read_document(&self, path: &Path) -> ConsoleResult<Project> {
        let bytes = tokio::fs::read(path).await?;
        let project = serde_json::from_slice(&bytes)?;
        Ok(project)
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(e: serde_json::Error) -> Self {
        ConsoleError::Persistence(e.to_string())
    }
}
