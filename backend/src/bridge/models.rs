//! Model discovery and default model selection.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::invoker::{CommandInvoker, CommandSpec};

/// Models preferred as the default, in order.
pub const PREFERRED_MODELS: &[&str] = &[
    "github-copilot/gpt-5.2-codex",
    "github-copilot/gpt-5.1-codex",
    "github-copilot/gpt-4o",
    "github-copilot/gpt-4.1",
];

/// Bound on one `models` listing call.
const LISTING_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the list of available models comes from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// Fetch the available models. An empty list means "unknown".
    async fn fetch(&self) -> Vec<String>;
}

/// Lists models by running `<target> models`.
pub struct CliModelSource {
    invoker: Arc<dyn CommandInvoker>,
    target: String,
}

impl CliModelSource {
    pub fn new(invoker: Arc<dyn CommandInvoker>, target: impl Into<String>) -> Self {
        Self {
            invoker,
            target: target.into(),
        }
    }
}

#[async_trait]
impl ModelSource for CliModelSource {
    async fn fetch(&self) -> Vec<String> {
        let spec = CommandSpec::new(&self.target, vec!["models".to_string()], LISTING_TIMEOUT);
        let mut running = match self.invoker.launch(spec) {
            Ok(running) => running,
            Err(e) => {
                warn!("Could not list models: {}", e);
                return Vec::new();
            }
        };

        let mut stdout = String::new();
        let mut stderr = Vec::new();
        let (read, _) = tokio::join!(
            running.stdout.read_to_string(&mut stdout),
            running.stderr.read_to_end(&mut stderr)
        );
        let termination = match running.completion.await {
            Ok(termination) => termination,
            Err(e) => {
                warn!("Model listing task failed: {}", e);
                return Vec::new();
            }
        };
        if let Err(e) = read {
            warn!("Failed to read model listing: {}", e);
            return Vec::new();
        }
        if termination.failed() {
            warn!(
                "Model listing exited with code {}",
                termination.exit_code()
            );
            return Vec::new();
        }
        parse_model_listing(&stdout)
    }
}

/// Parse the output of `models`: one model per line, first field only.
pub fn parse_model_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("Available"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Pick a default model from the available ones.
pub fn choose_default_model(models: &[String], fallback: &str) -> String {
    for preferred in PREFERRED_MODELS {
        if let Some(m) = models.iter().find(|m| m.as_str() == *preferred) {
            return m.clone();
        }
    }
    for preferred in PREFERRED_MODELS {
        if let Some(m) = models.iter().find(|m| m.contains(preferred)) {
            return m.clone();
        }
    }
    if let Some(m) = models.iter().find(|m| m.starts_with("github-copilot/")) {
        return m.clone();
    }
    models
        .first()
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

struct Cached {
    models: Vec<String>,
    fetched_at: Instant,
}

/// Time-bounded cache of the available model list.
pub struct ModelCache {
    source: Box<dyn ModelSource>,
    cached: RwLock<Option<Cached>>,
}

impl ModelCache {
    pub fn new(source: Box<dyn ModelSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    /// Return the cached list, refreshing it when older than `ttl`.
    ///
    /// Empty results are returned but not cached, so the next call retries.
    pub async fn get_or_refresh(&self, ttl: Duration) -> Vec<String> {
        {
            let cached = self.cached.read().await;
            if let Some(ref c) = *cached {
                if c.fetched_at.elapsed() < ttl {
                    return c.models.clone();
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(ref c) = *cached {
            if c.fetched_at.elapsed() < ttl {
                return c.models.clone();
            }
        }

        let models = self.source.fetch().await;
        if models.is_empty() {
            debug!("Model listing returned nothing, not caching");
        } else {
            info!("Cached {} available models", models.len());
            *cached = Some(Cached {
                models: models.clone(),
                fetched_at: Instant::now(),
            });
        }
        models
    }

    /// The model to use when a run request names none.
    pub async fn default_model(&self, ttl: Duration, fallback: &str) -> String {
        let models = self.get_or_refresh(ttl).await;
        choose_default_model(&models, fallback)
    }
}
