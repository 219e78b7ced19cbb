//! Application state management.

use crate::bridge::{CliModelSource, CommandInvoker, ModelCache, ModelSource, ProcessInvoker};
use crate::config::BridgeConfig;
use crate::mcp::SessionRegistry;
use std::sync::Arc;
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: BridgeConfig,
    /// Launches the external program
    invoker: Arc<dyn CommandInvoker>,
    /// Available models, refreshed on demand
    models: ModelCache,
    sessions: SessionRegistry,
}

impl AppState {
    /// Create state with explicit collaborators.
    pub fn new(
        config: BridgeConfig,
        invoker: Arc<dyn CommandInvoker>,
        models: Box<dyn ModelSource>,
    ) -> Self {
        let sessions = SessionRegistry::with_max_sessions(config.max_sessions);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                invoker,
                models: ModelCache::new(models),
                sessions,
            }),
        }
    }

    /// State that runs the configured target as a real subprocess.
    pub fn with_process_invoker(config: BridgeConfig) -> Self {
        let invoker: Arc<dyn CommandInvoker> = Arc::new(ProcessInvoker);
        let models = CliModelSource::new(invoker.clone(), config.target.clone());
        Self::new(config, invoker, Box::new(models))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn invoker(&self) -> &dyn CommandInvoker {
        self.inner.invoker.as_ref()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// The model to use for a run that names none.
    pub async fn default_model(&self) -> String {
        let config = &self.inner.config;
        self.inner
            .models
            .default_model(config.model_cache_ttl, &config.default_model)
            .await
    }

    /// Fill the model cache in the background.
    pub fn warm_model_cache(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let model = state.default_model().await;
            info!("Default model: {}", model);
        });
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::with_process_invoker(BridgeConfig::default())
    }
}
