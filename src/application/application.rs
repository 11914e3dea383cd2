// Core application state and startup wiring.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::warn;

use crate::registry::Registry;

use super::{config::configuration::Configuration, logging::tracing::tracing_subscribe};

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

/// Process-wide state: the configuration plus the registry of open indexes.
/// Constructed once at startup and threaded into whatever hosts the UI.
pub struct Application {
    pub config: Arc<Configuration>,
    pub registry: Registry,
}

impl Application {
    /// Build the application and re-open every index listed in the registry
    /// file.
    pub async fn initialize(config: Configuration) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let registry = Registry::new(Arc::clone(&config));
        registry.load().await?;
        Ok(Self { config, registry })
    }

    pub fn install_logging(config: &Configuration) {
        if let Some(true) = LOGGER_INSTALLED.get() {
            return;
        }

        if !tracing_subscribe(config) {
            warn!("failed to install tracing subscriber, there's probably one already");
        }

        let _ = LOGGER_INSTALLED.set(true);
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
