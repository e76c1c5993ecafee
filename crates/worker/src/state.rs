use std::sync::Arc;

use abd_core::{Config, Maintenance, MessageBus, TaskStore};

/// Shared application state
pub struct AppState {
    config: Config,
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    maintenance: Maintenance,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn TaskStore>, bus: Arc<dyn MessageBus>) -> Self {
        let maintenance = Maintenance::new(Arc::clone(&store), Arc::clone(&bus))
            .with_cleanup(config.downloader.cleanup.clone());
        Self {
            config,
            store,
            bus,
            maintenance,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn TaskStore {
        self.store.as_ref()
    }

    pub fn bus(&self) -> &dyn MessageBus {
        self.bus.as_ref()
    }

    pub fn maintenance(&self) -> &Maintenance {
        &self.maintenance
    }
}
