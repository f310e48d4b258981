//! Shared control-plane environment.

use std::sync::Arc;

use mci_core::cloud::CloudRegistry;
use mci_core::settings::Settings;
use mci_core::storage::{MemStorage, Storage};

/// Immutable environment handed to every control-plane component at
/// startup: storage, cloud managers and settings. Cheap to clone.
#[derive(Clone)]
pub struct Env {
    /// Entity storage.
    pub storage: Arc<dyn Storage>,

    /// Configured cloud managers.
    pub cloud: CloudRegistry,

    /// Service settings.
    pub settings: Arc<Settings>,
}

impl Env {
    /// Build an environment over the given storage engine.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, cloud: CloudRegistry, settings: Settings) -> Self {
        Self {
            storage,
            cloud,
            settings: Arc::new(settings),
        }
    }

    /// Environment over in-memory storage with built-in providers, for
    /// tests and single-node runs.
    #[must_use]
    pub fn in_memory(settings: Settings) -> Self {
        Self::new(
            Arc::new(MemStorage::new()),
            CloudRegistry::new(),
            settings,
        )
    }
}
