//! Subcommand implementations.

pub mod admin;
pub mod host;
pub mod project;
pub mod service;

use std::sync::Arc;

use mci_core::cloud::CloudRegistry;
use mci_core::settings::Settings;
use mci_core::storage::MemStorage;
use mci_server::Env;

/// Build the control-plane environment for a command.
pub fn build_env(settings: Settings) -> Env {
    Env::new(Arc::new(MemStorage::new()), CloudRegistry::new(), settings)
}
