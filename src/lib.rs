use std::sync::Arc;

pub mod aggregate;
pub mod auth;
pub mod certs;
pub mod config;
pub mod errors;
pub mod inventory;
pub mod logging;
pub mod provision;
pub mod render;
pub mod resources;
pub mod system;

use config::{Config, InventorySource};
use errors::ProvisionError;
use inventory::{FileInventory, HttpInventory, InventorySearch};
use provision::Provisioner;
use system::{HostSystem, SystemManager};

/// Wires the configured inventory backend and the local host into a provisioner.
pub fn build_provisioner(config: Config) -> Result<Provisioner, ProvisionError> {
    let search: Arc<dyn InventorySearch> = match &config.inventory {
        InventorySource::Http { url, token } => Arc::new(HttpInventory::new(url, token.clone())),
        InventorySource::File(path) => Arc::new(FileInventory::load(path)?),
    };
    let system: Arc<dyn SystemManager> = Arc::new(HostSystem::new(config.package_manager));

    Provisioner::new(config, search, system)
}
