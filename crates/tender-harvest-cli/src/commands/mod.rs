//! Subcommand implementations for the `tender-harvest` binary.

pub mod backup;
pub mod checkpoint;
pub mod reclaim;
pub mod run;
pub mod runs;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use tender_harvest::checkpoint::CheckpointManager;
use tender_harvest::config::{resolve_data_dir, HarvestConfig};
use tender_harvest::store::Store;

/// Resolved configuration every command starts from.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: HarvestConfig,
}

impl Context {
    /// Environment defaults, with `data_dir` taking precedence when given.
    pub fn resolve(data_dir: Option<&Path>) -> Self {
        let config = HarvestConfig::from_env();
        let config = match data_dir {
            Some(dir) => config.with_data_dir(resolve_data_dir(Some(dir))),
            None => config,
        };
        Self { config }
    }

    pub fn from_config(config: HarvestConfig) -> Self {
        Self { config }
    }

    pub fn open_store(&self) -> Result<Arc<Store>> {
        let path = self.config.db_path();
        let store = Store::open(&path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        Ok(Arc::new(store))
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(self.config.checkpoint_dir())
    }
}
