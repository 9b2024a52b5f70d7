//! TenderHarvest: unattended, resumable extraction of tender listings from
//! browser-rendered procurement portals.

pub mod adapter;
pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod delta;
pub mod error;
pub mod identity;
pub mod observer;
pub mod orchestrator;
pub mod reclaim;
pub mod renderer;
pub mod state;
pub mod store;
pub mod types;
pub mod watchdog;

pub use adapter::{AdapterRegistry, ExtractionAdapter, ScriptAdapter};
pub use backup::{backup_sweep, BackupPolicy, BackupTier};
pub use checkpoint::{CheckpointManager, CheckpointState};
pub use config::{resolve_data_dir, HarvestConfig, TargetConfig};
pub use coordinator::{CoordinatorConfig, SessionCoordinator};
pub use delta::VerifyMode;
pub use error::{AdapterError, HarvestError, HarvestResult, PersistenceError, SessionError};
pub use identity::{canonicalize, classify, normalize_date, normalize_id, KnownSnapshot};
pub use observer::{LogLevel, RunObserver};
pub use orchestrator::Orchestrator;
pub use reclaim::{reclaim, ReclaimMode, ReclaimPolicy, ReclaimReport};
pub use renderer::{Launcher, RenderContext, Renderer};
pub use store::Store;
pub use types::*;
