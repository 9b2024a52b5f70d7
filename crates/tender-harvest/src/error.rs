//! Error taxonomy for the extraction core.
//!
//! Unit- and record-level failures ([`AdapterError`], rejected rows) are
//! absorbed by the orchestrator and only show up in counters and logs.
//! Session- and store-level failures ([`SessionError`], [`PersistenceError`])
//! escalate to a run in status `error` once bounded retries are exhausted.

/// Failure reported by an extraction adapter for a single unit.
#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Dead end: {0}")]
    DeadEnd(String),

    #[error("Malformed rows: {0}")]
    Malformed(String),

    #[error("Render error: {0}")]
    Render(#[from] anyhow::Error),
}

/// Failure of the shared rendering session or one of its view contexts.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Failed to launch rendering session: {0}")]
    Launch(String),

    #[error("Failed to create view context: {0}")]
    ContextCreation(String),

    #[error("Interaction on worker {worker} timed out after {timeout_ms}ms")]
    InteractionTimeout { worker: usize, timeout_ms: u64 },

    #[error("Worker {worker} stalled: silent for {silent_ms}ms")]
    Stalled { worker: usize, silent_ms: u64 },

    #[error("View context of worker {worker} is unresponsive: {reason}")]
    ContextUnresponsive { worker: usize, reason: String },

    #[error("Worker index {0} is outside the pool")]
    UnknownWorker(usize),

    #[error("Rendering session lost after {attempts} re-acquisition attempt(s): {reason}")]
    SessionLost { attempts: u32, reason: String },

    #[error("Cancelled while waiting for the session")]
    Cancelled,
}

impl SessionError {
    /// Outcomes that call for a fresh view and a re-queued unit rather than
    /// a failed one.
    pub fn is_stall(&self) -> bool {
        matches!(
            self,
            Self::InteractionTimeout { .. } | Self::Stalled { .. } | Self::ContextUnresponsive { .. }
        )
    }
}

/// Storage-boundary failure.
#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Errors surfaced by the public API of the crate.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Checkpoint corrupt for {target}: {reason}")]
    CheckpointCorruption { target: String, reason: String },

    #[error("Stale run detected: run {run_id} for {target}")]
    StaleRunDetected { run_id: i64, target: String },

    #[error("Unknown layout family: {0}")]
    UnknownLayout(String),

    #[error("Target already running in this process: {0}")]
    TargetBusy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for HarvestError {
    fn from(e: rusqlite::Error) -> Self {
        HarvestError::Persistence(PersistenceError::Sqlite(e))
    }
}

/// Convenience result type.
pub type HarvestResult<T> = Result<T, HarvestError>;
