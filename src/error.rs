use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Storage could not be reached or the statement failed.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: connection lock poisoned")]
    LockPoisoned,
    #[error("store unavailable: blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// A migration step could not complete; startup must not continue.
    #[error("schema migration '{step}' failed: {source}")]
    SchemaMismatch {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("setting '{key}' for guild {guild_id} is corrupt: {reason}")]
    CorruptValue {
        guild_id: u64,
        key: String,
        reason: String,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn is_fatal_at_boot(&self) -> bool {
        matches!(self, StoreError::SchemaMismatch { .. })
    }
}
