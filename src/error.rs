use thiserror::Error;

use crate::types::{PageId, TransactionId};

pub type DbResult<T> = Result<T, DbError>;

/// All failures the engine distinguishes. Storage errors bubble up with
/// no in-layer retry; the transaction layer wraps lock outcomes.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    #[error("buffer pool full, no evictable frame")]
    BufferFull,

    #[error("page {0} not found")]
    PageNotFound(PageId),

    #[error("page {0} is pinned")]
    PagePinned(PageId),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("index on '{table}.{column}' already exists")]
    IndexExists { table: String, column: String },

    #[error("index on '{table}.{column}' not found")]
    IndexNotFound { table: String, column: String },

    #[error("record of {size} bytes exceeds page capacity of {capacity}")]
    RecordTooLarge { size: usize, capacity: usize },

    /// Reserved for unique-index enforcement.
    #[error("duplicate key '{0}'")]
    DuplicateKey(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    #[error("transaction {0} already ended")]
    TransactionAlreadyEnded(TransactionId),

    #[error("lock conflict on '{0}'")]
    LockConflict(String),

    #[error("lock wait timed out on '{0}'")]
    LockTimeout(String),

    #[error("deadlock detected, transaction {0} is the victim")]
    Deadlock(TransactionId),

    #[error("database '{0}' already exists")]
    DatabaseExists(String),

    #[error("database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DbError {
    pub fn corrupt(page_id: PageId, reason: impl Into<String>) -> Self {
        DbError::CorruptPage {
            page_id,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        DbError::InvalidArgument(reason.into())
    }
}
