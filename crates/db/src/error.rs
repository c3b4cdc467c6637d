use genbatch_core::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {0} is not in progress")]
    NotClaimed(Uuid),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl DbError {
    /// Connection-level failures that a later retry may not hit.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlx(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => {
                    let message = db.message();
                    message.contains("database is locked") || message.contains("busy")
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            return StoreError::Unavailable(err.to_string());
        }
        match err {
            DbError::TaskNotFound(id) => StoreError::TaskNotFound(id),
            DbError::NotClaimed(id) => StoreError::NotClaimed(id),
            DbError::InvalidRecord(msg) => StoreError::InvalidRecord(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
