/// Storage-specific errors
use thiserror::Error;

/// Result type alias using `StorageError`
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored value does not fit the record type
    #[error("Invalid stored value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: i64 },

    /// Database error from `SQLx`
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

impl From<StorageError> for hesi_core::HesiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => hesi_core::HesiError::not_found(entity, id),
            other => hesi_core::HesiError::storage(other.to_string()),
        }
    }
}
