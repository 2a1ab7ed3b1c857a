use thiserror::Error;

/// Metadata and notification store errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory found (tried {tried})")]
    MigrationDirNotFound { tried: String },

    /// A record with the same unique name already exists.
    #[error("server record already exists: {0}")]
    Duplicate(String),

    /// A stored value could not be mapped back to its domain type.
    #[error("invalid stored value: {0}")]
    Decode(String),
}

impl DbError {
    /// Classify a query error, surfacing unique violations as [`DbError::Duplicate`].
    pub(crate) fn from_insert(err: sqlx::Error, name: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(name.to_string())
            }
            _ => Self::Query(err),
        }
    }
}
