/// Errors surfaced by the local inventory store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying database failure from SeaORM.
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// A JSON column could not be encoded or decoded.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row carried a status string outside the lifecycle vocabulary.
    #[error("unknown {field} value in row {id}: {value}")]
    UnknownStatus {
        field: &'static str,
        id: String,
        value: String,
    },

    /// Lookup by key found nothing where a row was required.
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;
