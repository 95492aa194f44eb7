use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Row codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Duplicate key '{key}' in table {table}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("Row '{key}' not found in table {table}")]
    NotFound { table: &'static str, key: String },
    #[error("Transaction aborted on table {0}")]
    Aborted(&'static str),
}

impl StorageError {
    pub(crate) fn from_transaction(
        table: &'static str,
        error: sled::transaction::TransactionError<()>,
    ) -> Self {
        match error {
            sled::transaction::TransactionError::Storage(e) => StorageError::Database(e),
            sled::transaction::TransactionError::Abort(()) => StorageError::Aborted(table),
        }
    }
}
