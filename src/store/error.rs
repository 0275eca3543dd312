use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },

    #[error("{field} = {value} does not fit the column type")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::CorruptRow { .. } => "CORRUPT_ROW",
            StoreError::OutOfRange { .. } => "VALUE_OUT_OF_RANGE",
            StoreError::Unavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}
