use basket_core::KeyError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid basket key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("invalid title: {0}")]
    InvalidTitle(String),

    /// Also returned when the row exists but belongs to another basket.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidTitle(_) => "invalid_title",
            Self::NotFound(_) => "not_found",
            Self::Database(_) | Self::Io(_) => "transient_io",
            Self::CorruptRow { .. } => "corrupt_row",
            Self::Closed => "closed",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
