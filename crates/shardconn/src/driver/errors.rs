#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("unsupported type '{ty}' for column '{column}'")]
    UnsupportedType { column: String, ty: String },

    #[error("transaction handle already finished")]
    TransactionFinished,

    #[error("{0}")]
    Injected(String),
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;
