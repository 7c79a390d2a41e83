use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{failed} of {total} URL(s) could not be fetched")]
    FetchFailed { failed: usize, total: usize },

    #[error("Transfer error: {0}")]
    Transfer(#[from] pixcache_engine::TransferError),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),
}
