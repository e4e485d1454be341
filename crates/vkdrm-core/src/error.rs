#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("handle not tracked: {0}")]
    HandleNotFound(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
