#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid dispatch parameters: {0}")]
    InvalidParams(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
