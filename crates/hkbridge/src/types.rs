/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Invalid range: {0}")]
    Range(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Value error: {0}")]
    Value(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<crate::js::JsError> for Error {
    fn from(err: crate::js::JsError) -> Self {
        Error::Script(err.to_string())
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
