use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bridge returned an unreadable line: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("bridge process error: {0}")]
    Process(String),

    #[error("environment variable '{0}' is not set")]
    MissingToken(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
