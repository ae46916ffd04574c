use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}
