pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    /// A capture session is already active in this process.
    #[error("cannot start capture when already started")]
    AlreadyStarted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }
}
