use thiserror::Error;

/// All errors produced by livecap-core.
#[derive(Debug, Error)]
pub enum LivecapError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("a session is already running")]
    AlreadyRunning,

    #[error("no session is running")]
    NotRunning,

    #[error("room resolution failed: {0}")]
    ResolveFailed(String),

    #[error("media transcoder failed to open: {0}")]
    MediaOpenFailed(String),

    #[error("media stream lost: {0}")]
    MediaStreamLost(String),

    #[error("recognizer error: {0}")]
    RecognizerFailed(String),

    #[error("chat channel error: {0}")]
    ChatChannel(String),

    #[error("subscriber limit reached ({0})")]
    SubscriberLimit(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LivecapError>;
