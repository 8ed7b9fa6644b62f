use crate::message::ChannelId;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid watch root: {0}")]
    InvalidRoot(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, WatcherError>;
