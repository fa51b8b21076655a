use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowsentryError {
    #[error("malformed flow record: {0}")]
    MalformedRecord(#[from] serde_json::Error),

    #[error("engine channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, FlowsentryError>;
