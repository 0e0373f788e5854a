use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),

    #[error("failed to open channel: {0}")]
    ChannelFailed(String),

    #[error("failed to declare queue {queue}: {source}")]
    QueueDeclarationFailed { queue: String, source: lapin::Error },

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
