#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("publisher pool exhausted")]
    PoolExhausted,

    #[error("failed to decode outbox event: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] dwop_store::StoreError),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Decode(err.to_string())
    }
}
