use mercado_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Bind or accept failure on the listener.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
