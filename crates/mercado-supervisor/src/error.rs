use mercado_server::ServerError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown mode '{0}' (expected fork or cluster)")]
    InvalidMode(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] ServerError),
}
