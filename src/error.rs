use thiserror::Error;

/// Errors surfaced by coordinator components.
///
/// Config and startup errors are fatal; everything else is something the
/// batch loop can decide to retry on (see `BatchState::retry_batch`).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("postgres pool error: {0}")]
    Pool(String),

    #[error("cassandra error: {0}")]
    Cassandra(String),

    #[error("worker dispatch error: {0}")]
    Dispatch(String),

    #[error("chain selection error: {0}")]
    ChainSelection(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
