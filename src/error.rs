use thiserror::Error;

use crate::types::SpaceId;

/// Failures reported to the host by session operations.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("session manager is not initialized")]
    NotInitialized,

    #[error("unknown space: {0}")]
    UnknownSpace(SpaceId),

    #[error("space {0} is closed")]
    Closed(SpaceId),

    #[error("operation is not well-formed JSON: {0}")]
    MalformedOperation(#[from] serde_json::Error),

    #[error("sync engine failure: {0:#}")]
    Engine(#[from] anyhow::Error),
}

pub type SpaceResult<T> = Result<T, SpaceError>;
