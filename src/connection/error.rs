//! Client-side connection and reconnect errors.

/// Errors surfaced by the reconnect engine.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Lost or unreachable transport; retried when reconnect is enabled.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The broker refused for capacity reasons and policy says surface it.
    #[error("target capacity exceeded: {0}")]
    TargetCapacityExceeded(String),

    /// Non-transport session failure.
    #[error("session error: {0}")]
    Session(String),

    /// Unrecognized configuration key or unusable value.
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Failure modes of creating a session on an established transport.
#[derive(Debug, thiserror::Error)]
pub enum NewSessionError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("session error: {0}")]
    Session(String),
}
