use thiserror::Error;

/// Canonical relay error taxonomy.
///
/// Classification guidance:
/// - [`RelayError::QueryTerminated`]: a chunk or signal arrived for a query this node no
///   longer forwards; reported to the caller's response sender, never raised as a crash
/// - [`RelayError::Forwarding`]: the outbound results stream to a foreman failed
/// - [`RelayError::Transport`]: connecting to a foreman or issuing a unary call failed
/// - [`RelayError::InvalidRequest`]: caller contract violations (missing query id, ...)
/// - [`RelayError::InvalidState`]: a response sender was completed twice
/// - [`RelayError::InvalidConfig`]: configuration/environment problems
/// - [`RelayError::Io`]: raw IO failures from std APIs
#[derive(Debug, Error)]
pub enum RelayError {
    /// The query is no longer considered active by this node.
    #[error("query already terminated: {0}")]
    QueryTerminated(String),

    /// Forwarding results to the owning foreman failed.
    ///
    /// Examples:
    /// - the foreman reset the results stream
    /// - the outbound stream could not be opened
    /// - the results stream was torn down locally with an error cause
    #[error("failed to forward job results request to {foreman}: {message}")]
    Forwarding { foreman: String, message: String },

    /// Connection or unary call failure towards a foreman.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed input handed to the relay by its caller.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A one-shot completion handle was used after it already completed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard relay result alias.
pub type Result<T> = std::result::Result<T, RelayError>;
