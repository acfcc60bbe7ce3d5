use thiserror::Error;

/// Failure of a single framed transfer on a stream.
///
/// Every variant is fatal to the connection it happened on. Retrying is left
/// to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport timeout")]
    Timeout,

    #[error("socket maybe closed")]
    Closed,

    #[error("invalid packet: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => TransportError::Closed,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// Errors surfaced by the RPC client and server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Call-level error reported in-band by the remote handler (positive code).
    #[error("call error({code}): {message}")]
    Call { code: i32, message: String },

    /// Protocol-level rejection from the remote side (negative code).
    #[error("protocol error({code}): {message}")]
    Protocol { code: i32, message: String },

    #[error("{0}")]
    Async(String),

    #[error("wait for rpc result timeout")]
    CsuTimeout,

    #[error("codec error: {0}")]
    Codec(String),
}

/// Orchestration errors used across the control plane.
#[derive(Error, Debug)]
pub enum PghaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Cluster({0}) not found")]
    ClusterNotFound(u32),

    #[error("Node({0}) not found")]
    NodeNotFound(u32),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Isolated(String),

    #[error("Fencing command is not configured for database({0})")]
    FencingNotConfigured(u32),

    #[error("Node control '{op}' failed({code}): {message}")]
    NodeControl {
        op: String,
        code: i32,
        message: String,
    },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Load balancer error: {0}")]
    LoadBalancer(String),

    #[error("Election error: {0}")]
    Election(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransportError> for PghaError {
    fn from(e: TransportError) -> Self {
        PghaError::Rpc(RpcError::Transport(e))
    }
}

pub type Result<T> = std::result::Result<T, PghaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_closed() {
        let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(TransportError::from(e), TransportError::Closed);
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(TransportError::from(e), TransportError::Timeout);
    }

    #[test]
    fn test_transport_error_lifts_into_pgha_error() {
        let err: PghaError = TransportError::Closed.into();
        assert!(matches!(err, PghaError::Rpc(RpcError::Transport(_))));
    }
}
