//! The primary error type for the client core.

use std::sync::Arc;
use thiserror::Error;

/// All failures that can surface from cluster membership, routing, pooling,
/// or scan execution.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("cluster has no known nodes")]
    ClusterEmpty,

    #[error("transient error, node should accrue a health penalty")]
    Transient,

    #[error("operation timed out")]
    Timeout,

    #[error("server returned error code {0}")]
    ServerError(i64),

    #[error("malformed frame: {0}")]
    ParseError(String),

    /// A node has no endpoints left to connect through. Dunned at the point
    /// of detection in `tender::tend_node_inner`; carried as a distinct kind
    /// so the health timer's outer match doesn't apply a second dun weight
    /// on top of the one already applied at the source.
    #[error("node has no endpoints")]
    NoEndpoint,

    /// An Info probe's `node` value didn't match the node's stored name.
    /// Dunned at the point of detection alongside `NoEndpoint`, for the same
    /// reason: kept distinct from `ParseError` so it isn't dunned twice.
    #[error("node reported unexpected name: {0}")]
    BadName(String),

    /// Returned internally by a user scan callback asking to stop; this is
    /// never surfaced to a public API return value — see `scan::executor`.
    #[error("client requested abort")]
    ClientAbort,

    /// Returned by a node's own stream parser when it polls the shared scan
    /// latch and finds it already tripped — by a sibling node's failure or
    /// by this or another node's `ClientAbort`. Distinct from `ClientAbort`
    /// itself, which is the latch's original trip reason.
    #[error("scan aborted cooperatively")]
    ScanAborted,
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<std::net::AddrParseError> for ClientError {
    fn from(e: std::net::AddrParseError) -> Self {
        ClientError::InvalidParameter(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// The connection pool's narrower error taxonomy, kept as
/// distinct discriminants for parity with the original client's negative
/// error codes (`-1`/`-2`/`-3`); callers should match on variant, not value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum PoolError {
    #[error("stale connection, retry")]
    StaleRetry = -1,
    #[error("transient pool error")]
    Transient = -2,
    #[error("node has no usable endpoints")]
    Fatal = -3,
}

impl From<PoolError> for ClientError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::StaleRetry => ClientError::Transient,
            PoolError::Transient => ClientError::Transient,
            PoolError::Fatal => ClientError::InvalidParameter("no usable endpoints".into()),
        }
    }
}
