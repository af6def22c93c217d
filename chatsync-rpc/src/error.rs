//! Errors produced by the transport layer.

/// Errors that can occur driving a call or subscription through [`crate::client::RpcTransport`].
///
/// Dev note: kept `Send + Sync + 'static` so it can cross task boundaries freely
/// (background task -> awaiting caller).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport's background task has gone away; the client was dropped.
    #[error("the rpc transport was dropped")]
    Dropped,
    /// The carrier connection was lost; a reconnect has been initiated automatically.
    /// In-flight calls on the old connection are failed with this error.
    #[error("connection lost ({0}); reconnect initiated")]
    DisconnectedWillReconnect(String),
    /// The server replied with an `rpcError` frame.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Server-defined error code.
        code: i32,
        /// Human-readable error message.
        message: String,
    },
    /// A per-call deadline elapsed before a correlated response arrived.
    #[error("rpc call timed out")]
    Timeout,
    /// A frame could not be decoded as JSON, or decoded to the wrong shape.
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),
    /// The underlying WebSocket carrier failed outside of a normal disconnect
    /// (e.g. handshake failure, TLS error).
    #[error("carrier error: {0}")]
    Carrier(String),
    /// `connectionInit` was never acknowledged with `connectionOpen` before the
    /// caller gave up waiting.
    #[error("connection did not open in time")]
    ConnectTimeout,
}
