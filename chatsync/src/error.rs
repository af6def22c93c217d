//! Crate-wide error taxonomy.
//!
//! The sync engine itself never returns `Result` across its public surface
//! for protocol-level conditions (gaps, non-progress, fetch-too-long) — those
//! are logged and recorded in `SyncStats` instead, per the propagation
//! policy. `Error` and friends below are for the parts of the surface that
//! genuinely do fail: the SDK's typed RPC calls, and the durable stores.

use chatsync_rpc::Error as RpcError;

/// Top-level error returned by [`crate::sdk_client::SdkClient`]'s fallible operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A call to the underlying transport failed (disconnect, timeout, server error).
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// A durable store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A secret-store operation surfaced a hard error (not a `Locked`/`NotFound` outcome).
    #[error(transparent)]
    Secret(#[from] SecretError),
    /// A typed RPC call's input failed validation before any wire I/O was attempted.
    #[error("invalid request: {0}")]
    Validation(String),
    /// A typed RPC call's output didn't match the method's declared result variant.
    #[error("unexpected result variant for {method}: expected {expected}, got {got}")]
    VariantMismatch {
        /// The method that was called.
        method: &'static str,
        /// The variant tag the method's result table declares.
        expected: &'static str,
        /// The variant tag actually present on the wire.
        got: String,
    },
    /// `connect(signal)` was aborted before the transport reached `connectionOpen`.
    #[error("connect aborted")]
    Aborted,
}

/// Errors from [`crate::bucket_store::BucketStore`] and [`crate::sdk_client`]'s state persistence.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The embedded database failed an I/O or internal operation.
    #[error("store I/O error: {0}")]
    Sled(#[from] sled::Error),
    /// A stored value failed to (de)serialize.
    #[error("store (de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The inner error code carried by [`crate::secret_store::SecretOutcome::Error`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("secret store error: {0}")]
pub struct SecretError(pub String);
