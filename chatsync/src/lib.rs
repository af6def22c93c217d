#![warn(missing_docs)]
#![deny(unused_extern_crates)]
//! Client-side realtime chat sync: ordered update delivery, gap-catch-up
//! over a reconnecting transport, and a typed SDK facade, built on top of
//! [`chatsync_rpc`].

mod apply;
mod bucket_engine;
mod bucket_store;
mod config;
mod error;
mod fetch_limiter;
mod sdk_client;
mod secret_store;
mod session_store;
mod sync_engine;

pub use apply::{ApplySource, ApplyUpdates, RecordingSink};
pub use bucket_store::{BucketCursor, BucketStore, GlobalSyncState};
pub use config::{SyncConfig, SyncConfigBuilder};
pub use error::{Error, SecretError, StoreError};
pub use fetch_limiter::{FetchLimiter, FetchPermit};
pub use sdk_client::{
    ExportState, FileStateStore, GetChatInput, GetChatOutput, GetMeOutput, GetMessagesInput,
    GetMessagesOutput, InMemoryStateStore, InboundEvent, SdkClient, SendMessageInput,
    SendMessageOutput, SendTypingInput, StateStore, Target,
};
pub use secret_store::{Credentials, DatabaseKey, FailingSecretStore, FileSecretStore, SecretOutcome, SecretStore};
pub use session_store::{Event, SessionStatus, SessionStore, Snapshot};
pub use sync_engine::{SyncEngine, SyncStats, SyncStatsSnapshot};

pub use chatsync_rpc::wire::{
    BucketKey, ClientFrame, GetUpdatesInput, GetUpdatesOutput, GetUpdatesResultType,
    GetUpdatesStateInput, GetUpdatesStateOutput, Peer, ServerFrame, Update, UpdateKind,
};
pub use chatsync_rpc::{RpcTransport, TransportConfig};
