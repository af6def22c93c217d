//! The framed wire protocol exchanged with the server, and the sync domain
//! types (`Peer`, `BucketKey`, `Update`) whose shape the protocol carries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A peer a chat bucket is keyed on: either a group/channel chat, or a 1:1
/// conversation addressed by the other user's id.
///
/// Adjacently tagged (`kind` + `value`) rather than internally tagged: serde
/// can't fold a newtype variant's scalar payload into the same map as an
/// internal tag, only struct-shaped content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Peer {
    /// A group chat or channel.
    Chat(i64),
    /// A 1:1 conversation, addressed by the other participant's user id.
    User(i64),
}

/// The ordering domain a sequenced update belongs to. Every bucket has its
/// own monotonic `seq` space, tracked independently by a `BucketEngine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum BucketKey {
    /// Per-chat ordering domain, identified by the chat's peer.
    Chat(Peer),
    /// Per-space (workspace/server) ordering domain.
    Space(i64),
    /// The single per-user ordering domain (settings, dialog flags, space joins).
    User,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::Chat(Peer::Chat(id)) => write!(f, "chat:{id}"),
            BucketKey::Chat(Peer::User(id)) => write!(f, "dm:{id}"),
            BucketKey::Space(id) => write!(f, "space:{id}"),
            BucketKey::User => write!(f, "user"),
        }
    }
}

/// The full set of update variants the server may push. Sequenced variants
/// (everything but the two `*HasNewUpdates` signals) carry data sufficient to
/// resolve a [`BucketKey`] via [`UpdateKind::bucket_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "camelCase")]
pub enum UpdateKind {
    NewMessage { peer: Peer, message_id: i64 },
    EditMessage { peer: Peer, message_id: i64 },
    DeleteMessages { peer: Peer, message_ids: Vec<i64> },
    MessageAttachment { peer: Peer, message_id: i64 },
    UpdateReaction { peer: Peer, message_id: i64 },
    DeleteReaction { peer: Peer, message_id: i64 },
    DeleteChat { peer: Peer },
    MarkAsUnread { peer: Peer },
    UpdateReadMaxId { peer: Peer, max_id: i64 },
    SpaceMemberAdd { space_id: i64 },
    SpaceMemberDelete { space_id: i64 },
    SpaceMemberUpdate { space_id: i64 },
    ParticipantAdd { peer: Peer },
    ParticipantDelete { peer: Peer },
    ChatVisibility { peer: Peer },
    ChatInfo { peer: Peer },
    PinnedMessages { peer: Peer },
    NewChat { peer: Peer },
    JoinSpace { space_id: i64 },
    UpdateUserStatus,
    UpdateUserSettings,
    DialogArchived { peer: Peer },
    DialogNotificationSettings { peer: Peer },
    /// Signal: the server has updates for a chat beyond `update_seq ≤` what was applied.
    ChatHasNewUpdates { peer: Peer, update_seq: i64 },
    /// Signal: as above, for a space.
    SpaceHasNewUpdates { space_id: i64, update_seq: i64 },
    /// Forward-compatibility catch-all for wire variants this build doesn't know about.
    /// Always routed as a direct (unsequenced, no-op) update.
    #[serde(other)]
    Unknown,
}

impl UpdateKind {
    /// Classify this update kind into the bucket that owns its ordering, per
    /// the routing table: chat-scoped message/participant/reaction updates to
    /// `Chat`, space-membership to `Space`, user-settings/join-space/dialog
    /// flags to `User`, anything else to `None` (applied directly, unordered).
    pub fn bucket_key(&self) -> Option<BucketKey> {
        use UpdateKind::*;
        match self {
            NewMessage { peer, .. }
            | EditMessage { peer, .. }
            | DeleteMessages { peer, .. }
            | MessageAttachment { peer, .. }
            | UpdateReaction { peer, .. }
            | DeleteReaction { peer, .. }
            | DeleteChat { peer }
            | MarkAsUnread { peer }
            | UpdateReadMaxId { peer, .. }
            | ParticipantAdd { peer }
            | ParticipantDelete { peer }
            | ChatVisibility { peer }
            | ChatInfo { peer }
            | PinnedMessages { peer }
            | NewChat { peer } => Some(BucketKey::Chat(*peer)),

            SpaceMemberAdd { space_id }
            | SpaceMemberDelete { space_id }
            | SpaceMemberUpdate { space_id } => Some(BucketKey::Space(*space_id)),

            JoinSpace { .. }
            | UpdateUserStatus
            | UpdateUserSettings
            | DialogArchived { .. }
            | DialogNotificationSettings { .. } => Some(BucketKey::User),

            ChatHasNewUpdates { .. } | SpaceHasNewUpdates { .. } | Unknown => None,
        }
    }
}

/// A single update as delivered over the wire: `seq` is only present for
/// sequenced updates (§3: "Updates with `seq > 0` are sequenced").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    pub date: i64,
    #[serde(flatten)]
    pub kind: UpdateKind,
}

impl Update {
    /// Whether this update must pass through a bucket's ordering before being applied.
    pub fn is_sequenced(&self) -> bool {
        matches!(self.seq, Some(seq) if seq > 0)
    }
}

/// `getUpdates` request input (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUpdatesInput {
    pub bucket: BucketKey,
    pub start_seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_end: Option<i64>,
    pub total_limit: i32,
}

/// How a `getUpdates` reply characterizes what it was able to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GetUpdatesResultType {
    Ok,
    /// The requested range is too large to enumerate incrementally; the
    /// engine must fast-forward instead of applying intermediate updates.
    TooLong,
    /// The reply is a partial slice of a larger range; more calls are needed.
    Slice,
}

/// `getUpdates` reply (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUpdatesOutput {
    pub updates: Vec<Update>,
    pub seq: i64,
    pub date: i64,
    pub r#final: bool,
    pub result_type: GetUpdatesResultType,
}

/// `getUpdatesState` request input (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GetUpdatesStateInput {
    pub date: i64,
}

/// `getUpdatesState` reply (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GetUpdatesStateOutput {
    pub date: i64,
}

/// Client -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum ClientFrame {
    ConnectionInit {
        token: Option<String>,
        layer: i32,
        client_version: String,
    },
    RpcCall {
        id: u64,
        method: String,
        input: serde_json::Value,
    },
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum ServerFrame {
    ConnectionOpen {},
    RpcResult {
        req_msg_id: u64,
        result: serde_json::Value,
    },
    RpcError {
        req_msg_id: u64,
        error_code: i32,
        message: String,
        code: Option<String>,
    },
    UpdatesPayload {
        updates: Vec<Update>,
    },
    Ack {},
}
