//! The public-facing surface (§4.8): a typed RPC facade plus a normalized
//! event stream and a small resumable cursor, independent of `SyncEngine`'s
//! full local-replica machinery. Where `BucketEngine` drives an entire
//! ordering domain into an `ApplyUpdates` sink, this reimplements the same
//! gap-catch-up idea at chat granularity only, for callers that just want a
//! live event feed plus a cursor to resume from.

use crate::config::SyncConfig;
use crate::error::{Error, StoreError};
use async_trait::async_trait;
use chatsync_rpc::wire::{
    BucketKey, GetUpdatesInput, GetUpdatesOutput, GetUpdatesResultType, Peer, Update, UpdateKind,
};
use chatsync_rpc::RpcTransport;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt as _;

/// A normalized inbound event, independent of the raw wire update shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    MessageNew { peer: Peer, message_id: i64, seq: i64, date: i64 },
    MessageEdit { peer: Peer, message_id: i64, seq: i64, date: i64 },
    MessageDelete { peer: Peer, message_ids: Vec<i64>, seq: i64, date: i64 },
    ReactionAdd { peer: Peer, message_id: i64, seq: i64, date: i64 },
    ReactionDelete { peer: Peer, message_id: i64, seq: i64, date: i64 },
    ChatHasUpdates { peer: Peer, seq: i64, date: i64 },
    SpaceHasUpdates { space_id: i64, seq: i64, date: i64 },
}

fn normalize(update: &Update) -> Option<InboundEvent> {
    let seq = update.seq.unwrap_or(0);
    let date = update.date;
    use UpdateKind::*;
    match &update.kind {
        NewMessage { peer, message_id } => Some(InboundEvent::MessageNew { peer: *peer, message_id: *message_id, seq, date }),
        EditMessage { peer, message_id } => Some(InboundEvent::MessageEdit { peer: *peer, message_id: *message_id, seq, date }),
        DeleteMessages { peer, message_ids } => Some(InboundEvent::MessageDelete { peer: *peer, message_ids: message_ids.clone(), seq, date }),
        UpdateReaction { peer, message_id } => Some(InboundEvent::ReactionAdd { peer: *peer, message_id: *message_id, seq, date }),
        DeleteReaction { peer, message_id } => Some(InboundEvent::ReactionDelete { peer: *peer, message_id: *message_id, seq, date }),
        ChatHasNewUpdates { peer, update_seq } => Some(InboundEvent::ChatHasUpdates { peer: *peer, seq: *update_seq, date }),
        SpaceHasNewUpdates { space_id, update_seq } => Some(InboundEvent::SpaceHasUpdates { space_id: *space_id, seq: *update_seq, date }),
        _ => None,
    }
}

/// The resumable cursor persisted by `SdkClient`, independent of
/// `BucketStore` (§6: `SdkClient.exportState` is its own JSON document).
/// Unknown keys are ignored on decode by virtue of `serde`'s default
/// behavior; `version` is always `1` for the documents this crate writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportState {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_cursor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq_by_chat_id: Option<HashMap<String, i64>>,
}

impl Default for ExportState {
    fn default() -> Self {
        Self {
            version: 1,
            date_cursor: None,
            last_sync_date: None,
            last_seq_by_chat_id: None,
        }
    }
}

/// Durable storage for a single [`ExportState`] document. A narrow trait so
/// a host application can back it with whatever file/KV store it already
/// uses, the same way [`crate::secret_store::SecretStore`] is pluggable.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn load(&self) -> Result<Option<ExportState>, StoreError>;
    async fn save(&self, state: &ExportState) -> Result<(), StoreError>;
}

const TREE_SDK_STATE: &str = "sdk_export_state";
const STATE_KEY: &str = "state";

/// A [`sled`]-backed [`StateStore`].
pub struct FileStateStore {
    tree: sled::Tree,
}

impl FileStateStore {
    /// Open (or create) the state store backed by the given [`sled::Db`].
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(TREE_SDK_STATE)?,
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<ExportState>, StoreError> {
        match self.tree.get(STATE_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ExportState) -> Result<(), StoreError> {
        self.tree.insert(STATE_KEY, serde_json::to_vec(state)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }
}

/// `getMe` output.
#[derive(Debug, Clone, Deserialize)]
pub struct GetMeOutput {
    pub user_id: i64,
}

/// `getChat` input/output.
#[derive(Debug, Clone, Serialize)]
pub struct GetChatInput {
    pub chat_id: i64,
}
/// `getChat` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct GetChatOutput {
    pub chat_id: i64,
    pub title: String,
    #[serde(default)]
    pub peer: Option<Peer>,
}

/// Either side of the `chatId` / `userId` mutual-exclusion rule used by
/// several RPCs.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum Target {
    Chat { chat_id: i64 },
    User { user_id: i64 },
}

/// `getMessages` input/output.
#[derive(Debug, Clone, Serialize)]
pub struct GetMessagesInput {
    #[serde(flatten)]
    pub target: Target,
    pub message_ids: Vec<i64>,
}
/// `getMessages` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct GetMessagesOutput {
    pub messages: Vec<serde_json::Value>,
}

/// `sendMessage` input/output.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageInput {
    #[serde(flatten)]
    pub target: Target,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_msg_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_markdown: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_mode: Option<String>,
}
/// `sendMessage` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageOutput {
    #[serde(default)]
    pub message_id: Option<i64>,
}

/// `sendTyping` input.
#[derive(Debug, Clone, Serialize)]
pub struct SendTypingInput {
    pub chat_id: i64,
    pub typing: bool,
}

/// The key `lastSeqByChatId` is indexed by: the numeric chat/user id a
/// `Peer` addresses, not the ordering-domain's `BucketKey` display form.
fn chat_key(peer: Peer) -> String {
    match peer {
        Peer::Chat(id) | Peer::User(id) => id.to_string(),
    }
}

/// The public SDK facade.
pub struct SdkClient {
    transport: Arc<RpcTransport>,
    state_store: Arc<dyn StateStore>,
    config: SyncConfig,
    events_tx: broadcast::Sender<InboundEvent>,
    /// Copy-on-write snapshot guarded by a plain mutex, per §5 "shared
    /// synchronous readers" — `export_state()` is sync and callable from
    /// arbitrary contexts.
    state: Arc<StdMutex<ExportState>>,
    chat_cursors: Arc<Mutex<HashMap<String, i64>>>,
    connect_once: OnceCell<()>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    save_task: Mutex<Option<JoinHandle<()>>>,
    dirty: Arc<tokio::sync::Notify>,
    closed: Arc<AtomicBool>,
}

impl SdkClient {
    /// Build a client. Loads any previously exported state before returning.
    pub async fn new(transport: Arc<RpcTransport>, state_store: Arc<dyn StateStore>, config: SyncConfig) -> Self {
        let loaded = state_store.load().await.unwrap_or(None).unwrap_or_default();
        let chat_cursors = loaded.last_seq_by_chat_id.clone().unwrap_or_default();
        let (events_tx, _) = broadcast::channel(64);
        Self {
            transport,
            state_store,
            config,
            events_tx,
            state: Arc::new(StdMutex::new(loaded)),
            chat_cursors: Arc::new(Mutex::new(chat_cursors)),
            connect_once: OnceCell::new(),
            pump_task: Mutex::new(None),
            save_task: Mutex::new(None),
            dirty: Arc::new(tokio::sync::Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent; concurrent callers share the same in-flight attempt.
    /// `abort` lets the caller cancel before the pump task starts.
    pub async fn connect(&self, abort: Option<oneshot::Receiver<()>>) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        self.connect_once
            .get_or_try_init(|| async {
                if let Some(abort) = abort {
                    if abort.try_recv().is_ok() {
                        return Err(Error::Aborted);
                    }
                }
                self.spawn_pump();
                self.spawn_save_loop();
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn spawn_pump(&self) {
        let Some(mut updates) = self.transport.take_updates() else {
            return;
        };
        let events_tx = self.events_tx.clone();
        let transport = self.transport.clone();
        let chat_cursors = self.chat_cursors.clone();
        let state = self.state.clone();
        let dirty = self.dirty.clone();
        let closed = self.closed.clone();

        let handle = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(event) = normalize(&update) {
                    let _ = events_tx.send(event.clone());
                    if let InboundEvent::ChatHasUpdates { peer, seq: update_seq, .. } = event {
                        catch_up_chat(&transport, &chat_cursors, &state, peer, update_seq, &events_tx).await;
                    }
                }

                {
                    let mut guard = state.lock().expect("poisoned");
                    guard.date_cursor = Some(guard.date_cursor.unwrap_or(0).max(update.date));
                }
                if let Some(seq) = update.seq {
                    if seq > 0 {
                        if let Some(BucketKey::Chat(peer)) = update.kind.bucket_key() {
                            let key = chat_key(peer);
                            let mut cursors = chat_cursors.lock().await;
                            let entry = cursors.entry(key.clone()).or_insert(0);
                            if seq > *entry {
                                *entry = seq;
                                let mut state = state.lock().expect("poisoned");
                                let mut map = state.last_seq_by_chat_id.clone().unwrap_or_default();
                                map.insert(key, seq);
                                state.last_seq_by_chat_id = Some(map);
                            }
                        }
                    }
                }

                dirty.notify_one();
            }
        });

        // Spawned once per `connect`, protected by `connect_once`; no prior
        // handle can be live here.
        if let Ok(mut guard) = self.pump_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Debounced state persistence, per §4.8: coalesce rapid-fire cursor
    /// updates into one write every 250 ms instead of one write per update.
    fn spawn_save_loop(&self) {
        let dirty = self.dirty.clone();
        let state = self.state.clone();
        let state_store = self.state_store.clone();
        let debounce = self.config.state_save_debounce;
        let closed = self.closed.clone();

        let handle = tokio::spawn(async move {
            loop {
                dirty.notified().await;
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(debounce).await;
                let snapshot = state.lock().expect("poisoned").clone();
                if let Err(e) = state_store.save(&snapshot).await {
                    tracing::warn!("failed to persist sdk export state: {e}");
                }
            }
        });

        if let Ok(mut guard) = self.save_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Cancels open-waiters, stops the pump, flushes state. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.pump_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.save_task.lock().await.take() {
            handle.abort();
        }
        let snapshot = self.state.lock().expect("poisoned").clone();
        let _ = self.state_store.save(&snapshot).await;
    }

    /// The normalized event stream. Ends when the client closes.
    pub fn events(&self) -> impl Stream<Item = InboundEvent> {
        BroadcastStream::new(self.events_tx.subscribe()).filter_map(|r| r.ok())
    }

    /// A synchronous, copy-on-write read of the resumable cursor.
    pub fn export_state(&self) -> ExportState {
        self.state.lock().expect("poisoned").clone()
    }

    /// `getMe()`.
    pub async fn get_me(&self) -> Result<GetMeOutput, Error> {
        self.invoke("getMe", serde_json::json!({}), None).await
    }

    /// `getChat({chatId})`.
    pub async fn get_chat(&self, chat_id: i64) -> Result<GetChatOutput, Error> {
        self.invoke("getChat", GetChatInput { chat_id }, None).await
    }

    /// `getMessages({target, messageIds})`.
    pub async fn get_messages(&self, target: Target, message_ids: Vec<i64>) -> Result<GetMessagesOutput, Error> {
        self.invoke("getMessages", GetMessagesInput { target, message_ids }, None).await
    }

    /// `sendMessage(...)`. Enforces the target and markdown/entities
    /// mutual-exclusion rules before issuing any wire I/O.
    pub async fn send_message(&self, input: SendMessageInput) -> Result<SendMessageOutput, Error> {
        if input.parse_markdown.is_some() && input.entities.is_some() {
            return Err(Error::Validation("parseMarkdown and entities are mutually exclusive".into()));
        }
        if input.text.is_none() && input.media.is_none() {
            return Err(Error::Validation("sendMessage requires text or media".into()));
        }
        self.invoke("sendMessage", input, None).await
    }

    /// `sendTyping({chatId, typing})`.
    pub async fn send_typing(&self, chat_id: i64, typing: bool) -> Result<(), Error> {
        let _: serde_json::Value = self
            .invoke("sendTyping", SendTypingInput { chat_id, typing }, None)
            .await?;
        Ok(())
    }

    /// Upload a file/attachment; payload and result shape are transport-defined.
    pub async fn upload_file(&self, input: serde_json::Value) -> Result<serde_json::Value, Error> {
        self.invoke_raw("uploadFile", input, None).await
    }

    /// Statically-typed escape hatch: typed input, typed output, full serde validation.
    pub async fn invoke<I: Serialize, O: DeserializeOwned>(
        &self,
        method: &'static str,
        input: I,
        timeout: Option<Duration>,
    ) -> Result<O, Error> {
        let input = serde_json::to_value(input).map_err(StoreError::from)?;
        let value = self.invoke_raw(method, input, timeout).await?;
        serde_json::from_value(value).map_err(|e| Error::VariantMismatch {
            method,
            expected: std::any::type_name::<O>(),
            got: e.to_string(),
        })
    }

    /// Dynamically-checked escape hatch: typed input, raw JSON output, only
    /// verified to be a JSON object (not a specific shape).
    pub async fn invoke_raw(
        &self,
        method: &'static str,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, Error> {
        let value = self.invoke_unchecked_raw(method, input, timeout).await?;
        if !value.is_null() && !value.is_object() {
            return Err(Error::VariantMismatch {
                method,
                expected: "object",
                got: value.to_string(),
            });
        }
        Ok(value)
    }

    /// Unchecked escape hatch: no input or output validation at all.
    pub async fn invoke_unchecked_raw(
        &self,
        method: &'static str,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, Error> {
        let call = self.transport.request(method, input);
        match timeout {
            Some(d) => tokio::time::timeout(d, call)
                .await
                .map_err(|_| Error::Rpc(chatsync_rpc::Error::Timeout))?
                .map_err(Error::from),
            None => call.await.map_err(Error::from),
        }
    }
}

/// The SDK-level mirror of `BucketEngine`'s catch-up loop (§4.8), scoped to
/// a single chat and invoked directly from the push-update pump rather than
/// from a generic fetch trigger.
async fn catch_up_chat(
    transport: &Arc<RpcTransport>,
    chat_cursors: &Arc<Mutex<HashMap<String, i64>>>,
    state_cell: &Arc<StdMutex<ExportState>>,
    peer: Peer,
    update_seq: i64,
    events_tx: &broadcast::Sender<InboundEvent>,
) {
    let key = chat_key(peer);
    let mut cursor = {
        let cursors = chat_cursors.lock().await;
        *cursors.get(&key).unwrap_or(&0)
    };
    if update_seq <= cursor {
        return;
    }

    loop {
        let input = GetUpdatesInput {
            bucket: BucketKey::Chat(peer),
            start_seq: cursor,
            seq_end: Some(update_seq),
            total_limit: 1000,
        };
        let response = transport
            .request("getUpdates", serde_json::to_value(&input).expect("always serializes"))
            .await;
        let output: GetUpdatesOutput = match response.and_then(|v| serde_json::from_value(v).map_err(chatsync_rpc::Error::from)) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(%key, "sdk chat catch-up failed: {e}");
                break;
            }
        };

        if output.seq == cursor && !output.r#final {
            tracing::warn!(%key, "sdk chat catch-up made no progress; aborting");
            break;
        }

        match output.result_type {
            GetUpdatesResultType::TooLong => {
                cursor = update_seq;
                let mut cursors = chat_cursors.lock().await;
                cursors.insert(key.clone(), cursor);
                let mut state = state_cell.lock().expect("poisoned");
                state.date_cursor = Some(output.date);
                let mut map = state.last_seq_by_chat_id.clone().unwrap_or_default();
                map.insert(key.clone(), cursor);
                state.last_seq_by_chat_id = Some(map);
                break;
            }
            GetUpdatesResultType::Ok | GetUpdatesResultType::Slice => {
                let mut updates = output.updates;
                updates.sort_by_key(|u| u.seq.unwrap_or(0));
                for update in &updates {
                    if let Some(event) = normalize(update) {
                        let _ = events_tx.send(event);
                    }
                }
                cursor = cursor.max(output.seq);
                {
                    let mut cursors = chat_cursors.lock().await;
                    cursors.insert(key.clone(), cursor);
                }
                {
                    let mut state = state_cell.lock().expect("poisoned");
                    state.date_cursor = Some(output.date);
                    let mut map = state.last_seq_by_chat_id.clone().unwrap_or_default();
                    map.insert(key.clone(), cursor);
                    state.last_seq_by_chat_id = Some(map);
                }
                if output.r#final || cursor >= update_seq {
                    break;
                }
            }
        }
    }
}

/// A non-durable in-memory [`StateStore`] for tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    state: tokio::sync::Mutex<Option<ExportState>>,
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<Option<ExportState>, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ExportState) -> Result<(), StoreError> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }
}
