//! A reconnecting duplex RPC transport over a websocket carrier.
//!
//! Generalizes the background-task-plus-oneshot-correlation design used for
//! JSON-RPC reconnection: a single background task owns the socket, callers
//! dispatch [`Op`]s to it over an unbounded channel and get their reply back
//! through a `oneshot::Sender`, and on disconnect every in-flight call is
//! failed with [`Error::DisconnectedWillReconnect`] while the task retries
//! the connection in the background using an injectable backoff policy.

mod reconnect;
#[cfg(test)]
mod tests;

use crate::wire::{ClientFrame, ServerFrame, Update};
use crate::Error;

use finito::{ExponentialBackoff, Retry};
use futures::{SinkExt, StreamExt};
use reconnect::{reconnect_channel, ReconnectRx, ReconnectTx};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

const LOG_TARGET: &str = "chatsync-rpc";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A fully dialled and handshaked connection, paired with its auth token so
/// reconnects can replay `connectionInit`.
struct Dialled {
    socket: Socket,
}

#[derive(Debug)]
enum Op {
    Call {
        method: String,
        input: serde_json::Value,
        send_back: oneshot::Sender<Result<serde_json::Value, Error>>,
    },
}

/// A cheaply-cloneable handle to a reconnecting RPC transport.
///
/// Cloning shares the same background task and connection; dropping the last
/// clone tears the task (and socket) down.
#[derive(Clone, Debug)]
pub struct RpcTransport {
    tx: mpsc::UnboundedSender<Op>,
    reconnect: ReconnectRx,
    updates: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<Update>>>>,
}

/// Configuration for dialling a [`RpcTransport`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    pub client_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RpcTransport {
    /// Dial `config.url`, completing the `connectionInit`/`connectionOpen`
    /// handshake before returning, then hand back a handle whose background
    /// task keeps the connection alive and reconnects on loss.
    pub async fn connect(config: TransportConfig, token: Option<String>) -> Result<Self, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let retry_policy = ExponentialBackoff::from_millis(50).max_delay(Duration::from_secs(30));

        let dialled = Retry::new(retry_policy.clone(), || {
            dial(&config.url, token.clone(), config.connect_timeout)
        })
        .await?;

        let (reconn_tx, reconn_rx) = reconnect_channel();

        tokio::spawn(background_task(
            dialled,
            rx,
            updates_tx,
            config,
            token,
            reconn_tx,
            retry_policy,
        ));

        Ok(RpcTransport {
            tx,
            reconnect: reconn_rx,
            updates: Arc::new(std::sync::Mutex::new(Some(updates_rx))),
        })
    }

    /// Take ownership of the push-update stream. Returns `None` if already
    /// taken by another clone of this handle — there is only ever one
    /// consumer of raw updates (the sync engine demultiplexes from there).
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<Update>> {
        self.updates.lock().expect("updates mutex poisoned").take()
    }

    /// Issue a single RPC call and await its correlated reply.
    pub async fn request(
        &self,
        method: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Op::Call {
                method: method.into(),
                input,
                send_back: tx,
            })
            .map_err(|_| Error::Dropped)?;
        rx.await.map_err(|_| Error::Dropped)?
    }

    /// Resolves once a reconnect has started, then returns a future that
    /// resolves once it has completed. May be awaited repeatedly.
    pub async fn reconnect_initiated(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.reconnect.reconnect_started().await;
        self.reconnect.reconnected()
    }

    /// How many times this transport has reconnected successfully.
    pub fn reconnect_count(&self) -> usize {
        self.reconnect.count()
    }
}

async fn dial(url: &str, token: Option<String>, timeout: Duration) -> Result<Dialled, Error> {
    let (mut socket, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| Error::ConnectTimeout)?
        .map_err(|e| Error::Carrier(e.to_string()))?;

    let init = ClientFrame::ConnectionInit {
        token,
        layer: 1,
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    send_frame(&mut socket, &init).await?;

    let open = tokio::time::timeout(timeout, recv_frame(&mut socket))
        .await
        .map_err(|_| Error::ConnectTimeout)??;
    match open {
        Some(ServerFrame::ConnectionOpen {}) => {}
        Some(other) => {
            return Err(Error::Carrier(format!(
                "expected connectionOpen, got {other:?}"
            )))
        }
        None => return Err(Error::ConnectTimeout),
    }

    tracing::debug!(target: LOG_TARGET, "connection opened");
    Ok(Dialled { socket })
}

async fn send_frame(socket: &mut Socket, frame: &ClientFrame) -> Result<(), Error> {
    let text = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| Error::Carrier(e.to_string()))
}

async fn recv_frame(socket: &mut Socket) -> Result<Option<ServerFrame>, Error> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(serde_json::from_str(&text)?)),
            Some(Ok(Message::Binary(bytes))) => return Ok(Some(serde_json::from_slice(&bytes)?)),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(e)) => return Err(Error::Carrier(e.to_string())),
        }
    }
}

async fn background_task(
    mut dialled: Dialled,
    mut rx: mpsc::UnboundedReceiver<Op>,
    updates_tx: mpsc::UnboundedSender<Update>,
    config: TransportConfig,
    token: Option<String>,
    reconn: ReconnectTx,
    retry_policy: ExponentialBackoff,
) {
    let disconnect = Arc::new(Notify::new());
    let next_id = AtomicU64::new(1);
    let mut pending: std::collections::HashMap<u64, oneshot::Sender<Result<serde_json::Value, Error>>> =
        std::collections::HashMap::new();

    'outer: loop {
        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        None => break 'outer,
                        Some(Op::Call { method, input, send_back }) => {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            let frame = ClientFrame::RpcCall { id, method, input };
                            if send_frame(&mut dialled.socket, &frame).await.is_err() {
                                let _ = send_back.send(Err(Error::DisconnectedWillReconnect(
                                    "carrier write failed".to_string(),
                                )));
                                break;
                            }
                            pending.insert(id, send_back);
                        }
                    }
                }
                frame = recv_frame(&mut dialled.socket) => {
                    match frame {
                        Ok(Some(ServerFrame::RpcResult { req_msg_id, result })) => {
                            if let Some(sender) = pending.remove(&req_msg_id) {
                                let _ = sender.send(Ok(result));
                            }
                        }
                        Ok(Some(ServerFrame::RpcError { req_msg_id, error_code, message, .. })) => {
                            if let Some(sender) = pending.remove(&req_msg_id) {
                                let _ = sender.send(Err(Error::Rpc { code: error_code, message }));
                            }
                        }
                        Ok(Some(ServerFrame::UpdatesPayload { updates })) => {
                            for update in updates {
                                let _ = updates_tx.send(update);
                            }
                        }
                        Ok(Some(ServerFrame::Ack {} | ServerFrame::ConnectionOpen {})) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        tracing::debug!(target: LOG_TARGET, "connection lost; failing {} in-flight calls and reconnecting", pending.len());
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(Error::DisconnectedWillReconnect(
                "connection lost".to_string(),
            )));
        }
        disconnect.notify_waiters();

        reconn.reconnect_initiated();
        let redial = Retry::new(retry_policy.clone(), || {
            dial(&config.url, token.clone(), config.connect_timeout)
        })
        .await;

        match redial {
            Ok(new_dialled) => {
                dialled = new_dialled;
                reconn.reconnected();
                tracing::debug!(target: LOG_TARGET, "reconnected");
            }
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, "giving up reconnecting: {e}");
                break 'outer;
            }
        }
    }

    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(Error::Dropped));
    }
}
