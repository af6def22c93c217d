//! A minimal local websocket server for driving `RpcTransport` end to end in
//! integration tests, mirroring the harness `chatsync-rpc`'s own client tests
//! use: complete the handshake, then answer calls through a programmable
//! responder and optionally push server-originated updates.

use chatsync_rpc::wire::{ClientFrame, ServerFrame, Update};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Answers one RPC call, given its method name and raw JSON input.
pub type Responder = Arc<dyn Fn(&str, serde_json::Value) -> serde_json::Value + Send + Sync>;

/// A running test server plus a channel to push updates into its one client
/// connection.
pub struct TestServer {
    pub url: String,
    push_tx: mpsc::UnboundedSender<Update>,
}

impl TestServer {
    /// Start the server. `responder` computes the `result` for every
    /// `rpcCall` frame the client sends.
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Update>();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                return;
            };
            let _init: ClientFrame = serde_json::from_str(&text).unwrap();
            let open = serde_json::to_string(&ServerFrame::ConnectionOpen {}).unwrap();
            ws.send(Message::Text(open)).await.unwrap();

            loop {
                tokio::select! {
                    frame = ws.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(ClientFrame::RpcCall { id, method, input }) = serde_json::from_str(&text) else {
                                    continue;
                                };
                                let result = responder(&method, input);
                                let reply = ServerFrame::RpcResult { req_msg_id: id, result };
                                if ws.send(Message::Text(serde_json::to_string(&reply).unwrap())).await.is_err() {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                    update = push_rx.recv() => {
                        let Some(update) = update else { continue };
                        let frame = ServerFrame::UpdatesPayload { updates: vec![update] };
                        if ws.send(Message::Text(serde_json::to_string(&frame).unwrap())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { url: format!("ws://{addr}"), push_tx }
    }

    /// Push a server-originated update over the open connection.
    pub fn push(&self, update: Update) {
        let _ = self.push_tx.send(update);
    }
}

/// Poll an async predicate until it returns `Some`, or panic after `timeout`.
pub async fn wait_for<T, F, Fut>(timeout: std::time::Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
