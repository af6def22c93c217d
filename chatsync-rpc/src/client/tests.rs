use super::*;
use crate::wire::{ClientFrame, ServerFrame};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Spins up a minimal server that completes the handshake and echoes back a
/// canned `rpcResult` for every call, closing the socket after `calls_before_drop`
/// calls if set, to exercise the reconnect path.
async fn run_server(calls_before_drop: Option<u32>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

                let Some(Ok(Message::Text(text))) = ws.next().await else {
                    return;
                };
                let _init: ClientFrame = serde_json::from_str(&text).unwrap();
                let open = serde_json::to_string(&ServerFrame::ConnectionOpen {}).unwrap();
                ws.send(Message::Text(open)).await.unwrap();

                let mut seen = 0u32;
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let ClientFrame::RpcCall { id, .. } = serde_json::from_str(&text).unwrap()
                    else {
                        continue;
                    };
                    let reply = ServerFrame::RpcResult {
                        req_msg_id: id,
                        result: serde_json::json!({"ok": true}),
                    };
                    let _ = ws.send(Message::Text(serde_json::to_string(&reply).unwrap())).await;

                    seen += 1;
                    if calls_before_drop == Some(seen) {
                        break;
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn call_works() {
    let url = run_server(None).await;
    let transport = RpcTransport::connect(TransportConfig::new(url), None)
        .await
        .unwrap();

    let result = transport
        .request("getUpdatesState", serde_json::json!({"date": 0}))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn call_fails_then_reconnects() {
    let url = run_server(Some(1)).await;
    let transport = RpcTransport::connect(TransportConfig::new(url), None)
        .await
        .unwrap();

    // First call succeeds, then the mock server drops the connection.
    transport
        .request("getUpdatesState", serde_json::json!({"date": 0}))
        .await
        .unwrap();

    // Give the background task time to notice the drop and redial against
    // the same listener (which keeps accepting new connections).
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = transport
        .request("getUpdatesState", serde_json::json!({"date": 0}))
        .await;
    assert!(result.is_ok());
    assert!(transport.reconnect_count() >= 1);
}
