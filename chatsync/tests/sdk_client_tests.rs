//! End-to-end coverage of `SdkClient`: normalized realtime events, chat-level
//! catch-up triggered by a `chatHasNewUpdates` push, and the `sendMessage`
//! validation rules that must never reach the wire.

mod support;

use chatsync::{
    BucketKey, GetMessagesOutput, GetUpdatesInput, GetUpdatesOutput, GetUpdatesResultType,
    InMemoryStateStore, InboundEvent, Peer, SdkClient, SendMessageInput, SyncConfig, Target,
    TransportConfig, Update, UpdateKind,
};
use chatsync_rpc::RpcTransport;
use std::sync::Arc;
use std::time::Duration;
use support::{wait_for, TestServer};
use tokio_stream::StreamExt;

async fn connect(server: &TestServer) -> Arc<RpcTransport> {
    Arc::new(
        RpcTransport::connect(TransportConfig::new(server.url.clone()), None)
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn message_new_push_is_normalized_and_broadcast() {
    let server = TestServer::start(Arc::new(|method, _input| {
        panic!("unexpected call to {method}")
    }))
    .await;
    let transport = connect(&server).await;
    let client = SdkClient::new(transport, Arc::new(InMemoryStateStore::default()), SyncConfig::default()).await;
    client.connect(None).await.unwrap();
    let mut events = Box::pin(client.events());

    let peer = Peer::Chat(7);
    server.push(Update {
        seq: Some(1),
        date: 1000,
        kind: UpdateKind::NewMessage { peer, message_id: 55 },
    });

    let event = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, InboundEvent::MessageNew { peer, message_id: 55, seq: 1, date: 1000 });

    let exported = wait_for(Duration::from_secs(2), || {
        let client = &client;
        async move {
            let state = client.export_state();
            state.last_seq_by_chat_id.is_some().then_some(state)
        }
    })
    .await;
    assert_eq!(
        exported.last_seq_by_chat_id.unwrap().get("7"),
        Some(&1)
    );

    client.close().await;
}

#[tokio::test]
async fn chat_has_updates_push_triggers_catch_up_to_the_hinted_seq() {
    let peer = Peer::Chat(3);
    let responder = Arc::new(move |method: &str, input: serde_json::Value| {
        assert_eq!(method, "getUpdates");
        let input: GetUpdatesInput = serde_json::from_value(input).unwrap();
        assert_eq!(input.bucket, BucketKey::Chat(peer));
        let output = GetUpdatesOutput {
            updates: vec![Update {
                seq: Some(5),
                date: 42,
                kind: UpdateKind::NewMessage { peer, message_id: 900 },
            }],
            seq: 5,
            date: 42,
            r#final: true,
            result_type: GetUpdatesResultType::Ok,
        };
        serde_json::to_value(output).unwrap()
    });
    let server = TestServer::start(responder).await;
    let transport = connect(&server).await;
    let client = SdkClient::new(transport, Arc::new(InMemoryStateStore::default()), SyncConfig::default()).await;
    client.connect(None).await.unwrap();
    let mut events = Box::pin(client.events());

    server.push(Update {
        seq: None,
        date: 42,
        kind: UpdateKind::ChatHasNewUpdates { peer, update_seq: 5 },
    });

    // The hint itself normalizes to a ChatHasUpdates event, then the
    // pump's catch-up call fetches and broadcasts the missed message.
    let first = tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap().unwrap();
    assert_eq!(first, InboundEvent::ChatHasUpdates { peer, seq: 5, date: 42 });
    let second = tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap().unwrap();
    assert_eq!(second, InboundEvent::MessageNew { peer, message_id: 900, seq: 5, date: 42 });

    let exported = wait_for(Duration::from_secs(2), || {
        let client = &client;
        async move {
            let state = client.export_state();
            let seq = state
                .last_seq_by_chat_id
                .as_ref()
                .and_then(|m| m.get("3"))
                .copied();
            (seq == Some(5)).then_some(state)
        }
    })
    .await;
    assert_eq!(
        exported.last_seq_by_chat_id.unwrap().get("3"),
        Some(&5)
    );

    client.close().await;
}

#[tokio::test]
async fn send_message_rejects_markdown_and_entities_together_without_a_wire_call() {
    let server = TestServer::start(Arc::new(|method, _input| {
        panic!("unexpected call to {method}, validation must fail before any RPC")
    }))
    .await;
    let transport = connect(&server).await;
    let client = SdkClient::new(transport, Arc::new(InMemoryStateStore::default()), SyncConfig::default()).await;

    let result = client
        .send_message(SendMessageInput {
            target: Target::Chat { chat_id: 1 },
            text: Some("hi".into()),
            media: None,
            reply_to_msg_id: None,
            parse_markdown: Some(true),
            entities: Some(serde_json::json!([])),
            send_mode: None,
        })
        .await;
    assert!(result.is_err());

    let result = client
        .send_message(SendMessageInput {
            target: Target::Chat { chat_id: 1 },
            text: None,
            media: None,
            reply_to_msg_id: None,
            parse_markdown: None,
            entities: None,
            send_mode: None,
        })
        .await;
    assert!(result.is_err(), "neither text nor media must be rejected");
}

#[tokio::test]
async fn get_messages_round_trips_through_invoke() {
    let server = TestServer::start(Arc::new(|method, _input| {
        assert_eq!(method, "getMessages");
        serde_json::to_value(GetMessagesOutput {
            messages: vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})],
        })
        .unwrap()
    }))
    .await;
    let transport = connect(&server).await;
    let client = SdkClient::new(transport, Arc::new(InMemoryStateStore::default()), SyncConfig::default()).await;

    let out = client
        .get_messages(Target::Chat { chat_id: 9 }, vec![1, 2])
        .await
        .unwrap();
    assert_eq!(out.messages.len(), 2);
}
