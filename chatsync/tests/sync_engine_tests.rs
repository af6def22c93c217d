//! End-to-end coverage of `SyncEngine` driven over a real (loopback)
//! `RpcTransport`, exercising realtime ordering, gap-triggered catch-up,
//! duplicate suppression, and a cold-start `tooLong` fast-forward.

mod support;

use chatsync::{
    BucketKey, BucketStore, GetUpdatesInput, GetUpdatesOutput, GetUpdatesResultType, Peer,
    RecordingSink, SyncConfig, SyncEngine, TransportConfig, Update, UpdateKind,
};
use chatsync_rpc::RpcTransport;
use std::sync::Arc;
use std::time::Duration;
use support::{wait_for, TestServer};

fn open_store() -> (tempfile::TempDir, Arc<BucketStore>) {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    (dir, Arc::new(BucketStore::open(&db).unwrap()))
}

fn seq_update(peer: Peer, message_id: i64, seq: i64, date: i64) -> Update {
    Update {
        seq: Some(seq),
        date,
        kind: UpdateKind::NewMessage { peer, message_id },
    }
}

async fn connect(server: &TestServer) -> Arc<RpcTransport> {
    Arc::new(
        RpcTransport::connect(TransportConfig::new(server.url.clone()), None)
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn realtime_updates_apply_in_order() {
    let server = TestServer::start(Arc::new(|method, _input| {
        panic!("unexpected call to {method}, no gap should trigger a fetch")
    }))
    .await;
    let transport = connect(&server).await;
    let (_dir, bucket_store) = open_store();
    let sink = Arc::new(RecordingSink::new());
    let engine = SyncEngine::new(transport, bucket_store, sink.clone(), SyncConfig::default());

    let peer = Peer::Chat(1);
    engine
        .process(vec![
            seq_update(peer, 10, 1, 100),
            seq_update(peer, 11, 2, 101),
            seq_update(peer, 12, 3, 102),
        ])
        .await;

    let applied = sink.applied_for(Some(BucketKey::Chat(peer))).await;
    let ids: Vec<i64> = applied
        .iter()
        .map(|u| match u.kind {
            UpdateKind::NewMessage { message_id, .. } => message_id,
            _ => panic!("unexpected update kind"),
        })
        .collect();
    assert_eq!(ids, vec![10, 11, 12]);
}

#[tokio::test]
async fn gap_triggers_catch_up_and_fills_the_hole() {
    let responder = Arc::new(|method: &str, input: serde_json::Value| {
        assert_eq!(method, "getUpdates");
        let input: GetUpdatesInput = serde_json::from_value(input).unwrap();
        assert_eq!(input.start_seq, 1);
        let output = GetUpdatesOutput {
            updates: vec![seq_update(Peer::Chat(5), 20, 2, 201)],
            seq: 2,
            date: 201,
            r#final: true,
            result_type: GetUpdatesResultType::Ok,
        };
        serde_json::to_value(output).unwrap()
    });
    let server = TestServer::start(responder).await;
    let transport = connect(&server).await;
    let (_dir, bucket_store) = open_store();
    let sink = Arc::new(RecordingSink::new());
    let engine = SyncEngine::new(transport, bucket_store.clone(), sink.clone(), SyncConfig::default());

    let peer = Peer::Chat(5);
    // seq 1 and seq 3 arrive together; seq 2 is missing, so the engine must
    // fetch it before seq 3 can drain.
    engine
        .process(vec![seq_update(peer, 1, 1, 200), seq_update(peer, 3, 3, 202)])
        .await;

    let key = BucketKey::Chat(peer);
    let cursor = wait_for(Duration::from_secs(2), || {
        let bucket_store = bucket_store.clone();
        async move {
            let cursor = bucket_store.get_cursor(&key).await.unwrap();
            (cursor.seq == 3).then_some(cursor)
        }
    })
    .await;
    assert_eq!(cursor.seq, 3);

    let applied = sink.applied_for(Some(key)).await;
    assert_eq!(applied.len(), 3, "seq 1, the fetched seq 2, and the drained seq 3 all applied");
}

#[tokio::test]
async fn duplicate_update_is_dropped_and_counted() {
    let server = TestServer::start(Arc::new(|method, _input| {
        panic!("unexpected call to {method}")
    }))
    .await;
    let transport = connect(&server).await;
    let (_dir, bucket_store) = open_store();
    let sink = Arc::new(RecordingSink::new());
    let engine = SyncEngine::new(transport, bucket_store, sink.clone(), SyncConfig::default());

    let peer = Peer::Chat(9);
    engine.process(vec![seq_update(peer, 1, 1, 50)]).await;
    engine.process(vec![seq_update(peer, 1, 1, 50)]).await;

    assert_eq!(engine.stats().bucket_updates_duplicate_skipped, 1);
    assert_eq!(sink.applied_for(Some(BucketKey::Chat(peer))).await.len(), 1);
}

#[tokio::test]
async fn too_long_cold_start_fast_forwards_without_replaying() {
    let responder = Arc::new(|method: &str, input: serde_json::Value| {
        assert_eq!(method, "getUpdates");
        let input: GetUpdatesInput = serde_json::from_value(input).unwrap();
        assert_eq!(input.start_seq, 0);
        let output = GetUpdatesOutput {
            updates: vec![],
            seq: 9000,
            date: 777,
            r#final: true,
            result_type: GetUpdatesResultType::TooLong,
        };
        serde_json::to_value(output).unwrap()
    });
    let server = TestServer::start(responder).await;
    let transport = connect(&server).await;
    let (_dir, bucket_store) = open_store();
    let sink = Arc::new(RecordingSink::new());
    let engine = SyncEngine::new(transport, bucket_store.clone(), sink.clone(), SyncConfig::default());

    let peer = Peer::Chat(42);
    let key = BucketKey::Chat(peer);
    engine
        .process(vec![Update {
            seq: None,
            date: 777,
            kind: UpdateKind::ChatHasNewUpdates { peer, update_seq: 9000 },
        }])
        .await;

    let cursor = wait_for(Duration::from_secs(2), || {
        let bucket_store = bucket_store.clone();
        async move {
            let cursor = bucket_store.get_cursor(&key).await.unwrap();
            (cursor.seq == 9000).then_some(cursor)
        }
    })
    .await;

    assert_eq!(cursor, chatsync::BucketCursor { seq: 9000, date: 777 });
    assert_eq!(engine.stats().bucket_fetch_too_long, 1);
    assert!(
        sink.applied_for(Some(key)).await.is_empty(),
        "a tooLong fast-forward must never replay individual updates"
    );
}

#[tokio::test]
async fn clear_sync_state_resets_counters_and_cursors() {
    let server = TestServer::start(Arc::new(|method, _input| panic!("unexpected call to {method}"))).await;
    let transport = connect(&server).await;
    let (_dir, bucket_store) = open_store();
    let sink = Arc::new(RecordingSink::new());
    let engine = SyncEngine::new(transport, bucket_store.clone(), sink.clone(), SyncConfig::default());

    let peer = Peer::Chat(1);
    engine.process(vec![seq_update(peer, 1, 1, 1)]).await;
    engine.process(vec![seq_update(peer, 1, 1, 1)]).await; // duplicate, bumps a stat

    engine.clear_sync_state().await;

    assert_eq!(engine.stats(), chatsync::SyncStatsSnapshot::default());
    assert_eq!(engine.last_sync_date().await, 0);
    assert_eq!(
        bucket_store.get_cursor(&BucketKey::Chat(peer)).await.unwrap(),
        chatsync::BucketCursor::COLD_START
    );
}
