//! Watch manager behavior against a scripted stream server: serialized
//! creation, revision-accurate replay across reconnects, and graceful
//! cancellation.

mod common;

use common::{stream_acceptor, MockTransport, ServerStream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_connect::{
    ClientError, ClientOptions, ConnectionPool, InOrderShuffle, WatchEvent, WatchManager,
    WatchSpec,
};
use tether_core_resilience::ConstantBackoff;
use tether_proto::{
    Event, EventType, KeyValue, ResponseHeader, Revision, WatchRequest, WatchResponse,
};
use tokio::sync::mpsc;

fn setup() -> (
    Arc<WatchManager>,
    mpsc::UnboundedReceiver<ServerStream>,
) {
    let (stream_handler, accepted) = stream_acceptor();
    let transport = MockTransport::with_streams(
        |record| {
            Err(ClientError::NotImplemented(format!(
                "unary {}",
                record.method
            )))
        },
        move |address, service, method| stream_handler(address, service, method),
    );
    let options = ClientOptions {
        hosts: vec!["h1".to_string()],
        connector: Some(transport),
        shuffle: Some(Arc::new(InOrderShuffle)),
        ..Default::default()
    };
    let pool = Arc::new(ConnectionPool::new(options).unwrap());
    let manager = Arc::new(WatchManager::with_backoff(
        pool,
        Arc::new(ConstantBackoff::new(Duration::from_millis(10))),
    ));
    (manager, accepted)
}

fn header(revision: i64) -> ResponseHeader {
    ResponseHeader {
        revision: Revision(revision),
        ..Default::default()
    }
}

fn created_frame(watch_id: i64, revision: i64) -> Value {
    serde_json::to_value(WatchResponse {
        header: header(revision),
        watch_id,
        created: true,
        ..Default::default()
    })
    .unwrap()
}

fn put_frame(watch_id: i64, key: &str, value: &str, revision: i64) -> Value {
    serde_json::to_value(WatchResponse {
        header: header(revision),
        watch_id,
        events: vec![Event {
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.as_bytes().to_vec().into(),
                value: value.as_bytes().to_vec().into(),
                mod_revision: Revision(revision),
                ..Default::default()
            },
            prev_kv: None,
        }],
        ..Default::default()
    })
    .unwrap()
}

fn canceled_frame(watch_id: i64, revision: i64) -> Value {
    serde_json::to_value(WatchResponse {
        header: header(revision),
        watch_id,
        canceled: true,
        ..Default::default()
    })
    .unwrap()
}

fn parse_create(frame: Value) -> tether_proto::WatchCreateRequest {
    match serde_json::from_value::<WatchRequest>(frame).unwrap() {
        WatchRequest::CreateRequest(create) => create,
        other => panic!("expected create_request, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_creates_are_strictly_serialized() {
    let (manager, mut accepted) = setup();

    let m1 = manager.clone();
    let first = tokio::spawn(async move { m1.watch(WatchSpec::key("a")).await.unwrap() });
    let m2 = manager.clone();
    let second = tokio::spawn(async move { m2.watch(WatchSpec::key("b")).await.unwrap() });

    let mut server = accepted.recv().await.unwrap();
    let create = parse_create(server.requests.recv().await.unwrap());

    // Only one create may be in flight until the server assigns an id.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.requests.try_recv().is_err());

    server.frames.send(Ok(created_frame(1, 1))).unwrap();
    let next = parse_create(server.requests.recv().await.unwrap());
    assert_ne!(create.key, next.key);
    server.frames.send(Ok(created_frame(2, 1))).unwrap();

    first.await.unwrap();
    second.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes_at_last_revision_plus_one() {
    let (manager, mut accepted) = setup();

    let m = manager.clone();
    let watcher_task = tokio::spawn(async move { m.watch(WatchSpec::key("a")).await.unwrap() });

    let mut server = accepted.recv().await.unwrap();
    let create = parse_create(server.requests.recv().await.unwrap());
    assert_eq!(create.start_revision, None);
    server.frames.send(Ok(created_frame(1, 1))).unwrap();
    let mut watcher = watcher_task.await.unwrap();

    assert!(matches!(
        watcher.next().await,
        Some(WatchEvent::Connected { revision: Revision(1) })
    ));

    server.frames.send(Ok(put_frame(1, "a", "v1", 5))).unwrap();
    match watcher.next().await {
        Some(WatchEvent::Put { kv, .. }) => assert_eq!(&kv.value[..], b"v1"),
        other => panic!("expected put, got {other:?}"),
    }
    assert_eq!(watcher.last_revision(), Some(Revision(5)));

    // Drop the stream with an error; the manager must resubscribe from the
    // last observed revision + 1 so nothing is missed or duplicated.
    server
        .frames
        .send(Err(ClientError::Unavailable("stream lost".into())))
        .unwrap();
    assert!(matches!(
        watcher.next().await,
        Some(WatchEvent::Disconnected { .. })
    ));

    let mut server2 = accepted.recv().await.unwrap();
    let recreate = parse_create(server2.requests.recv().await.unwrap());
    assert_eq!(recreate.start_revision, Some(Revision(6)));

    server2.frames.send(Ok(created_frame(9, 6))).unwrap();
    assert!(matches!(
        watcher.next().await,
        Some(WatchEvent::Connected { revision: Revision(6) })
    ));

    server2.frames.send(Ok(put_frame(9, "a", "v2", 7))).unwrap();
    match watcher.next().await {
        Some(WatchEvent::Put { kv, .. }) => assert_eq!(&kv.value[..], b"v2"),
        other => panic!("expected put, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_prefix_watch_strips_prefix_from_events() {
    let (manager, mut accepted) = setup();

    let m = manager.clone();
    let watcher_task =
        tokio::spawn(async move { m.watch(WatchSpec::prefix("dir/").with_prev_kv()).await.unwrap() });

    let mut server = accepted.recv().await.unwrap();
    let create = parse_create(server.requests.recv().await.unwrap());
    assert_eq!(&create.key[..], b"dir/");
    assert_eq!(create.range_end.as_deref(), Some(&b"dir0"[..]));
    assert!(create.prev_kv);
    server.frames.send(Ok(created_frame(3, 1))).unwrap();
    let mut watcher = watcher_task.await.unwrap();
    let _ = watcher.next().await; // connected

    server
        .frames
        .send(Ok(put_frame(3, "dir/sub", "v", 2)))
        .unwrap();
    match watcher.next().await {
        Some(WatchEvent::Put { kv, .. }) => assert_eq!(&kv.key[..], b"sub"),
        other => panic!("expected put, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_waits_for_server_confirmation() {
    let (manager, mut accepted) = setup();

    let m = manager.clone();
    let watcher_task = tokio::spawn(async move { m.watch(WatchSpec::key("a")).await.unwrap() });

    let mut server = accepted.recv().await.unwrap();
    let _ = server.requests.recv().await.unwrap();
    server.frames.send(Ok(created_frame(4, 1))).unwrap();
    let watcher = watcher_task.await.unwrap();

    let cancel_task = tokio::spawn(async move { watcher.cancel().await });

    let cancel = server.requests.recv().await.unwrap();
    match serde_json::from_value::<WatchRequest>(cancel).unwrap() {
        WatchRequest::CancelRequest(req) => assert_eq!(req.watch_id, 4),
        other => panic!("expected cancel_request, got {other:?}"),
    }
    server.frames.send(Ok(canceled_frame(4, 2))).unwrap();
    cancel_task.await.unwrap();

    // The last watcher is gone; the manager tears the stream down.
    assert!(server.requests.recv().await.is_none());
}
