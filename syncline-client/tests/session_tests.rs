mod common;

use common::{record_events, settle, Harness, ScriptedTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use syncline_client::{Applied, CatchUpReport, LocalStore, MemoryStore, SyncEvent};
use syncline_core::{
    errors::SyncError,
    models::{
        AuthorDisplay, AuthorProfile, ChannelId, ChannelStatus, DeliveryPath, PendingOperation,
        PendingState, RawEvent, StoredEvent, SyncCursor,
    },
};

fn message(id: &str, cursor: i64, content: &str) -> RawEvent {
    RawEvent::insert(id, SyncCursor::new(cursor), json!({ "content": content }))
}

fn seed(store: &MemoryStore, channel: &str, cursor: i64) {
    let raw = message(&format!("m{}", cursor), cursor, "seed");
    store.insert(&ChannelId::from(channel), StoredEvent::from_raw(&raw, AuthorDisplay::None));
}

#[tokio::test(start_paused = true)]
async fn test_own_write_is_echo_suppressed_then_promoted() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let room = ChannelId::from("room-1");
    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    assert_eq!(session.status(), Some(ChannelStatus::Connected));

    store.add_optimistic(
        &room,
        "tmp-1",
        json!({ "content": "hello" }),
        AuthorDisplay::Placeholder,
    );
    session
        .send_broadcast(
            PendingOperation::new("tmp-1", "hello@userA@t0"),
            message("tmp-1", 0, "hello").with_author("userA"),
        )
        .await
        .unwrap();
    settle(Duration::from_millis(1)).await;

    // The fast echo of our own write must not create a second row
    assert_eq!(store.len(&room), 0);
    assert_eq!(store.optimistic(&room).len(), 1);
    assert_eq!(session.pending().len(), 1);
    assert_eq!(transport.broadcasts()[0].local_id.as_deref(), Some("tmp-1"));

    let confirmed = message("m-1", 101, "hello")
        .with_author("userA")
        .with_match_key("hello@userA@t0");
    transport.push_event(&room, DeliveryPath::Authoritative, confirmed.clone());
    settle(Duration::from_millis(200)).await;

    assert!(store.optimistic(&room).is_empty());
    assert!(session.pending().is_empty());
    let stored = store.get(&room, "m-1").unwrap();
    assert_eq!(
        stored.author,
        AuthorDisplay::Resolved(AuthorProfile::new("userA", "USERA"))
    );
    assert_eq!(session.cursor(), Some(SyncCursor::new(101)));

    assert_eq!(session.deliver(DeliveryPath::Fast, confirmed), Applied::Duplicate);
    assert_eq!(store.len(&room), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_runs_catch_up_from_newest_local_cursor() {
    let harness = Harness::new();
    let events = record_events(&harness.ctx);
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "room-1", 100);
    for cursor in 101..=340 {
        transport.append(message(&format!("m{}", cursor), cursor, "backlog"));
    }

    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    settle(Duration::from_millis(10)).await;

    let room = ChannelId::from("room-1");
    assert_eq!(store.len(&room), 241);
    assert_eq!(transport.page_calls(), 3);
    assert_eq!(session.cursor(), Some(SyncCursor::new(340)));

    harness.ctx.events().process_events().unwrap();
    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::CatchUpStarted { since, .. } if *since == SyncCursor::new(100)
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::CatchUpCompleted { applied: 240, truncated: false, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_fresh_channel_requires_full_resync() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();

    let report = session.catch_up().await.unwrap();
    assert!(matches!(report, CatchUpReport::FullResyncRequired { .. }));
    assert_eq!(transport.page_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_reconnects_and_catches_up() {
    let harness = Harness::new();
    let events = record_events(&harness.ctx);
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "room-1", 10);
    let room = ChannelId::from("room-1");

    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    settle(Duration::from_millis(10)).await;
    assert_eq!(transport.opens(), 1);

    // Missed while the socket was down
    transport.append(message("m11", 11, "while away"));
    assert!(transport.drop_connection(&room));
    settle(Duration::from_millis(10)).await;

    assert_eq!(transport.opens(), 2);
    assert_eq!(session.status(), Some(ChannelStatus::Connected));
    assert!(store.get(&room, "m11").is_some());
    assert_eq!(session.cursor(), Some(SyncCursor::new(11)));

    harness.ctx.events().process_events().unwrap();
    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, SyncEvent::ConnectionLost { .. })));
    let connects = events
        .iter()
        .filter(|event| matches!(event, SyncEvent::ConnectionSucceeded { .. }))
        .count();
    assert_eq!(connects, 2);
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_from_stale_connection_is_discarded() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "room-1", 10);
    let room = ChannelId::from("room-1");

    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    settle(Duration::from_millis(10)).await;
    let epoch = session.state().unwrap().epoch;

    transport.hold_pages();
    transport.append(message("m11", 11, "late"));
    let stale = tokio::spawn({
        let session = session.clone();
        async move { session.catch_up().await }
    });
    settle(Duration::from_millis(1)).await;

    // The connection the pass started under goes away and comes back
    transport.drop_connection(&room);
    settle(Duration::from_millis(10)).await;
    assert_eq!(session.state().unwrap().epoch, epoch + 1);

    transport.release_pages();
    let report = stale.await.unwrap().unwrap();
    assert_eq!(report, CatchUpReport::Discarded);

    // The pass started by the new connection still lands the event
    settle(Duration::from_millis(10)).await;
    assert!(store.get(&room, "m11").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_live_event_after_drop_does_not_skip_missed_ones() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "room-1", 10);
    let room = ChannelId::from("room-1");

    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    settle(Duration::from_millis(10)).await;
    assert_eq!(session.cursor(), Some(SyncCursor::new(10)));

    transport.append(message("m11", 11, "missed"));
    transport.append(message("m12", 12, "live"));
    assert!(transport.drop_connection(&room));
    // Lands before the new connection has caught up
    assert!(transport.push_event(&room, DeliveryPath::Authoritative, message("m12", 12, "live")));
    settle(Duration::from_millis(10)).await;

    assert_eq!(session.status(), Some(ChannelStatus::Connected));
    assert!(store.get(&room, "m11").is_some());
    assert!(store.get(&room, "m12").is_some());
    assert_eq!(session.cursor(), Some(SyncCursor::new(12)));
    assert!(!session.state().unwrap().catch_up_pending);
}

#[tokio::test(start_paused = true)]
async fn test_live_delete_survives_older_catch_up_page() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "room-1", 10);
    let room = ChannelId::from("room-1");

    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    settle(Duration::from_millis(10)).await;

    let mut delete = RawEvent::update("m20", SyncCursor::new(30), "2", json!({ "content": "gone" }));
    delete.deleted_at = Some(chrono::Utc::now());
    transport.append(message("m20", 20, "gone"));
    transport.append(delete.clone());

    transport.hold_pages();
    let pass = tokio::spawn({
        let session = session.clone();
        async move { session.catch_up().await }
    });
    settle(Duration::from_millis(1)).await;

    // The soft delete arrives live while the page is still in flight
    assert_eq!(
        session.deliver(DeliveryPath::Authoritative, delete),
        Applied::Inserted
    );
    transport.release_pages();
    let report = pass.await.unwrap().unwrap();
    assert_eq!(
        report,
        CatchUpReport::Merged {
            fetched: 2,
            applied: 0,
            truncated: false,
            degraded: None,
        }
    );

    let stored = store.get(&room, "m20").unwrap();
    assert!(stored.deleted_at.is_some());
    assert_eq!(stored.cursor, SyncCursor::new(30));
    assert_eq!(session.cursor(), Some(SyncCursor::new(30)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_broadcast_marks_operation_failed() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    transport.set_broadcast_failing(true);
    let store = Arc::new(MemoryStore::new());
    let room = ChannelId::from("room-1");
    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();

    let err = session
        .send_broadcast(
            PendingOperation::new("tmp-9", "oops@userB@t1"),
            message("tmp-9", 0, "oops").with_author("userB"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));

    let pending = session.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, PendingState::Error);

    // The feed may still have accepted it; the authoritative copy settles the entry
    let confirmed = message("m-9", 5, "oops").with_match_key("oops@userB@t1");
    assert_eq!(
        session.deliver(DeliveryPath::Authoritative, confirmed),
        Applied::Promoted {
            local_id: "tmp-9".into()
        }
    );
    assert!(session.pending().is_empty());
    assert!(store.get(&room, "m-9").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_sent_operation_is_promoted_by_fast_echo() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();
    settle(Duration::from_millis(10)).await;

    session.record_pending(PendingOperation::new("tmp-2", "hi@userA@t2"));
    assert!(session.mark_sent("tmp-2"));

    let echo = message("m-2", 7, "hi").with_match_key("hi@userA@t2");
    assert_eq!(
        session.deliver(DeliveryPath::Fast, echo.clone()),
        Applied::Promoted {
            local_id: "tmp-2".into()
        }
    );
    // Fast delivery never moves the persisted cursor
    assert_eq!(session.cursor(), None);
    assert_eq!(
        session.deliver(DeliveryPath::Authoritative, echo),
        Applied::Reconciled
    );
    assert_eq!(session.cursor(), Some(SyncCursor::new(7)));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_subscribe_is_rejected() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let _session = harness.subscribe("room-1", &transport, &store).await.unwrap();

    let err = harness
        .subscribe("room-1", &transport, &store)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::InvalidState(_)));
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_subscribe_unregisters() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    transport.fail_next_opens(1, SyncError::PermissionDenied("private".into()));
    let store = Arc::new(MemoryStore::new());
    let room = ChannelId::from("private");

    let err = harness
        .subscribe("private", &transport, &store)
        .await
        .err()
        .unwrap();
    assert!(err.is_permission());
    assert!(!harness.ctx.registry().contains(&room));
    assert!(!transport.is_attached(&room));

    // Nothing keeps retrying a rejected channel
    settle(Duration::from_secs(120)).await;
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_releases_channel() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let room = ChannelId::from("room-1");
    let session = harness.subscribe("room-1", &transport, &store).await.unwrap();

    session.unsubscribe().await.unwrap();
    assert!(!harness.ctx.registry().contains(&room));
    assert!(!transport.is_attached(&room));
    assert_eq!(transport.closes(), 1);

    // The channel id is free again
    let again = harness.subscribe("room-1", &transport, &store).await.unwrap();
    assert_eq!(again.status(), Some(ChannelStatus::Connected));
}
