//! Bus scenarios shared by every stream store backend.
//!
//! Each scenario takes a fresh bus and a unique stream prefix so runs never
//! collide on a long-lived server.

use std::time::Duration;

use omni_bus::bus::{BusError, MessageBus, MessageCanonical, ReadOptions, DATA_FIELD};
use omni_bus::storage::{EntryId, StreamStore};
use serde_json::json;

pub fn test_prefix() -> String {
    format!("test_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn is_entry_id(id: &EntryId) -> bool {
    let s = id.to_string();
    match s.split_once('-') {
        Some((ms, seq)) => {
            !ms.is_empty()
                && !seq.is_empty()
                && ms.bytes().all(|b| b.is_ascii_digit())
                && seq.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

pub async fn end_to_end(bus: &MessageBus, prefix: &str) {
    let stream = format!("{prefix}.messages");
    let trace = format!("{prefix}-t1");
    let msg = MessageCanonical::traced(&trace, json!({"foo": "bar"}));

    let id = bus.publish(&stream, &msg, None).await.unwrap().unwrap();
    assert!(is_entry_id(&id), "unexpected id {id}");
    assert!(bus.publish(&stream, &msg, None).await.unwrap().is_none());

    let opts = ReadOptions::new(&stream, "g1", "c1");
    let items = bus.read(&opts).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, id);
    assert_eq!(items[0].message.trace_id(), Some(trace.as_str()));
    assert_eq!(items[0].message.payload, json!({"foo": "bar"}));
    assert!(items[0].ack().await.unwrap());

    let again = bus
        .read(&opts.with_block(Duration::from_millis(10)))
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(bus.pending_count(&stream, "g1").await.unwrap(), 0);
}

pub async fn untraced_messages_always_append(bus: &MessageBus, prefix: &str) {
    let stream = format!("{prefix}.untraced");
    let msg = MessageCanonical::new(json!({"same": true}));

    let a = bus.publish(&stream, &msg, None).await.unwrap().unwrap();
    let b = bus.publish(&stream, &msg, None).await.unwrap().unwrap();
    assert!(a < b);

    let items = bus
        .read(&ReadOptions::new(&stream, "g", "c").with_count(10))
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
}

pub async fn competing_consumers_get_disjoint_entries(bus: &MessageBus, prefix: &str) {
    let stream = format!("{prefix}.compete");
    for i in 0..6 {
        bus.publish(&stream, &MessageCanonical::new(json!(i)), None)
            .await
            .unwrap();
    }

    let first = bus
        .read(&ReadOptions::new(&stream, "workers", "c1").with_count(3))
        .await
        .unwrap();
    let second = bus
        .read(&ReadOptions::new(&stream, "workers", "c2").with_count(10))
        .await
        .unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 3);
    for item in &first {
        assert!(second.iter().all(|other| other.id != item.id));
    }
}

pub async fn acked_entry_not_redelivered(bus: &MessageBus, prefix: &str) {
    let stream = format!("{prefix}.acked");
    bus.publish(&stream, &MessageCanonical::new(json!("once")), None)
        .await
        .unwrap();

    let items = bus.read(&ReadOptions::new(&stream, "g", "c1")).await.unwrap();
    assert_eq!(items.len(), 1);
    items[0].ack().await.unwrap();

    let other = bus.read(&ReadOptions::new(&stream, "g", "c2")).await.unwrap();
    assert!(other.is_empty());
    let claimed = bus
        .claim_stale(&ReadOptions::new(&stream, "g", "c2"), Duration::ZERO)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

pub async fn malformed_entry_surfaces(bus: &MessageBus, prefix: &str) {
    let stream = format!("{prefix}.malformed");
    let bad = bus
        .store()
        .append(&stream, &[(DATA_FIELD, "{broken")], None)
        .await
        .unwrap();

    let err = bus
        .read(&ReadOptions::new(&stream, "g", "c1"))
        .await
        .unwrap_err();
    match err {
        BusError::MalformedEntry { id, .. } => assert_eq!(id, bad),
        other => panic!("expected MalformedEntry, got {other:?}"),
    }
    assert_eq!(bus.pending_count(&stream, "g").await.unwrap(), 1);
    assert!(bus.ack(&stream, "g", bad).await.unwrap());
}

pub async fn stale_entries_can_be_claimed(bus: &MessageBus, prefix: &str) {
    let stream = format!("{prefix}.stale");
    bus.publish(&stream, &MessageCanonical::new(json!("orphan")), None)
        .await
        .unwrap();

    let lost = bus
        .read(&ReadOptions::new(&stream, "g", "crashed"))
        .await
        .unwrap();
    assert_eq!(lost.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let claimed = bus
        .claim_stale(
            &ReadOptions::new(&stream, "g", "rescuer").with_count(10),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, lost[0].id);
    claimed[0].ack().await.unwrap();
    assert_eq!(bus.pending_count(&stream, "g").await.unwrap(), 0);
}
