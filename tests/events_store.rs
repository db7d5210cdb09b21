//! Storage-level integration tests for the event store: replaceable
//! tie-breaking, parameterized addressing, tombstone-aware queries.

mod common;

use agora::storage::EventFilter;

use common::{integration_pool, raw_event, signed_event, tag, unix_now};

macro_rules! require_pool {
    () => {
        match integration_pool().await {
            Some(pool) => pool,
            None => {
                eprintln!("skipping: AGORA_TEST_DATABASE_URL not set");
                return;
            }
        }
    };
}

#[tokio::test]
async fn duplicate_insert_is_distinguished() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let ev = signed_event("01", unix_now(), 1, vec![tag(&["t", "nostr"])], "hello");
    store.insert_event(&ev).await.unwrap();
    let err = store.insert_event(&ev).await.unwrap_err();
    assert!(err.is_duplicate());
}

#[tokio::test]
async fn replaceable_newer_created_at_wins() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let old = raw_event(&"aa".repeat(32), "p1", 100, 10000, vec![]);
    let new = raw_event(&"bb".repeat(32), "p1", 200, 10000, vec![]);
    store.upsert_replaceable_event(&old).await.unwrap();
    store.upsert_replaceable_event(&new).await.unwrap();

    let events = store
        .query_events(&EventFilter {
            author: "p1".into(),
            kind: Some(10000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "bb".repeat(32));

    // An older arrival afterwards must be silently ignored.
    let stale = raw_event(&"cc".repeat(32), "p1", 50, 10000, vec![]);
    store.upsert_replaceable_event(&stale).await.unwrap();
    let events = store
        .query_events(&EventFilter {
            author: "p1".into(),
            kind: Some(10000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "bb".repeat(32));
}

#[tokio::test]
async fn replaceable_tie_breaks_on_smaller_id() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let r1 = raw_event(&"bb".repeat(32), "p2", 100, 10000, vec![]);
    let r2 = raw_event(&"aa".repeat(32), "p2", 100, 10000, vec![]);
    store.upsert_replaceable_event(&r1).await.unwrap();
    store.upsert_replaceable_event(&r2).await.unwrap();

    let events = store
        .query_events(&EventFilter {
            author: "p2".into(),
            kind: Some(10000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "aa".repeat(32));

    // The same pair in the opposite arrival order converges to the same row.
    let r3 = raw_event(&"bb".repeat(32), "p3", 100, 10000, vec![]);
    let r4 = raw_event(&"aa".repeat(32), "p3", 100, 10000, vec![]);
    store.upsert_replaceable_event(&r4).await.unwrap();
    store.upsert_replaceable_event(&r3).await.unwrap();
    let events = store
        .query_events(&EventFilter {
            author: "p3".into(),
            kind: Some(10000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "aa".repeat(32));
}

#[tokio::test]
async fn parameterized_addresses_are_scoped_by_d_value() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let p1 = raw_event(&"aa".repeat(32), "p1", 100, 30000, vec![tag(&["d", "room-1"])]);
    let p2 = raw_event(&"bb".repeat(32), "p1", 101, 30000, vec![tag(&["d", "room-1"])]);
    let p3 = raw_event(&"cc".repeat(32), "p1", 100, 30000, vec![tag(&["d", "room-2"])]);
    store.upsert_parameterized_replaceable_event(&p1, "room-1").await.unwrap();
    store.upsert_parameterized_replaceable_event(&p2, "room-1").await.unwrap();
    store.upsert_parameterized_replaceable_event(&p3, "room-2").await.unwrap();

    let events = store
        .query_events(&EventFilter {
            author: "p1".into(),
            kind: Some(30000),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["bb".repeat(32), "cc".repeat(32)]);

    let room1 = store
        .query_events(&EventFilter {
            author: "p1".into(),
            kind: Some(30000),
            tag: "d:room-1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(room1.len(), 1);
    assert_eq!(room1[0].id, "bb".repeat(32));
}

#[tokio::test]
async fn empty_d_is_a_distinct_single_address() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let bare = raw_event(&"aa".repeat(32), "p1", 100, 30001, vec![]);
    let named = raw_event(&"bb".repeat(32), "p1", 100, 30001, vec![tag(&["d", "x"])]);
    let bare2 = raw_event(&"cc".repeat(32), "p1", 200, 30001, vec![]);
    store.upsert_parameterized_replaceable_event(&bare, "").await.unwrap();
    store.upsert_parameterized_replaceable_event(&named, "x").await.unwrap();
    store.upsert_parameterized_replaceable_event(&bare2, "").await.unwrap();

    let events = store
        .query_events(&EventFilter {
            author: "p1".into(),
            kind: Some(30001),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    ids.sort_unstable();
    // The empty address replaced aa with cc; the named address is untouched.
    assert_eq!(ids, vec!["bb".repeat(32), "cc".repeat(32)]);
}

#[tokio::test]
async fn tombstones_hide_events_from_default_queries() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let ev = raw_event(&"dd".repeat(32), "p1", 100, 1, vec![]);
    store.insert_event(&ev).await.unwrap();
    store
        .mark_deleted(&agora::models::DeletedEvent {
            event_id: ev.id.clone(),
            deleted_at: 101,
            deleted_by: "p1".into(),
            reason: "cleanup".into(),
        })
        .await
        .unwrap();

    let hidden = store
        .query_events(&EventFilter {
            author: "p1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(hidden.is_empty());

    let visible = store
        .query_events(&EventFilter {
            author: "p1".into(),
            include_deleted: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert!(store.is_deleted(&ev.id).await.unwrap());
}

#[tokio::test]
async fn query_orders_and_paginates_with_keyset_cursor() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let e1 = raw_event(&"aa".repeat(32), "p1", 100, 1, vec![]);
    let e2 = raw_event(&"bb".repeat(32), "p1", 100, 1, vec![]);
    let e3 = raw_event(&"cc".repeat(32), "p1", 200, 1, vec![]);
    for ev in [&e1, &e2, &e3] {
        store.insert_event(ev).await.unwrap();
    }

    let all = store
        .query_events(&EventFilter {
            author: "p1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["cc".repeat(32), "aa".repeat(32), "bb".repeat(32)]);

    // Plain until is inclusive.
    let until = store
        .query_events(&EventFilter {
            author: "p1".into(),
            until: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(until.len(), 2);

    // Cursor resumes strictly after (created_at, id).
    let page = store
        .query_events(&EventFilter {
            author: "p1".into(),
            until: Some(100),
            until_id: "aa".repeat(32),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "bb".repeat(32));

    let since = store
        .query_events(&EventFilter {
            author: "p1".into(),
            since: Some(150),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(since.len(), 1);
    assert_eq!(since[0].id, "cc".repeat(32));
}

#[tokio::test]
async fn bare_tag_filter_matches_any_name() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let e1 = raw_event(&"aa".repeat(32), "p1", 100, 1, vec![tag(&["t", "nostr"])]);
    let e2 = raw_event(&"bb".repeat(32), "p1", 100, 1, vec![tag(&["h", "nostr"])]);
    let e3 = raw_event(&"cc".repeat(32), "p1", 100, 1, vec![tag(&["t", "other"])]);
    for ev in [&e1, &e2, &e3] {
        store.insert_event(ev).await.unwrap();
    }

    let any = store
        .query_events(&EventFilter {
            author: "p1".into(),
            tag: "nostr".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(any.len(), 2);

    let named = store
        .query_events(&EventFilter {
            author: "p1".into(),
            tag: "t:nostr".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].id, "aa".repeat(32));
}

#[tokio::test]
async fn get_event_roundtrips_tags() {
    let pool = require_pool!();
    let store = agora::storage::EventStore::new(pool);

    let ev = signed_event(
        "02",
        unix_now(),
        1,
        vec![tag(&["t", "nostr"]), tag(&["e", "abc", "relay"])],
        "body",
    );
    store.insert_event(&ev).await.unwrap();
    let loaded = store.get_event(&ev.id).await.unwrap();
    assert_eq!(loaded, ev);

    let missing = store.get_event(&"ee".repeat(32)).await.unwrap_err();
    assert!(matches!(missing, agora::RelayError::NotFound));
}
