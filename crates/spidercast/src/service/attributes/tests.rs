use super::*;
use crate::domain::messages::{DigestItem, Message, MetadataMessage, ReplyItem, TableDelta};
use crate::domain::{
    AttributeEntry, AttributeTable, ConnectionId, FatalErrorCode, NodeVersion, SharedTable,
    SpiderCastConfig,
};
use crate::service::context::Effect;
use crate::service::membership::MembershipService;
use crate::service::scheduler::{TaskKind, TaskState};
use crate::testing::support::{record, Harness};
use std::time::Duration;

struct Fixture {
    h: Harness,
    membership: MembershipService,
    manager: AttributeManager,
    local_table: SharedTable,
}

fn fixture(name: &str, incarnation: i64) -> Fixture {
    let mut h = Harness::new(name, 7000, SpiderCastConfig::for_testing());
    h.ctx.version = NodeVersion::new(incarnation, 0);
    let local_table = AttributeTable::shared();
    let membership = MembershipService::new(&h.ctx, local_table.clone());
    Fixture {
        h,
        membership,
        manager: AttributeManager::new(local_table.clone()),
        local_table,
    }
}

impl Fixture {
    fn learn(&mut self, name: &str, incarnation: i64) {
        self.membership
            .merge_records(&mut self.h.ctx, &[record(name, 7100, incarnation, 0)], &[]);
        self.h.ctx.effects.clear();
    }

    fn table_of(&self, name: &str) -> SharedTable {
        self.membership.view().get(name).unwrap().table.clone()
    }
}

fn entry(key: &str, version: u64, value: &str) -> AttributeEntry {
    AttributeEntry {
        key: key.to_string(),
        version,
        value: Some(value.as_bytes().to_vec()),
    }
}

fn item(name: &str, incarnation: i64, table_version: u64) -> DigestItem {
    DigestItem {
        name: name.to_string(),
        version: NodeVersion::new(incarnation, 0),
        table_version,
    }
}

fn requests(h: &Harness) -> Vec<(ConnectionId, Vec<DigestItem>)> {
    h.transport
        .sent()
        .into_iter()
        .filter_map(|(connection, envelope)| match envelope.body {
            Message::Metadata(MetadataMessage::Request { digest }) => Some((connection, digest)),
            _ => None,
        })
        .collect()
}

fn replies(h: &Harness) -> Vec<Vec<ReplyItem>> {
    h.transport
        .sent_bodies()
        .into_iter()
        .filter_map(|body| match body {
            Message::Metadata(MetadataMessage::Reply { items }) => Some(items),
            _ => None,
        })
        .collect()
}

fn updates(h: &Harness) -> Vec<Vec<DigestItem>> {
    h.transport
        .sent_bodies()
        .into_iter()
        .filter_map(|body| match body {
            Message::Metadata(MetadataMessage::Update { digest }) => Some(digest),
            _ => None,
        })
        .collect()
}

// =============================================================================
// TEST GROUP 1: Digest handling
// =============================================================================

#[test]
fn test_digest_ahead_of_local_table_requests_from_local_version() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.table_of("a").lock().merge(4, &[entry("k", 4, "v")]);

    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 6)])
        .unwrap();

    assert_eq!(requests(&f.h), vec![(ConnectionId(3), vec![item("a", 100, 4)])]);
    let pending = f.table_of("a").lock().pending().cloned().unwrap();
    assert_eq!(pending.version, 6);
    assert_eq!(pending.target.as_deref(), Some("x"));
}

#[test]
fn test_digest_not_ahead_requests_nothing() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.table_of("a").lock().merge(6, &[]);

    f.manager
        .on_update(
            &mut f.h.ctx,
            &f.membership,
            "x",
            ConnectionId(3),
            &[item("a", 100, 6), item("b", 1, 9)],
        )
        .unwrap();

    assert!(requests(&f.h).is_empty());
}

#[test]
fn test_outstanding_request_suppresses_duplicates_until_timeout() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    let digest = [item("a", 100, 6)];

    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &digest)
        .unwrap();
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "y", ConnectionId(4), &digest)
        .unwrap();
    assert_eq!(requests(&f.h).len(), 1);

    f.h.clock
        .advance(f.h.ctx.config.attribute_request_timeout + Duration::from_millis(1));
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "y", ConnectionId(4), &digest)
        .unwrap();
    assert_eq!(requests(&f.h).len(), 2);
    assert_eq!(requests(&f.h)[1].0, ConnectionId(4));
}

#[test]
fn test_digest_for_older_incarnation_or_unknown_node_ignored() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);

    f.manager
        .on_update(
            &mut f.h.ctx,
            &f.membership,
            "x",
            ConnectionId(3),
            &[item("a", 99, 8), item("zz", 1, 3)],
        )
        .unwrap();

    assert!(requests(&f.h).is_empty());
}

#[test]
fn test_digest_for_newer_incarnation_of_live_node_is_fatal() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);

    let err = f
        .manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 101, 1)])
        .unwrap_err();

    assert_eq!(err.code, FatalErrorCode::IncarnationAhead);
}

#[test]
fn test_failed_request_send_clears_pending() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.h.transport.fail_sends(true);

    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 2)])
        .unwrap();

    assert!(f.table_of("a").lock().pending().is_none());
}

// =============================================================================
// TEST GROUP 2: Requests and replies
// =============================================================================

#[test]
fn test_request_is_answered_with_entries_newer_than_requested() {
    let mut f = fixture("a", 100);
    for version in 1..=6 {
        f.local_table
            .lock()
            .set(&format!("k{version}"), version.to_string().into_bytes())
            .unwrap();
    }

    f.manager
        .on_request(&f.h.ctx, &f.membership, "b", ConnectionId(2), &[item("a", 100, 4)])
        .unwrap();

    let items = replies(&f.h).remove(0);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].table_version, 6);
    assert_eq!(
        items[0].delta,
        TableDelta::Entries(vec![entry("k5", 5, "5"), entry("k6", 6, "6")])
    );
}

#[test]
fn test_request_at_current_version_gets_empty_delta() {
    let mut f = fixture("a", 100);
    f.local_table.lock().set("k", b"v".to_vec()).unwrap();

    f.manager
        .on_request(&f.h.ctx, &f.membership, "b", ConnectionId(2), &[item("a", 100, 1)])
        .unwrap();

    let items = replies(&f.h).remove(0);
    assert_eq!(items[0].delta, TableDelta::Entries(Vec::new()));
    assert_eq!(items[0].entry_count(), 0);
}

#[test]
fn test_request_for_departed_or_older_incarnation_is_invalidated() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.learn("c", 5);
    f.membership
        .node_left(&mut f.h.ctx, "c", NodeVersion::new(5, 0), &[]);

    f.manager
        .on_request(
            &f.h.ctx,
            &f.membership,
            "x",
            ConnectionId(2),
            &[item("a", 99, 0), item("c", 5, 0), item("zz", 1, 0)],
        )
        .unwrap();

    let items = replies(&f.h).remove(0);
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.delta == TableDelta::Invalidated));
    assert!(items.iter().all(|i| i.entry_count() == -1));
}

#[test]
fn test_reply_merges_delta_and_schedules_notification() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 2)])
        .unwrap();

    let reply = ReplyItem {
        name: "a".to_string(),
        version: NodeVersion::new(100, 0),
        table_version: 2,
        delta: TableDelta::Entries(vec![entry("k1", 1, "x"), entry("k2", 2, "y")]),
    };
    f.manager
        .on_reply(&mut f.h.ctx, &f.membership, "x", &[reply], &[])
        .unwrap();

    let table = f.table_of("a");
    let table = table.lock();
    assert_eq!(table.version(), 2);
    assert_eq!(table.get("k2"), Some(&b"y"[..]));
    assert!(table.pending().is_none());
    assert!(matches!(
        f.h.ctx.scheduler.state(TaskKind::AttributeNotify),
        TaskState::Scheduled(_)
    ));
}

#[test]
fn test_invalidated_targeted_request_is_pushed_to_all_peers() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 2)])
        .unwrap();
    f.h.transport.take();

    let invalidated = ReplyItem {
        name: "a".to_string(),
        version: NodeVersion::new(100, 0),
        table_version: 0,
        delta: TableDelta::Invalidated,
    };
    let peers = vec![
        ("x".to_string(), ConnectionId(3)),
        ("y".to_string(), ConnectionId(4)),
    ];
    f.manager
        .on_reply(&mut f.h.ctx, &f.membership, "x", &[invalidated.clone()], &peers)
        .unwrap();

    assert_eq!(
        requests(&f.h),
        vec![
            (ConnectionId(3), vec![item("a", 100, 0)]),
            (ConnectionId(4), vec![item("a", 100, 0)]),
        ]
    );
    let pending = f.table_of("a").lock().pending().cloned().unwrap();
    assert_eq!(pending.target, None);

    // An invalidation of the push request is not pushed again.
    f.h.transport.take();
    f.manager
        .on_reply(&mut f.h.ctx, &f.membership, "y", &[invalidated], &peers)
        .unwrap();
    assert!(requests(&f.h).is_empty());
    assert!(f.table_of("a").lock().pending().is_none());
}

#[test]
fn test_reply_for_older_incarnation_changes_nothing() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 2)])
        .unwrap();

    let stale = ReplyItem {
        name: "a".to_string(),
        version: NodeVersion::new(99, 0),
        table_version: 2,
        delta: TableDelta::Entries(vec![entry("k", 2, "old")]),
    };
    f.manager
        .on_reply(&mut f.h.ctx, &f.membership, "x", &[stale], &[])
        .unwrap();

    let table = f.table_of("a");
    let table = table.lock();
    assert_eq!(table.version(), 0);
    assert_eq!(table.get("k"), None);
    let pending = table.pending().cloned().unwrap();
    assert_eq!(pending.version, 2);
    assert_eq!(pending.target.as_deref(), Some("x"));
}

#[test]
fn test_reply_for_newer_incarnation_of_live_node_is_fatal() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);

    let ahead = ReplyItem {
        name: "a".to_string(),
        version: NodeVersion::new(101, 0),
        table_version: 1,
        delta: TableDelta::Entries(vec![entry("k", 1, "v")]),
    };
    let err = f
        .manager
        .on_reply(&mut f.h.ctx, &f.membership, "x", &[ahead], &[])
        .unwrap_err();

    assert_eq!(err.code, FatalErrorCode::IncarnationAhead);
    assert_eq!(f.table_of("a").lock().version(), 0);
}

#[test]
fn test_reply_for_history_node_only_clears_pending() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 2)])
        .unwrap();
    f.membership
        .node_left(&mut f.h.ctx, "a", NodeVersion::new(100, 0), &[]);

    let reply = ReplyItem {
        name: "a".to_string(),
        version: NodeVersion::new(100, 0),
        table_version: 2,
        delta: TableDelta::Entries(vec![entry("k", 2, "v")]),
    };
    f.manager
        .on_reply(&mut f.h.ctx, &f.membership, "x", &[reply], &[])
        .unwrap();

    let retained = f.membership.history().get("a").unwrap().table.clone().unwrap();
    let retained = retained.lock();
    assert!(retained.pending().is_none());
    assert_eq!(retained.version(), 0);
}

// =============================================================================
// TEST GROUP 3: Update task and notifications
// =============================================================================

#[test]
fn test_send_updates_announces_unsent_versions_once() {
    let mut f = fixture("b", 1);
    f.local_table.lock().set("role", b"broker".to_vec()).unwrap();
    let peers = vec![("x".to_string(), ConnectionId(3))];

    f.manager.send_updates(&mut f.h.ctx, &f.membership, &peers);
    f.manager.send_updates(&mut f.h.ctx, &f.membership, &peers);

    assert_eq!(updates(&f.h), vec![vec![item("b", 1, 1)]]);
    assert_eq!(f.local_table.lock().version_sent(), 1);
}

#[test]
fn test_send_updates_without_peers_keeps_version_unsent() {
    let mut f = fixture("b", 1);
    f.local_table.lock().set("role", b"broker".to_vec()).unwrap();

    f.manager.send_updates(&mut f.h.ctx, &f.membership, &[]);

    assert!(updates(&f.h).is_empty());
    assert_eq!(f.local_table.lock().version_sent(), 0);
    assert!(matches!(
        f.h.ctx.scheduler.state(TaskKind::AttributeNotify),
        TaskState::Scheduled(_)
    ));
}

#[test]
fn test_full_digest_covers_every_table() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.table_of("a").lock().merge(3, &[]);

    f.manager
        .send_full_digest(&mut f.h.ctx, &f.membership, "a", ConnectionId(8));

    assert_eq!(updates(&f.h), vec![vec![item("a", 100, 3), item("b", 1, 0)]]);
}

#[test]
fn test_first_notification_is_full_then_incremental() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);

    let first = f.manager.prepare_notification(&mut f.membership).unwrap();
    assert!(first.full);
    assert_eq!(first.nodes.len(), 2);
    assert!(f.manager.prepare_notification(&mut f.membership).is_none());

    f.table_of("a").lock().merge(1, &[entry("k", 1, "v")]);
    f.learn("c", 3);
    f.membership
        .node_left(&mut f.h.ctx, "a", NodeVersion::new(100, 0), &[]);

    let next = f.manager.prepare_notification(&mut f.membership).unwrap();
    assert!(!next.full);
    assert_eq!(
        next.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
        vec!["c"]
    );
    assert_eq!(next.departed, vec!["a".to_string()]);

    f.manager.request_full_view();
    let full = f.manager.prepare_notification(&mut f.membership).unwrap();
    assert!(full.full);
    assert_eq!(full.nodes.len(), 2);
}

// =============================================================================
// TEST GROUP 4: Recovery from lost messages
// =============================================================================

#[test]
fn test_failed_reply_is_announced_again() {
    let mut f = fixture("a", 100);
    f.local_table.lock().set("zone", b"eu-1".to_vec()).unwrap();
    let peers = vec![("b".to_string(), ConnectionId(2))];
    f.manager.send_updates(&mut f.h.ctx, &f.membership, &peers);
    assert_eq!(f.local_table.lock().version_sent(), 1);

    f.h.transport.fail_sends(true);
    f.manager
        .on_request(&f.h.ctx, &f.membership, "b", ConnectionId(2), &[item("a", 100, 0)])
        .unwrap();
    f.h.transport.fail_sends(false);
    f.manager.send_updates(&mut f.h.ctx, &f.membership, &peers);

    assert_eq!(updates(&f.h), vec![vec![item("a", 100, 1)], vec![item("a", 100, 1)]]);
    assert_eq!(f.local_table.lock().version_sent(), 1);
}

#[test]
fn test_expired_request_is_pushed_to_all_peers() {
    let mut f = fixture("b", 1);
    f.learn("a", 100);
    f.manager
        .on_update(&mut f.h.ctx, &f.membership, "x", ConnectionId(3), &[item("a", 100, 2)])
        .unwrap();
    f.h.transport.take();
    let peers = vec![
        ("x".to_string(), ConnectionId(3)),
        ("y".to_string(), ConnectionId(4)),
    ];

    f.manager.send_updates(&mut f.h.ctx, &f.membership, &peers);
    assert!(requests(&f.h).is_empty());

    f.h.clock
        .advance(f.h.ctx.config.attribute_request_timeout + Duration::from_millis(1));
    f.manager.send_updates(&mut f.h.ctx, &f.membership, &peers);

    assert_eq!(
        requests(&f.h),
        vec![
            (ConnectionId(3), vec![item("a", 100, 0)]),
            (ConnectionId(4), vec![item("a", 100, 0)]),
        ]
    );
    let pending = f.table_of("a").lock().pending().cloned().unwrap();
    assert_eq!(pending.version, 2);
    assert_eq!(pending.target, None);
}

#[test]
fn test_failed_full_digest_asks_for_resync() {
    let mut f = fixture("b", 1);
    f.h.transport.fail_sends(true);

    f.manager
        .send_full_digest(&mut f.h.ctx, &f.membership, "a", ConnectionId(8));

    assert!(f
        .h
        .ctx
        .effects
        .iter()
        .any(|effect| matches!(effect, Effect::ResyncFailed(ConnectionId(8)))));
}

// =============================================================================
// TEST GROUP 5: End-to-end exchange
// =============================================================================

#[test]
fn test_digest_request_reply_brings_replica_up_to_date() {
    let mut owner = fixture("a", 100);
    for version in 1..=6 {
        owner
            .local_table
            .lock()
            .set(&format!("k{version}"), vec![version as u8])
            .unwrap();
    }
    let mut replica = fixture("b", 1);
    replica.learn("a", 100);
    replica
        .table_of("a")
        .lock()
        .merge(4, &owner.local_table.lock().delta_since(0)[..4]);

    replica
        .manager
        .on_update(
            &mut replica.h.ctx,
            &replica.membership,
            "a",
            ConnectionId(1),
            &[item("a", 100, 6)],
        )
        .unwrap();
    let (_, request) = requests(&replica.h).remove(0);
    assert_eq!(request, vec![item("a", 100, 4)]);

    owner
        .manager
        .on_request(&owner.h.ctx, &owner.membership, "b", ConnectionId(1), &request)
        .unwrap();
    let reply = replies(&owner.h).remove(0);
    assert_eq!(reply[0].entry_count(), 2);

    replica
        .manager
        .on_reply(&mut replica.h.ctx, &replica.membership, "a", &reply, &[])
        .unwrap();
    let table = replica.table_of("a");
    assert_eq!(table.lock().snapshot(), owner.local_table.lock().snapshot());
    assert_eq!(table.lock().version(), 6);
}
