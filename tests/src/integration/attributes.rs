//! # Attribute Anti-Entropy Scenarios
//!
//! - A digest ahead of the local table triggers a request from the local
//!   version; the owner answers with exactly the missing range.
//! - Writes, overwrites and removals reach every node.
//! - A restarted node's old attributes do not survive its new incarnation.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spidercast::{
        AttributeEntry, ConnectionId, DigestItem, Message, MetadataMessage, NodeVersion,
        ReplyItem, SpiderCastApi, SpiderCastConfig, TableDelta, TopologyMessage,
    };

    use crate::support::{cluster, converge, remote, shared_clock, Recorded};

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<AttributeEntry> {
        range
            .map(|v| AttributeEntry {
                key: format!("k{v}"),
                version: v,
                value: Some(format!("v{v}").into_bytes()),
            })
            .collect()
    }

    // =========================================================================
    // TEST GROUP 1: Single exchanges
    // =========================================================================

    #[test]
    fn test_digest_ahead_requests_from_local_version() {
        let clock = shared_clock();
        let mut b = Recorded::start("b", 7102, 1, &clock);
        let a = remote("a", 7101, 100);
        let link = ConnectionId(11);
        b.receive(link, &a, Message::Topology(TopologyMessage::ConnectSuccessor));
        b.receive(
            link,
            &a,
            Message::Metadata(MetadataMessage::Reply {
                items: vec![ReplyItem {
                    name: "a".to_string(),
                    version: a.version,
                    table_version: 4,
                    delta: TableDelta::Entries(entries(1..=4)),
                }],
            }),
        );
        assert_eq!(b.node.attribute_of("a", "k4"), Some(b"v4".to_vec()));
        b.transport.take();

        b.receive(
            link,
            &a,
            Message::Metadata(MetadataMessage::Update {
                digest: vec![DigestItem {
                    name: "a".to_string(),
                    version: NodeVersion::new(100, 0),
                    table_version: 6,
                }],
            }),
        );

        let requests: Vec<Vec<DigestItem>> = b
            .take_sent_on(link)
            .into_iter()
            .filter_map(|body| match body {
                Message::Metadata(MetadataMessage::Request { digest }) => Some(digest),
                _ => None,
            })
            .collect();
        assert_eq!(
            requests,
            vec![vec![DigestItem {
                name: "a".to_string(),
                version: NodeVersion::new(100, 0),
                table_version: 4,
            }]]
        );
    }

    #[test]
    fn test_request_answered_with_missing_range() {
        let clock = shared_clock();
        let mut a = Recorded::start("a", 7101, 100, &clock);
        let handle = a.node.attributes();
        for v in 1..=6 {
            handle.set(&format!("k{v}"), format!("v{v}").into_bytes()).unwrap();
        }
        let b = remote("b", 7102, 1);
        let link = ConnectionId(12);
        a.transport.take();

        a.receive(
            link,
            &b,
            Message::Metadata(MetadataMessage::Request {
                digest: vec![DigestItem {
                    name: "a".to_string(),
                    version: NodeVersion::new(100, 0),
                    table_version: 4,
                }],
            }),
        );

        let replies: Vec<Vec<ReplyItem>> = a
            .take_sent_on(link)
            .into_iter()
            .filter_map(|body| match body {
                Message::Metadata(MetadataMessage::Reply { items }) => Some(items),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        let item = &replies[0][0];
        assert_eq!(item.table_version, 6);
        assert_eq!(item.version, NodeVersion::new(100, 0));
        let TableDelta::Entries(mut sent) = item.delta.clone() else {
            panic!("expected entries, got {:?}", item.delta);
        };
        sent.sort_by_key(|e| e.version);
        assert_eq!(sent, entries(5..=6));
    }

    #[test]
    fn test_stale_incarnation_request_is_invalidated() {
        let clock = shared_clock();
        let mut a = Recorded::start("a", 7101, 100, &clock);
        let b = remote("b", 7102, 1);
        let link = ConnectionId(13);

        a.receive(
            link,
            &b,
            Message::Metadata(MetadataMessage::Request {
                digest: vec![DigestItem {
                    name: "a".to_string(),
                    version: NodeVersion::new(99, 0),
                    table_version: 2,
                }],
            }),
        );

        let invalidated = a.take_sent_on(link).into_iter().any(|body| {
            matches!(
                body,
                Message::Metadata(MetadataMessage::Reply { items })
                    if items.len() == 1 && items[0].delta == TableDelta::Invalidated
            )
        });
        assert!(invalidated);
    }

    // =========================================================================
    // TEST GROUP 2: Cluster convergence
    // =========================================================================

    #[test]
    fn test_attributes_converge_across_cluster() {
        let mut net = cluster(6);
        converge(&mut net, Duration::from_secs(5));

        for name in net.names() {
            let handle = net.node(&name).attributes();
            handle.set("owner", name.clone().into_bytes()).unwrap();
            handle.set("load", b"0.5".to_vec()).unwrap();
        }

        assert!(net.run_until(Duration::from_secs(5), |net| {
            net.names().iter().all(|name| {
                net.attribute_everywhere(name, "owner", name.as_bytes())
                    && net.attribute_everywhere(name, "load", b"0.5")
            })
        }));
    }

    #[test]
    fn test_overwrite_and_removal_propagate() {
        let mut net = cluster(5);
        converge(&mut net, Duration::from_secs(5));
        let handle = net.node("n2").attributes();
        handle.set("role", b"leader".to_vec()).unwrap();
        handle.set("epoch", b"1".to_vec()).unwrap();
        assert!(net.run_until(Duration::from_secs(3), |net| {
            net.attribute_everywhere("n2", "epoch", b"1")
        }));

        handle.set("epoch", b"2".to_vec()).unwrap();
        handle.remove("role").unwrap();

        assert!(net.run_until(Duration::from_secs(3), |net| {
            net.attribute_everywhere("n2", "epoch", b"2")
                && net.nodes().all(|sim| sim.node.attribute_of("n2", "role").is_none())
        }));
        let version = handle.version();
        assert!(net.nodes().all(|sim| {
            sim.node
                .membership()
                .view()
                .get("n2")
                .is_some_and(|entry| entry.table.lock().version() == version)
        }));
    }

    #[test]
    fn test_restarted_node_starts_with_fresh_attributes() {
        let mut net = cluster(4);
        converge(&mut net, Duration::from_secs(5));
        net.node("n3").attributes().set("build", b"old".to_vec()).unwrap();
        assert!(net.run_until(Duration::from_secs(3), |net| {
            net.attribute_everywhere("n3", "build", b"old")
        }));

        net.kill("n3");
        let config = SpiderCastConfig {
            bootstrap: vec![net.sim("n1").endpoint],
            ..SpiderCastConfig::for_testing()
        };
        net.add_node_with("n3", 2, config);
        net.start("n3");

        assert!(net.run_until(Duration::from_secs(5), |net| {
            net.views_converged()
                && net.nodes().all(|sim| {
                    sim.node
                        .membership()
                        .view()
                        .get("n3")
                        .is_some_and(|e| e.version.incarnation == 2)
                })
        }));
        assert!(net.nodes().all(|sim| sim.node.attribute_of("n3", "build").is_none()));
    }
}
