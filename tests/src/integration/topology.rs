//! # Overlay Topology Scenarios
//!
//! - Random degrees settle inside `[D, D+M]` on small and larger networks.
//! - Crossed random requests between two nodes leave exactly one link per
//!   side, each riding on the connection the smaller name dialed.
//! - Random links are symmetric and the routing listener mirrors them.
//! - The structured overlay reaches its target out-degree.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spidercast::testing::{Outbound, SimNetwork};
    use spidercast::{
        ConnectionId, LinkType, Message, MessageSource, MetadataMessage, SpiderCastApi,
        SpiderCastConfig, TransportEvent,
    };

    use crate::support::{
        cluster, cluster_with, converge, degrees_within_bounds, random_connection, random_degrees,
        random_links_symmetric, routing_neighbors, shared_clock, Recorded,
    };

    // =========================================================================
    // TEST GROUP 1: Degree bounds
    // =========================================================================

    #[test]
    fn test_random_degree_within_bounds_small_network() {
        // N = D + 3 with D = 2, M = 1.
        let mut net = cluster(5);
        converge(&mut net, Duration::from_secs(5));

        let settled = net.run_until(Duration::from_secs(5), |net| {
            degrees_within_bounds(net) && random_links_symmetric(net)
        });
        assert!(settled, "degrees: {:?}", random_degrees(&net));
    }

    #[test]
    fn test_random_degree_within_bounds_larger_network() {
        let config = SpiderCastConfig {
            random_degree: 3,
            random_margin: 2,
            ..SpiderCastConfig::for_testing()
        };
        let mut net = cluster_with(12, config);
        converge(&mut net, Duration::from_secs(10));

        let settled = net.run_until(Duration::from_secs(10), degrees_within_bounds);
        assert!(settled, "degrees: {:?}", random_degrees(&net));
    }

    // =========================================================================
    // TEST GROUP 2: Crossed random requests
    // =========================================================================

    const DIALED: ConnectionId = ConnectionId(1);
    const NODE1_INBOUND: ConnectionId = ConnectionId(2001);
    const NODE2_INBOUND: ConnectionId = ConnectionId(1001);

    /// Two recorded nodes wired back to back. Each dials the other on its own
    /// connection 1; node1 sees node2's dial as 2001, node2 sees node1's as 1001.
    struct Pair {
        node1: Recorded,
        node2: Recorded,
    }

    impl Pair {
        fn new() -> Self {
            let clock = shared_clock();
            let mut node1 = Recorded::start("node1", 7201, 1, &clock);
            let mut node2 = Recorded::start("node2", 7202, 1, &clock);
            let (record1, record2) = (node1.record(), node2.record());
            let hello = || Message::Metadata(MetadataMessage::Update { digest: Vec::new() });
            node1.receive(NODE1_INBOUND, &record2, hello());
            node2.receive(NODE2_INBOUND, &record1, hello());
            Self { node1, node2 }
        }

        fn relay(&mut self, rounds: usize) {
            for _ in 0..rounds {
                self.node1.node.poll();
                self.node2.node.poll();
                let from1 = self.node1.transport.take();
                let from2 = self.node2.transport.take();
                if from1.is_empty() && from2.is_empty() {
                    return;
                }
                Self::deliver(&mut self.node1, &mut self.node2, from1, |c| match c {
                    DIALED => Some(NODE2_INBOUND),
                    NODE1_INBOUND => Some(DIALED),
                    _ => None,
                });
                Self::deliver(&mut self.node2, &mut self.node1, from2, |c| match c {
                    DIALED => Some(NODE1_INBOUND),
                    NODE2_INBOUND => Some(DIALED),
                    _ => None,
                });
            }
        }

        fn deliver(
            from: &mut Recorded,
            to: &mut Recorded,
            calls: Vec<Outbound>,
            map: impl Fn(ConnectionId) -> Option<ConnectionId>,
        ) {
            for call in calls {
                match call {
                    Outbound::Connect { connection, .. } => {
                        from.node
                            .handle_event(TransportEvent::ConnectSucceeded { connection });
                    }
                    Outbound::Send {
                        connection,
                        envelope,
                    } => {
                        if let Some(remote) = map(connection) {
                            to.node.handle_event(TransportEvent::Received {
                                source: MessageSource::Connection(remote),
                                envelope,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_crossed_random_requests_leave_one_link() {
        let mut pair = Pair::new();

        pair.relay(20);

        assert_eq!(random_link(&pair.node1, "node2"), Some(DIALED));
        assert_eq!(random_link(&pair.node2, "node1"), Some(NODE2_INBOUND));
        assert_eq!(pair.node1.node.topology().random().len(), 1);
        assert_eq!(pair.node2.node.topology().random().len(), 1);
    }

    fn random_link(recorded: &Recorded, peer: &str) -> Option<ConnectionId> {
        recorded
            .node
            .topology()
            .random()
            .get(peer)
            .map(|neighbor| neighbor.connection)
    }

    // =========================================================================
    // TEST GROUP 3: Symmetry and routing
    // =========================================================================

    #[test]
    fn test_routing_listener_mirrors_random_links() {
        let mut net = cluster(6);
        converge(&mut net, Duration::from_secs(5));
        assert!(net.run_until(Duration::from_secs(5), |net| {
            degrees_within_bounds(net) && random_links_symmetric(net)
        }));
        // Let in-flight link changes reach the listeners.
        net.run_for(Duration::from_millis(100));

        for name in net.names() {
            let mut expected: Vec<String> = net
                .node(&name)
                .topology()
                .random()
                .iter()
                .map(|n| n.name().to_string())
                .collect();
            expected.sort();
            let mut seen = routing_neighbors(&net, &name, LinkType::Random);
            seen.sort();
            assert_eq!(seen, expected, "routing neighbors of {name}");
        }
    }

    #[test]
    fn test_each_random_link_has_one_connection_per_side() {
        let mut net = cluster(5);
        converge(&mut net, Duration::from_secs(5));
        assert!(net.run_until(Duration::from_secs(5), random_links_symmetric));

        for sim in net.nodes() {
            let local = sim.node.local_node().name();
            for neighbor in sim.node.topology().random().iter() {
                assert!(random_connection(&net, neighbor.name(), local).is_some());
            }
        }
    }

    // =========================================================================
    // TEST GROUP 4: Structured overlay
    // =========================================================================

    fn structured_within_bounds(net: &SimNetwork) -> bool {
        net.nodes().all(|sim| {
            let config = sim.node.config();
            let out = sim.node.topology().structured_out().len();
            out >= config.structured_degree
                && out <= config.structured_degree + config.structured_margin
        })
    }

    #[test]
    fn test_structured_overlay_reaches_degree() {
        let config = SpiderCastConfig {
            structured_degree: 2,
            ..SpiderCastConfig::for_testing()
        };
        let mut net = cluster_with(8, config);
        converge(&mut net, Duration::from_secs(5));

        assert!(net.run_until(Duration::from_secs(5), structured_within_bounds));
        for name in net.names() {
            let held = routing_neighbors(&net, &name, LinkType::Structured);
            assert!(!held.is_empty(), "{name} has no structured neighbors");
        }
    }
}
