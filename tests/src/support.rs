//! Cluster builders and overlay assertions shared by the scenarios.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use spidercast::testing::{ManualClock, RecordingSink, RecordingTransport, SimNetwork};
use spidercast::{
    ConnectionId, Envelope, LinkType, Message, MessageSource, NoOpRoutingListener, NodeId,
    NodePorts, NodeRecord, NodeVersion, SpiderCast, SpiderCastApi, SpiderCastConfig, Timestamp,
    TransportEvent,
};

/// Route node logs through the test harness capture.
pub fn init_logging() {
    spidercast_telemetry::init_test_tracing("warn");
}

/// Started network of `size` nodes named `n0`, `n1`, ... with `config`.
pub fn cluster_with(size: usize, config: SpiderCastConfig) -> SimNetwork {
    init_logging();
    let mut net = SimNetwork::new(config);
    for i in 0..size {
        net.add_node(&format!("n{i}"));
    }
    net.start_all();
    tracing::info!(size, "simulated cluster started");
    net
}

pub fn cluster(size: usize) -> SimNetwork {
    cluster_with(size, SpiderCastConfig::for_testing())
}

/// Run until every view holds exactly the nodes on the network.
///
/// # Panics
///
/// Panics when the views do not converge within `limit`.
pub fn converge(net: &mut SimNetwork, limit: Duration) {
    if !net.run_until(limit, SimNetwork::views_converged) {
        let views: Vec<(String, Vec<String>)> = net
            .nodes()
            .map(|sim| (sim.node.local_node().name().to_string(), sim.node.view_names()))
            .collect();
        panic!("views did not converge: {views:?}");
    }
}

/// Ring successor each node should hold: the next name in order, wrapping.
pub fn expected_successors(net: &SimNetwork) -> Vec<(String, String)> {
    let names = net.names();
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), names[(i + 1) % names.len()].clone()))
        .collect()
}

/// Whether every node is linked to its ring successor.
pub fn ring_complete(net: &SimNetwork) -> bool {
    net.names().len() > 1
        && expected_successors(net).into_iter().all(|(name, successor)| {
            net.node(&name)
                .topology()
                .successor()
                .is_some_and(|s| s.name() == successor)
        })
}

/// Random degree of every node, in name order.
pub fn random_degrees(net: &SimNetwork) -> Vec<(String, usize)> {
    net.nodes()
        .map(|sim| {
            (
                sim.node.local_node().name().to_string(),
                sim.node.topology().random().len(),
            )
        })
        .collect()
}

/// Whether every random degree lies in `[D, D+M]`.
pub fn degrees_within_bounds(net: &SimNetwork) -> bool {
    net.nodes().all(|sim| {
        let config = sim.node.config();
        let degree = sim.node.topology().random().len();
        degree >= config.random_degree && degree <= config.random_upper_bound()
    })
}

/// Whether every random link is held by both of its ends.
pub fn random_links_symmetric(net: &SimNetwork) -> bool {
    net.nodes().all(|sim| {
        let local = sim.node.local_node().name();
        sim.node.topology().random().iter().all(|neighbor| {
            net.contains(neighbor.name())
                && net
                    .node(neighbor.name())
                    .topology()
                    .random()
                    .contains(local)
        })
    })
}

/// Neighbors the routing listener of `name` currently holds for `link`.
pub fn routing_neighbors(net: &SimNetwork, name: &str, link: LinkType) -> Vec<String> {
    net.sim(name)
        .routing
        .neighbors()
        .into_iter()
        .filter(|(_, l)| *l == link)
        .map(|(n, _)| n)
        .collect()
}

/// Connection the random link of `name` to `peer` rides on.
pub fn random_connection(net: &SimNetwork, name: &str, peer: &str) -> Option<ConnectionId> {
    net.node(name)
        .topology()
        .random()
        .get(peer)
        .map(|n| n.connection)
}

// =============================================================================
// RECORDED NODES
// =============================================================================

pub fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A node whose outbound traffic is recorded instead of delivered.
pub struct Recorded {
    pub node: SpiderCast,
    pub transport: Arc<RecordingTransport>,
    pub events: Arc<RecordingSink>,
    pub port: u16,
}

impl Recorded {
    /// Started node `name` at `127.0.0.1:port`.
    pub fn start(name: &str, port: u16, incarnation: i64, clock: &ManualClock) -> Self {
        init_logging();
        let transport = Arc::new(RecordingTransport::new());
        let events = Arc::new(RecordingSink::new());
        let ports = NodePorts {
            transport: transport.clone(),
            clock: Box::new(clock.clone()),
            events: events.clone(),
            routing: Arc::new(NoOpRoutingListener),
        };
        let local = NodeId::new(name, vec![endpoint(port)]);
        let config = SpiderCastConfig::for_testing();
        let mut node = match SpiderCast::new(local, incarnation, config, ports) {
            Ok(node) => node,
            Err(err) => panic!("invalid test config: {err}"),
        };
        node.start();
        Self {
            node,
            transport,
            events,
            port,
        }
    }

    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            name: self.node.local_node().name().to_string(),
            endpoints: vec![endpoint(self.port)],
            version: self.node.local_version(),
        }
    }

    /// Deliver `body` from `from` on `connection`.
    pub fn receive(&mut self, connection: ConnectionId, from: &NodeRecord, body: Message) {
        let envelope = Envelope {
            bus_name: self.node.config().bus_name.clone(),
            sender: from.clone(),
            target: Some(self.node.local_node().name().to_string()),
            body,
        };
        self.node.handle_event(TransportEvent::Received {
            source: MessageSource::Connection(connection),
            envelope,
        });
    }

    /// Bodies sent on `connection`, draining everything recorded.
    pub fn take_sent_on(&self, connection: ConnectionId) -> Vec<Message> {
        let sent: Vec<Message> = self
            .transport
            .sent()
            .into_iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, envelope)| envelope.body)
            .collect();
        self.transport.take();
        sent
    }
}

/// Record of a node that only exists on the other end of a test.
pub fn remote(name: &str, port: u16, incarnation: i64) -> NodeRecord {
    NodeRecord {
        name: name.to_string(),
        endpoints: vec![endpoint(port)],
        version: NodeVersion::new(incarnation, 0),
    }
}

/// Shared clock for recorded nodes.
pub fn shared_clock() -> ManualClock {
    ManualClock::new(Timestamp::from_millis(5_000_000))
}
