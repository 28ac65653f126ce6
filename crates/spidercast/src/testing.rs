//! Centralized Testing Utilities
//!
//! Test doubles for every driven port plus `SimNetwork`, an in-memory
//! multi-node fabric with a shared manual clock and FIFO delivery. Every
//! message crossing the fabric goes through `WireCodec`.
//!
//! Available with the `test-utils` feature flag.
//!
//! # Example
//!
//! ```rust,ignore
//! use spidercast::testing::SimNetwork;
//! use spidercast::{SpiderCastApi, SpiderCastConfig};
//! use std::time::Duration;
//!
//! let mut net = SimNetwork::new(SpiderCastConfig::for_testing());
//! net.add_node("a");
//! net.add_node("b");
//! net.start_all();
//! net.run_for(Duration::from_secs(2));
//! assert_eq!(net.node("a").view_names(), vec!["a", "b"]);
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::WireCodec;
use crate::domain::events::{EventKind, SpiderCastEvent, ViewNotification};
use crate::domain::messages::{Envelope, Message};
use crate::domain::{ConnectionId, LinkType, NodeId, NodeRef, SpiderCastConfig, Timestamp};
use crate::ports::{
    EventSink, MessageSource, RoutingListener, SpiderCastApi, TimeSource, Transport,
    TransportError, TransportEvent,
};
use crate::service::{NodePorts, SpiderCast};

// =============================================================================
// CLOCK
// =============================================================================

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let delta = u64::try_from(delta.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

// =============================================================================
// EVENT SINK
// =============================================================================

/// Event sink keeping everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SpiderCastEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SpiderCastEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<SpiderCastEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// View notifications in delivery order.
    pub fn notifications(&self) -> Vec<ViewNotification> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SpiderCastEvent::ViewChanged(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: SpiderCastEvent) {
        self.events.lock().push(event);
    }
}

// =============================================================================
// ROUTING LISTENER
// =============================================================================

/// Routing listener tracking the current routable neighbor set.
#[derive(Debug, Default)]
pub struct RecordingRoutingListener {
    links: Mutex<BTreeMap<(String, LinkType), usize>>,
    changes: AtomicU64,
}

impl RecordingRoutingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently routable `(neighbor, link type)` pairs.
    pub fn neighbors(&self) -> Vec<(String, LinkType)> {
        self.links.lock().keys().cloned().collect()
    }

    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }
}

impl RoutingListener for RecordingRoutingListener {
    fn add_routing_neighbor(&self, node: &NodeRef, link: LinkType) {
        *self
            .links
            .lock()
            .entry((node.name().to_string(), link))
            .or_insert(0) += 1;
        self.changes.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_routing_neighbor(&self, node: &NodeRef, link: LinkType) {
        let mut links = self.links.lock();
        let key = (node.name().to_string(), link);
        if let Some(count) = links.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                links.remove(&key);
            }
        }
        self.changes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// RECORDING TRANSPORT
// =============================================================================

/// One call made on a `RecordingTransport`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Connect {
        connection: ConnectionId,
        endpoint: SocketAddr,
    },
    Disconnect(ConnectionId),
    Send {
        connection: ConnectionId,
        envelope: Envelope,
    },
    SendTo {
        endpoint: SocketAddr,
        envelope: Envelope,
    },
    Multicast(Envelope),
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<Outbound>,
    next_connection: u64,
    fail_sends: bool,
    refuse_connects: bool,
}

/// Transport that records calls and never delivers anything.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    state: Mutex<RecordingState>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail with `NotConnected`.
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Make every connect fail with `Unreachable`.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.lock().refuse_connects = refuse;
    }

    pub fn calls(&self) -> Vec<Outbound> {
        self.state.lock().calls.clone()
    }

    pub fn take(&self) -> Vec<Outbound> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Envelopes sent on connections, in order.
    pub fn sent(&self) -> Vec<(ConnectionId, Envelope)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Outbound::Send {
                    connection,
                    envelope,
                } => Some((*connection, envelope.clone())),
                _ => None,
            })
            .collect()
    }

    /// Message bodies sent on connections, in order.
    pub fn sent_bodies(&self) -> Vec<Message> {
        self.sent().into_iter().map(|(_, e)| e.body).collect()
    }

    pub fn connects(&self) -> Vec<(ConnectionId, SocketAddr)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Outbound::Connect {
                    connection,
                    endpoint,
                } => Some((*connection, *endpoint)),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<ConnectionId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Outbound::Disconnect(connection) => Some(*connection),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, endpoint: SocketAddr) -> Result<ConnectionId, TransportError> {
        let mut state = self.state.lock();
        if state.refuse_connects {
            return Err(TransportError::Unreachable);
        }
        state.next_connection += 1;
        let connection = ConnectionId(state.next_connection);
        state.calls.push(Outbound::Connect {
            connection,
            endpoint,
        });
        Ok(connection)
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.state.lock().calls.push(Outbound::Disconnect(connection));
    }

    fn send(&self, connection: ConnectionId, envelope: &Envelope) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(TransportError::NotConnected);
        }
        state.calls.push(Outbound::Send {
            connection,
            envelope: envelope.clone(),
        });
        Ok(())
    }

    fn send_to(&self, endpoint: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(TransportError::NotConnected);
        }
        state.calls.push(Outbound::SendTo {
            endpoint,
            envelope: envelope.clone(),
        });
        Ok(())
    }

    fn send_to_multicast_group(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(TransportError::NotConnected);
        }
        state.calls.push(Outbound::Multicast(envelope.clone()));
        Ok(())
    }
}

// =============================================================================
// SIMULATED FABRIC
// =============================================================================

#[derive(Debug, Default)]
struct FabricState {
    next_connection: u64,
    endpoints: HashMap<SocketAddr, String>,
    /// `(owner, owner's connection)` to `(peer, peer's connection)`.
    links: HashMap<(String, ConnectionId), (String, ConnectionId)>,
    queue: VecDeque<(String, TransportEvent)>,
    dead: HashSet<String>,
    delivered: u64,
}

impl FabricState {
    fn allocate(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    fn break_links_of(&mut self, name: &str) {
        let owned: Vec<_> = self
            .links
            .keys()
            .filter(|(owner, _)| owner == name)
            .cloned()
            .collect();
        for key in owned {
            if let Some((peer, peer_connection)) = self.links.remove(&key) {
                self.links.remove(&(peer.clone(), peer_connection));
                self.queue.push_back((
                    peer,
                    TransportEvent::ConnectionBroken {
                        connection: peer_connection,
                    },
                ));
            }
        }
    }
}

/// Shared in-memory network. Each node's `SimTransport` posts events here.
#[derive(Debug, Default)]
pub struct SimFabric {
    state: Mutex<FabricState>,
    codec: WireCodec,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, endpoint: SocketAddr) {
        let mut state = self.state.lock();
        state.endpoints.insert(endpoint, name.to_string());
        state.dead.remove(name);
    }

    /// Remove `name` from the fabric and break its connections.
    fn kill(&self, name: &str) {
        let mut state = self.state.lock();
        state.dead.insert(name.to_string());
        state.endpoints.retain(|_, owner| owner != name);
        state.break_links_of(name);
        state.queue.retain(|(dest, _)| dest != name);
    }

    /// Take the next queued event with the name of the node it is for.
    pub fn pop(&self) -> Option<(String, TransportEvent)> {
        let mut state = self.state.lock();
        let next = state.queue.pop_front();
        if next.is_some() {
            state.delivered += 1;
        }
        next
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Events delivered since creation.
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    /// Open connections, counted once per side.
    pub fn open_connections(&self) -> usize {
        self.state.lock().links.len()
    }

    fn transcode(&self, envelope: &Envelope) -> Result<Envelope, TransportError> {
        let frame = self
            .codec
            .encode_frame(envelope)
            .map_err(|_| TransportError::MessageTooLarge)?;
        match self.codec.decode_frame(&frame) {
            Ok(Some((decoded, _))) => Ok(decoded),
            _ => Err(TransportError::MessageTooLarge),
        }
    }
}

/// Transport of one node on a `SimFabric`.
#[derive(Debug)]
pub struct SimTransport {
    fabric: Arc<SimFabric>,
    name: String,
    endpoint: SocketAddr,
}

impl SimTransport {
    pub fn new(fabric: Arc<SimFabric>, name: &str, endpoint: SocketAddr) -> Self {
        fabric.register(name, endpoint);
        Self {
            fabric,
            name: name.to_string(),
            endpoint,
        }
    }
}

impl Transport for SimTransport {
    fn connect(&self, endpoint: SocketAddr) -> Result<ConnectionId, TransportError> {
        let mut state = self.fabric.state.lock();
        let local = state.allocate();
        match state.endpoints.get(&endpoint).cloned() {
            Some(peer) if peer != self.name => {
                let remote = state.allocate();
                state
                    .links
                    .insert((self.name.clone(), local), (peer.clone(), remote));
                state.links.insert((peer, remote), (self.name.clone(), local));
                state.queue.push_back((
                    self.name.clone(),
                    TransportEvent::ConnectSucceeded { connection: local },
                ));
            }
            _ => {
                state.queue.push_back((
                    self.name.clone(),
                    TransportEvent::ConnectFailed {
                        connection: local,
                        reason: format!("{endpoint} unreachable"),
                    },
                ));
            }
        }
        Ok(local)
    }

    fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.fabric.state.lock();
        if let Some((peer, remote)) = state.links.remove(&(self.name.clone(), connection)) {
            state.links.remove(&(peer.clone(), remote));
            state
                .queue
                .push_back((peer, TransportEvent::ConnectionBroken { connection: remote }));
        }
    }

    fn send(&self, connection: ConnectionId, envelope: &Envelope) -> Result<(), TransportError> {
        let envelope = self.fabric.transcode(envelope)?;
        let mut state = self.fabric.state.lock();
        let Some((peer, remote)) = state.links.get(&(self.name.clone(), connection)).cloned() else {
            return Err(TransportError::NotConnected);
        };
        state.queue.push_back((
            peer,
            TransportEvent::Received {
                source: MessageSource::Connection(remote),
                envelope,
            },
        ));
        Ok(())
    }

    fn send_to(&self, endpoint: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
        let envelope = self.fabric.transcode(envelope)?;
        let mut state = self.fabric.state.lock();
        if let Some(peer) = state.endpoints.get(&endpoint).cloned() {
            state.queue.push_back((
                peer,
                TransportEvent::Received {
                    source: MessageSource::Datagram(self.endpoint),
                    envelope,
                },
            ));
        }
        Ok(())
    }

    fn send_to_multicast_group(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let envelope = self.fabric.transcode(envelope)?;
        let mut state = self.fabric.state.lock();
        let mut members: Vec<String> = state
            .endpoints
            .values()
            .filter(|name| **name != self.name)
            .cloned()
            .collect();
        members.sort();
        members.dedup();
        for peer in members {
            state.queue.push_back((
                peer,
                TransportEvent::Received {
                    source: MessageSource::Multicast(self.endpoint),
                    envelope: envelope.clone(),
                },
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SIMULATED NETWORK
// =============================================================================

/// One node on a `SimNetwork` with its recording ports.
pub struct SimNode {
    pub node: SpiderCast,
    pub events: Arc<RecordingSink>,
    pub routing: Arc<RecordingRoutingListener>,
    pub endpoint: SocketAddr,
}

/// Deterministic multi-node network driven by a manual clock.
pub struct SimNetwork {
    fabric: Arc<SimFabric>,
    clock: ManualClock,
    config: SpiderCastConfig,
    nodes: BTreeMap<String, SimNode>,
    next_port: u16,
    tick: Duration,
}

/// Upper bound on events delivered by one `step`.
const MAX_EVENTS_PER_STEP: usize = 100_000;

impl SimNetwork {
    /// Network whose nodes use `config`. Nodes added without their own
    /// bootstrap list use the first node added as the seed.
    pub fn new(config: SpiderCastConfig) -> Self {
        Self {
            fabric: Arc::new(SimFabric::new()),
            clock: ManualClock::new(Timestamp::from_millis(1_000_000)),
            config,
            nodes: BTreeMap::new(),
            next_port: 7000,
            tick: Duration::from_millis(10),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn fabric(&self) -> &Arc<SimFabric> {
        &self.fabric
    }

    pub fn set_tick(&mut self, tick: Duration) {
        self.tick = tick;
    }

    fn allocate_endpoint(&mut self) -> SocketAddr {
        let port = self.next_port;
        self.next_port += 1;
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Endpoint of the first node added.
    pub fn seed_endpoint(&self) -> Option<SocketAddr> {
        self.nodes.values().map(|n| n.endpoint).min()
    }

    /// Add a node at incarnation 1 with the network's configuration.
    pub fn add_node(&mut self, name: &str) -> &mut SpiderCast {
        let mut config = self.config.clone();
        if config.bootstrap.is_empty() {
            config.bootstrap.extend(self.seed_endpoint());
        }
        self.add_node_with(name, 1, config)
    }

    /// Add a node with an explicit incarnation and configuration.
    pub fn add_node_with(
        &mut self,
        name: &str,
        incarnation: i64,
        mut config: SpiderCastConfig,
    ) -> &mut SpiderCast {
        let endpoint = match self.nodes.get(name) {
            Some(existing) => existing.endpoint,
            None => self.allocate_endpoint(),
        };
        if config.rng_seed.is_some() {
            config.rng_seed = Some(u64::from(endpoint.port()));
        }
        let events = Arc::new(RecordingSink::new());
        let routing = Arc::new(RecordingRoutingListener::new());
        let ports = NodePorts {
            transport: Arc::new(SimTransport::new(self.fabric.clone(), name, endpoint)),
            clock: Box::new(self.clock.clone()),
            events: events.clone(),
            routing: routing.clone(),
        };
        let local = NodeId::new(name, vec![endpoint]);
        let node = match SpiderCast::new(local, incarnation, config, ports) {
            Ok(node) => node,
            Err(err) => panic!("invalid simulation config: {err}"),
        };
        let slot = self.nodes.entry(name.to_string());
        let sim = SimNode {
            node,
            events,
            routing,
            endpoint,
        };
        let sim = match slot {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.insert(sim);
                entry.into_mut()
            }
            std::collections::btree_map::Entry::Vacant(entry) => entry.insert(sim),
        };
        &mut sim.node
    }

    pub fn start_all(&mut self) {
        for sim in self.nodes.values_mut() {
            sim.node.start();
        }
    }

    pub fn start(&mut self, name: &str) {
        if let Some(sim) = self.nodes.get_mut(name) {
            sim.node.start();
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// # Panics
    ///
    /// Panics if `name` is not on the network.
    pub fn node(&self, name: &str) -> &SpiderCast {
        &self.sim(name).node
    }

    /// # Panics
    ///
    /// Panics if `name` is not on the network.
    pub fn node_mut(&mut self, name: &str) -> &mut SpiderCast {
        match self.nodes.get_mut(name) {
            Some(sim) => &mut sim.node,
            None => panic!("unknown node {name}"),
        }
    }

    /// # Panics
    ///
    /// Panics if `name` is not on the network.
    pub fn sim(&self, name: &str) -> &SimNode {
        match self.nodes.get(name) {
            Some(sim) => sim,
            None => panic!("unknown node {name}"),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.values()
    }

    /// Deliver queued events until the fabric is idle, then poll every node.
    pub fn step(&mut self) {
        for _ in 0..MAX_EVENTS_PER_STEP {
            let Some((dest, event)) = self.fabric.pop() else {
                break;
            };
            if let Some(sim) = self.nodes.get_mut(&dest) {
                sim.node.handle_event(event);
            }
        }
        for sim in self.nodes.values_mut() {
            sim.node.poll();
        }
    }

    /// Advance the clock by `duration` in ticks, stepping after each.
    pub fn run_for(&mut self, duration: Duration) {
        let tick = self.tick.max(Duration::from_millis(1));
        let mut elapsed = Duration::ZERO;
        self.step();
        while elapsed < duration {
            self.clock.advance(tick);
            elapsed += tick;
            self.step();
        }
    }

    /// Run until `done` holds or `limit` passes. Returns whether it held.
    pub fn run_until(
        &mut self,
        limit: Duration,
        mut done: impl FnMut(&SimNetwork) -> bool,
    ) -> bool {
        let tick = self.tick.max(Duration::from_millis(1));
        let mut elapsed = Duration::ZERO;
        self.step();
        while elapsed < limit {
            if done(self) {
                return true;
            }
            self.clock.advance(tick);
            elapsed += tick;
            self.step();
        }
        done(self)
    }

    /// Crash `name`: it vanishes without a word and its connections break.
    pub fn kill(&mut self, name: &str) -> Option<SimNode> {
        self.fabric.kill(name);
        self.nodes.remove(name)
    }

    /// Close `name` and take it off the network.
    pub fn close(&mut self, name: &str, soft: bool) -> Option<SimNode> {
        let mut sim = self.nodes.remove(name)?;
        sim.node.close(soft);
        // Deliver the departure before the connections break.
        self.step();
        self.fabric.kill(name);
        Some(sim)
    }

    pub fn pending_events(&self) -> usize {
        self.fabric.pending()
    }

    /// Whether every node's view holds exactly the nodes on the network.
    pub fn views_converged(&self) -> bool {
        let expected = self.names();
        self.nodes
            .values()
            .all(|sim| sim.node.view_names() == expected)
    }

    /// Whether every node holds `key` of `owner` with `value`.
    pub fn attribute_everywhere(&self, owner: &str, key: &str, value: &[u8]) -> bool {
        self.nodes
            .values()
            .all(|sim| sim.node.attribute_of(owner, key).as_deref() == Some(value))
    }
}

// =============================================================================
// CRATE TEST SUPPORT
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(Timestamp::from_millis(5));
        let other = clock.clone();
        clock.advance(Duration::from_millis(10));
        assert_eq!(other.now().as_millis(), 15);
    }

    #[test]
    fn test_routing_listener_counts_links() {
        let listener = RecordingRoutingListener::new();
        let node: NodeRef = Arc::new(NodeId::new("b", vec![]));
        listener.add_routing_neighbor(&node, LinkType::Random);
        listener.add_routing_neighbor(&node, LinkType::Successor);
        listener.remove_routing_neighbor(&node, LinkType::Random);
        assert_eq!(
            listener.neighbors(),
            vec![("b".to_string(), LinkType::Successor)]
        );
        assert_eq!(listener.changes(), 3);
    }

    #[test]
    fn test_fabric_connect_to_unknown_endpoint_fails_later() {
        let fabric = Arc::new(SimFabric::new());
        let transport = SimTransport::new(fabric.clone(), "a", support::endpoint(1));
        let connection = transport.connect(support::endpoint(2)).unwrap();
        assert!(matches!(
            fabric.pop(),
            Some((dest, TransportEvent::ConnectFailed { connection: c, .. }))
                if dest == "a" && c == connection
        ));
    }

    #[test]
    fn test_fabric_disconnect_breaks_peer_side() {
        let fabric = Arc::new(SimFabric::new());
        let a = SimTransport::new(fabric.clone(), "a", support::endpoint(1));
        let _b = SimTransport::new(fabric.clone(), "b", support::endpoint(2));
        let connection = a.connect(support::endpoint(2)).unwrap();
        let _ = fabric.pop();
        assert_eq!(fabric.open_connections(), 2);
        a.disconnect(connection);
        assert_eq!(fabric.open_connections(), 0);
        assert!(matches!(
            fabric.pop(),
            Some((dest, TransportEvent::ConnectionBroken { .. })) if dest == "b"
        ));
        assert!(matches!(
            a.send(connection, &sample_envelope()),
            Err(TransportError::NotConnected)
        ));
    }

    fn sample_envelope() -> Envelope {
        Envelope {
            bus_name: "b".to_string(),
            sender: support::record("a", 1, 1, 0),
            target: None,
            body: Message::Topology(crate::domain::messages::TopologyMessage::ConnectSuccessor),
        }
    }
}
