//! Topology manager state, connection registry and failure handling.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use tracing::{debug, info};

use crate::domain::events::ConnectivityEvent;
use crate::domain::messages::{Message, TopologyMessage};
use crate::domain::{
    ConnectionId, LinkType, Neighbor, NeighborTable, NodeRef, OutgoingStructuredNeighborTable,
    Timestamp,
};
use crate::ports::MessageSource;
use crate::service::context::{Effect, NodeContext};
use crate::service::scheduler::TaskKind;

/// Lifecycle of the topology manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Init,
    /// Accelerated discovery; entered at start and on successor loss.
    Discovery,
    Normal,
    Closed,
}

/// Transport connection known to the node.
#[derive(Debug, Clone)]
pub(super) struct ConnectionEntry {
    pub peer: Option<NodeRef>,
    pub established: bool,
    /// Dialed by this node, which therefore closes it.
    pub outgoing: bool,
    /// Bootstrap endpoint this discovery connection contacts.
    pub discovery: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AttemptPhase {
    Connecting,
    RequestSent,
}

/// In-flight connect handshake for one `(peer, link type)`.
#[derive(Debug, Clone)]
pub(super) struct ConnectAttempt {
    pub peer: NodeRef,
    pub link: LinkType,
    pub connection: ConnectionId,
    pub phase: AttemptPhase,
    pub started: Timestamp,
    pub urgent: bool,
}

/// Disconnect request awaiting its reply.
#[derive(Debug, Clone, Copy)]
pub(super) struct PendingDisconnect {
    pub connection: ConnectionId,
    pub since: Timestamp,
}

pub(super) type LinkKey = (String, LinkType);

/// Sender-side facts about an inbound topology message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inbound<'a> {
    pub sender: &'a NodeRef,
    pub source: MessageSource,
    /// The sender was in the view before this message.
    pub sender_was_known: bool,
    /// Records carried by this message changed the view.
    pub view_changed: bool,
}

/// Overlay link manager.
#[derive(Debug)]
pub struct TopologyManager {
    pub(super) state: TopologyState,
    pub(super) successor: Option<Neighbor>,
    pub(super) desired_successor: Option<NodeRef>,
    pub(super) predecessors: NeighborTable,
    pub(super) random: NeighborTable,
    pub(super) structured_out: OutgoingStructuredNeighborTable,
    pub(super) structured_in: NeighborTable,
    pub(super) connections: BTreeMap<ConnectionId, ConnectionEntry>,
    pub(super) attempts: BTreeMap<LinkKey, ConnectAttempt>,
    pub(super) pending_disconnects: BTreeMap<LinkKey, PendingDisconnect>,
    pub(super) pending_discovery: BTreeMap<SocketAddr, Timestamp>,
    pub(super) redirect: Option<String>,
    pub(super) random_rejections: u32,
    pub(super) disconnect_refusals: u32,
    pub(super) connect_failures: HashMap<String, u32>,
    pub(super) successor_failures: HashMap<String, u32>,
    pub(super) structured_churn_mark: u64,
    pub(super) announced_degree: Option<usize>,
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyManager {
    pub fn new() -> Self {
        Self {
            state: TopologyState::Init,
            successor: None,
            desired_successor: None,
            predecessors: NeighborTable::new(LinkType::Successor),
            random: NeighborTable::new(LinkType::Random),
            structured_out: OutgoingStructuredNeighborTable::new(),
            structured_in: NeighborTable::new(LinkType::Structured),
            connections: BTreeMap::new(),
            attempts: BTreeMap::new(),
            pending_disconnects: BTreeMap::new(),
            pending_discovery: BTreeMap::new(),
            redirect: None,
            random_rejections: 0,
            disconnect_refusals: 0,
            connect_failures: HashMap::new(),
            successor_failures: HashMap::new(),
            structured_churn_mark: 0,
            announced_degree: None,
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub(super) fn is_active(&self) -> bool {
        matches!(self.state, TopologyState::Discovery | TopologyState::Normal)
    }

    pub fn successor(&self) -> Option<&Neighbor> {
        self.successor.as_ref()
    }

    pub fn predecessors(&self) -> &NeighborTable {
        &self.predecessors
    }

    pub fn random(&self) -> &NeighborTable {
        &self.random
    }

    pub fn structured_out(&self) -> &OutgoingStructuredNeighborTable {
        &self.structured_out
    }

    pub fn structured_in(&self) -> &NeighborTable {
        &self.structured_in
    }

    /// Vacancy advertised to random neighbors: `D - degree`.
    pub fn random_vacancy(&self, target: usize) -> i32 {
        target as i32 - self.random.len() as i32
    }

    pub fn connectivity(&self) -> ConnectivityEvent {
        ConnectivityEvent {
            ring: usize::from(self.successor.is_some()) + self.predecessors.len(),
            random: self.random.len(),
            structured_out: self.structured_out.len(),
            structured_in: self.structured_in.len(),
        }
    }

    /// One routable connection per neighbor, in name order.
    pub fn routable_peers(&self) -> Vec<(String, ConnectionId)> {
        let mut peers = BTreeMap::new();
        let neighbors = self
            .successor
            .iter()
            .chain(self.predecessors.iter())
            .chain(self.random.iter())
            .chain(self.structured_out.table().iter())
            .chain(self.structured_in.iter());
        for neighbor in neighbors.filter(|n| n.routable) {
            peers
                .entry(neighbor.name().to_string())
                .or_insert(neighbor.connection);
        }
        peers.into_iter().collect()
    }

    /// Whether any link to `name` remains.
    pub fn is_linked(&self, name: &str) -> bool {
        self.successor.as_ref().is_some_and(|s| s.name() == name)
            || self.predecessors.contains(name)
            || self.random.contains(name)
            || self.structured_out.contains(name)
            || self.structured_in.contains(name)
    }

    pub(super) fn attempts_of(&self, link: LinkType) -> usize {
        self.attempts.keys().filter(|(_, l)| *l == link).count()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Enter discovery and schedule the periodic topology tasks.
    pub(crate) fn start(&mut self, ctx: &mut NodeContext) {
        if self.state != TopologyState::Init {
            return;
        }
        self.state = TopologyState::Discovery;
        info!(node = %ctx.local, "topology starting discovery");
        ctx.schedule_now(TaskKind::Discovery);
        let warm_up = ctx.config.frequent_discovery_duration;
        ctx.schedule_in(TaskKind::EndFrequentDiscovery, warm_up);
        ctx.schedule_now(TaskKind::RandomConnect);
        if ctx.config.structured_enabled() {
            ctx.schedule_now(TaskKind::StructuredConnect);
            let refresh = ctx.config.structured_refresh_interval;
            ctx.schedule_in(TaskKind::StructuredRefresh, refresh);
        }
        let sweep = ctx.config.connect_timeout / 2;
        ctx.schedule_in(TaskKind::ConnectTimeouts, sweep);
    }

    /// Drop every link and connection. A soft close announces the departure.
    pub(crate) fn close(&mut self, ctx: &mut NodeContext, soft: bool) {
        if self.state == TopologyState::Closed {
            return;
        }
        if soft {
            for (peer, connection) in self.routable_peers() {
                let body = Message::Topology(TopologyMessage::NodeLeave {
                    version: ctx.version,
                });
                let _ = ctx.send(connection, &peer, body);
            }
        }

        let mut lost: Vec<(NodeRef, LinkType)> = Vec::new();
        if let Some(successor) = self.successor.take() {
            lost.push((successor.node, LinkType::Successor));
        }
        lost.extend(self.predecessors.drain().into_iter().map(|n| (n.node, LinkType::Successor)));
        lost.extend(self.random.drain().into_iter().map(|n| (n.node, LinkType::Random)));
        lost.extend(
            self.structured_out
                .drain()
                .into_iter()
                .map(|n| (n.node, LinkType::Structured)),
        );
        lost.extend(
            self.structured_in
                .drain()
                .into_iter()
                .map(|n| (n.node, LinkType::Structured)),
        );
        for (node, link) in lost {
            self.link_lost(ctx, &node, link);
        }

        for connection in std::mem::take(&mut self.connections).into_keys() {
            ctx.transport.disconnect(connection);
        }
        self.attempts.clear();
        self.pending_disconnects.clear();
        self.pending_discovery.clear();
        self.desired_successor = None;
        self.state = TopologyState::Closed;
        info!(node = %ctx.local, soft, "topology closed");
    }

    /// Accelerate discovery again.
    pub(super) fn enter_discovery(&mut self, ctx: &mut NodeContext) {
        if !self.is_active() {
            return;
        }
        if self.state == TopologyState::Normal {
            info!(node = %ctx.local, "re-entering discovery");
        }
        self.state = TopologyState::Discovery;
        let warm_up = ctx.config.frequent_discovery_duration;
        ctx.schedule_in(TaskKind::EndFrequentDiscovery, warm_up);
        ctx.schedule_now(TaskKind::Discovery);
    }

    /// View composition changed: repair any overlay below target.
    pub(crate) fn on_view_changed(&mut self, ctx: &mut NodeContext) {
        if self.is_active() {
            self.schedule_repairs(ctx);
        }
    }

    pub(super) fn schedule_repairs(&self, ctx: &mut NodeContext) {
        if self.random.len() < ctx.config.random_degree {
            ctx.schedule_now(TaskKind::RandomConnect);
        }
        if ctx.config.structured_enabled()
            && self.structured_out.len() < ctx.config.structured_degree
        {
            ctx.schedule_now(TaskKind::StructuredConnect);
        }
    }

    // =========================================================================
    // LINK NOTIFICATIONS
    // =========================================================================

    pub(super) fn link_established(
        &self,
        ctx: &mut NodeContext,
        node: &NodeRef,
        link: LinkType,
        connection: ConnectionId,
    ) {
        info!(node = %ctx.local, peer = %node, %link, %connection, "link established");
        ctx.push(Effect::NewNeighbor {
            node: node.clone(),
            link,
            connection,
        });
    }

    pub(super) fn link_lost(&self, ctx: &mut NodeContext, node: &NodeRef, link: LinkType) {
        info!(node = %ctx.local, peer = %node, %link, "link removed");
        ctx.push(Effect::DisconnectedNeighbor {
            node: node.clone(),
            link,
        });
    }

    // =========================================================================
    // CONNECTION REGISTRY
    // =========================================================================

    /// Register a connection a peer dialed to us.
    pub(crate) fn note_connection(&mut self, connection: ConnectionId, sender: &NodeRef) {
        let entry = self
            .connections
            .entry(connection)
            .or_insert_with(|| ConnectionEntry {
                peer: None,
                established: true,
                outgoing: false,
                discovery: None,
            });
        if entry.peer.is_none() {
            entry.peer = Some(sender.clone());
        }
    }

    /// Connection usable for a new handshake with `name`, and whether it is
    /// already established. Incoming connections are reused only while a
    /// link keeps them open.
    pub(super) fn connection_to(&self, name: &str) -> Option<(ConnectionId, bool)> {
        let mut connecting = None;
        for (connection, entry) in &self.connections {
            if entry.discovery.is_some() || !(entry.outgoing || self.carries_link(*connection)) {
                continue;
            }
            if entry.peer.as_ref().is_some_and(|p| p.name() == name) {
                if entry.established {
                    return Some((*connection, true));
                }
                connecting.get_or_insert((*connection, false));
            }
        }
        connecting
    }

    pub(crate) fn carries_link(&self, connection: ConnectionId) -> bool {
        self.successor
            .as_ref()
            .is_some_and(|s| s.connection == connection)
            || self.predecessors.uses_connection(connection)
            || self.random.uses_connection(connection)
            || self.structured_out.table().uses_connection(connection)
            || self.structured_in.uses_connection(connection)
    }

    pub(super) fn is_referenced(&self, connection: ConnectionId) -> bool {
        self.carries_link(connection)
            || self.attempts.values().any(|a| a.connection == connection)
            || self
                .pending_disconnects
                .values()
                .any(|p| p.connection == connection)
            || self
                .connections
                .get(&connection)
                .is_some_and(|e| e.discovery.is_some())
    }

    /// Close a connection we dialed once nothing references it.
    pub(super) fn release_connection(&mut self, ctx: &NodeContext, connection: ConnectionId) {
        if self.is_referenced(connection) {
            return;
        }
        let outgoing = self
            .connections
            .get(&connection)
            .is_some_and(|entry| entry.outgoing);
        if !outgoing {
            return;
        }
        self.connections.remove(&connection);
        ctx.transport.disconnect(connection);
        debug!(node = %ctx.local, %connection, "released connection");
    }

    /// Remove every link riding on `connection`.
    fn remove_links_on(&mut self, connection: ConnectionId) -> Vec<(NodeRef, LinkType)> {
        let mut lost = Vec::new();
        if self
            .successor
            .as_ref()
            .is_some_and(|s| s.connection == connection)
        {
            if let Some(successor) = self.successor.take() {
                lost.push((successor.node, LinkType::Successor));
            }
        }
        let tables = [
            (self.predecessors.remove_by_connection(connection), LinkType::Successor),
            (self.random.remove_by_connection(connection), LinkType::Random),
            (
                self.structured_out.remove_by_connection(connection),
                LinkType::Structured,
            ),
            (
                self.structured_in.remove_by_connection(connection),
                LinkType::Structured,
            ),
        ];
        for (removed, link) in tables {
            lost.extend(removed.into_iter().map(|n| (n.node, link)));
        }
        lost
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    pub(crate) fn on_connect_failed(
        &mut self,
        ctx: &mut NodeContext,
        connection: ConnectionId,
        reason: &str,
    ) {
        debug!(node = %ctx.local, %connection, reason, "connect failed");
        if let Some(endpoint) = self
            .connections
            .remove(&connection)
            .and_then(|entry| entry.discovery)
        {
            self.pending_discovery.remove(&endpoint);
        }
        self.fail_attempts_on(ctx, connection);
    }

    /// The transport lost `connection`.
    pub(crate) fn on_connection_broken(&mut self, ctx: &mut NodeContext, connection: ConnectionId) {
        self.drop_connection(ctx, connection, true);
    }

    /// Tear down a connection after a protocol violation. No suspicion.
    pub(crate) fn tear_down(&mut self, ctx: &mut NodeContext, connection: ConnectionId) {
        if self.connections.contains_key(&connection) {
            ctx.transport.disconnect(connection);
        }
        self.drop_connection(ctx, connection, false);
    }

    fn drop_connection(&mut self, ctx: &mut NodeContext, connection: ConnectionId, suspect: bool) {
        if let Some(endpoint) = self
            .connections
            .remove(&connection)
            .and_then(|entry| entry.discovery)
        {
            self.pending_discovery.remove(&endpoint);
        }
        self.fail_attempts_on(ctx, connection);
        self.pending_disconnects
            .retain(|_, pending| pending.connection != connection);

        let successor_lost = self
            .successor
            .as_ref()
            .is_some_and(|s| s.connection == connection);
        let lost = self.remove_links_on(connection);
        if lost.is_empty() {
            debug!(node = %ctx.local, %connection, "forgot unreferenced connection");
            return;
        }

        let mut peers: BTreeMap<String, NodeRef> = BTreeMap::new();
        for (node, link) in &lost {
            self.link_lost(ctx, node, *link);
            peers.insert(node.name().to_string(), node.clone());
        }
        if suspect {
            for node in peers.into_values() {
                ctx.push(Effect::ReportSuspect(node));
            }
        }
        if successor_lost {
            self.enter_discovery(ctx);
            ctx.schedule_now(TaskKind::ChangeSuccessor);
        }
        self.schedule_repairs(ctx);
    }

    fn fail_attempts_on(&mut self, ctx: &mut NodeContext, connection: ConnectionId) {
        let failed: Vec<LinkKey> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| attempt.connection == connection)
            .map(|(key, _)| key.clone())
            .collect();
        for key in failed {
            if let Some(attempt) = self.attempts.remove(&key) {
                self.fail_attempt(ctx, attempt);
            }
        }
    }

    /// An attempt failed before acceptance.
    pub(super) fn fail_attempt(&mut self, ctx: &mut NodeContext, attempt: ConnectAttempt) {
        debug!(
            node = %ctx.local,
            peer = %attempt.peer,
            link = %attempt.link,
            "connect attempt failed"
        );
        self.release_connection(ctx, attempt.connection);
        match attempt.link {
            LinkType::Successor => self.successor_attempt_failed(ctx, &attempt.peer),
            LinkType::Random => {
                self.count_connect_failure(ctx, &attempt.peer);
                let retry = ctx.config.connect_retry_delay;
                ctx.schedule_in(TaskKind::RandomConnect, retry);
            }
            LinkType::Structured => {
                self.count_connect_failure(ctx, &attempt.peer);
                let retry = ctx.config.connect_retry_delay;
                ctx.schedule_in(TaskKind::StructuredConnect, retry);
            }
        }
    }

    pub(super) fn count_connect_failure(&mut self, ctx: &mut NodeContext, peer: &NodeRef) {
        let failures = self
            .connect_failures
            .entry(peer.name().to_string())
            .or_insert(0);
        *failures += 1;
        if *failures >= ctx.config.connect_max_failures {
            self.connect_failures.remove(peer.name());
            info!(node = %ctx.local, peer = %peer, "connect failures exhausted");
            ctx.push(Effect::ReportSuspect(peer.clone()));
        }
    }

    /// `ConnectTimeouts` task: expire attempts, discovery connections and
    /// disconnect requests that never completed.
    pub(crate) fn expire_pending(&mut self, ctx: &mut NodeContext) {
        let now = ctx.now();
        let timeout = ctx.config.connect_timeout;

        let expired: Vec<LinkKey> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| now.has_elapsed(attempt.started, timeout))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(attempt) = self.attempts.remove(&key) {
                debug!(
                    node = %ctx.local,
                    peer = %attempt.peer,
                    link = %attempt.link,
                    phase = ?attempt.phase,
                    "connect attempt timed out"
                );
                self.fail_attempt(ctx, attempt);
            }
        }

        let stale_discovery: Vec<SocketAddr> = self
            .pending_discovery
            .iter()
            .filter(|(_, since)| now.has_elapsed(**since, timeout))
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in stale_discovery {
            self.pending_discovery.remove(&endpoint);
            let connections: Vec<ConnectionId> = self
                .connections
                .iter()
                .filter(|(_, entry)| entry.discovery == Some(endpoint))
                .map(|(connection, _)| *connection)
                .collect();
            for connection in connections {
                self.connections.remove(&connection);
                ctx.transport.disconnect(connection);
            }
        }

        let stale_disconnects: Vec<LinkKey> = self
            .pending_disconnects
            .iter()
            .filter(|(_, pending)| now.has_elapsed(pending.since, timeout))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale_disconnects {
            if let Some(pending) = self.pending_disconnects.remove(&key) {
                self.release_connection(ctx, pending.connection);
            }
        }

        if self.is_active() {
            let sweep = (timeout / 2).max(std::time::Duration::from_millis(1));
            ctx.schedule_in(TaskKind::ConnectTimeouts, sweep);
        }
    }

    /// A peer left gracefully: drop its links without suspicion.
    pub(crate) fn on_peer_left(&mut self, ctx: &mut NodeContext, name: &str) {
        let mut lost: Vec<Neighbor> = Vec::new();
        let mut successor_lost = false;
        if self.successor.as_ref().is_some_and(|s| s.name() == name) {
            lost.extend(self.successor.take());
            successor_lost = true;
        }
        let mut links: Vec<(Neighbor, LinkType)> = lost
            .into_iter()
            .map(|n| (n, LinkType::Successor))
            .collect();
        links.extend(self.predecessors.remove(name).map(|n| (n, LinkType::Successor)));
        links.extend(self.random.remove(name).map(|n| (n, LinkType::Random)));
        links.extend(self.structured_out.remove(name).map(|n| (n, LinkType::Structured)));
        links.extend(self.structured_in.remove(name).map(|n| (n, LinkType::Structured)));

        let mut connections: Vec<ConnectionId> = links.iter().map(|(n, _)| n.connection).collect();
        for (neighbor, link) in &links {
            self.link_lost(ctx, &neighbor.node, *link);
        }

        let keys: Vec<LinkKey> = self
            .attempts
            .keys()
            .filter(|(peer, _)| peer == name)
            .cloned()
            .collect();
        for key in keys {
            if let Some(attempt) = self.attempts.remove(&key) {
                connections.push(attempt.connection);
            }
        }
        let keys: Vec<LinkKey> = self
            .pending_disconnects
            .keys()
            .filter(|(peer, _)| peer == name)
            .cloned()
            .collect();
        for key in keys {
            if let Some(pending) = self.pending_disconnects.remove(&key) {
                connections.push(pending.connection);
            }
        }
        self.connect_failures.remove(name);
        self.successor_failures.remove(name);

        for connection in connections {
            self.release_connection(ctx, connection);
        }
        if successor_lost {
            ctx.schedule_now(TaskKind::ChangeSuccessor);
        }
        if self.is_active() {
            self.schedule_repairs(ctx);
        }
    }
}
