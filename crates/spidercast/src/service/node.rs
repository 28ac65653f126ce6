//! # SpiderCast Node
//!
//! Single-owner state machine implementing `SpiderCastApi`.
//!
//! Every input (transport event, due task, API call) is handled to
//! completion: the handler runs, then the effects it pushed are routed to the
//! other components until none remain. Nothing inside the node blocks; the
//! host decides when to call `poll` again from the returned deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::attributes::{AttributeHandle, AttributeManager};
use super::context::{Effect, NodeContext, NodePorts};
use super::membership::MembershipService;
use super::scheduler::TaskKind;
use super::topology::{Inbound, TopologyManager, TopologyState};
use crate::domain::events::{
    ConnectivityEvent, NodeSnapshot, SpiderCastEvent, WarningEvent, WarningKind,
};
use crate::domain::messages::{
    Envelope, MembershipMessage, Message, MetadataMessage, TopologyMessage,
};
use crate::domain::{
    AttributeTable, ConfigError, FatalError, NodeId, NodeRef, NodeVersion, ProtocolError,
    SpiderCastConfig, Timestamp,
};
use crate::ports::{MessageSource, SpiderCastApi, TransportEvent};

/// Upper bound on tasks run by one `poll`.
const MAX_TASKS_PER_POLL: usize = 64;

/// Externally visible lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Discovery,
    Normal,
    Closed,
}

impl From<TopologyState> for NodeState {
    fn from(state: TopologyState) -> Self {
        match state {
            TopologyState::Init => NodeState::Init,
            TopologyState::Discovery => NodeState::Discovery,
            TopologyState::Normal => NodeState::Normal,
            TopologyState::Closed => NodeState::Closed,
        }
    }
}

/// A SpiderCast node.
///
/// # Example
///
/// ```rust,ignore
/// let mut node = SpiderCast::new(local, incarnation, config, ports)?;
/// node.start();
/// loop {
///     for event in transport_events() {
///         node.handle_event(event);
///     }
///     let next = node.poll();
///     sleep_until(next);
/// }
/// ```
pub struct SpiderCast {
    ctx: NodeContext,
    membership: MembershipService,
    attributes: AttributeManager,
    topology: TopologyManager,
    closed: Arc<AtomicBool>,
    last_connectivity: ConnectivityEvent,
}

impl SpiderCast {
    /// Create a node for `local` at incarnation `incarnation`.
    ///
    /// The incarnation must grow across restarts of the same name; wall
    /// clock milliseconds at startup are the usual choice.
    pub fn new(
        local: NodeId,
        incarnation: i64,
        config: SpiderCastConfig,
        ports: NodePorts,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let version = NodeVersion::new(incarnation, 0);
        let local_table = AttributeTable::shared();
        let ctx = NodeContext::new(local, version, config, ports);
        let membership = MembershipService::new(&ctx, local_table.clone());
        Ok(Self {
            ctx,
            membership,
            attributes: AttributeManager::new(local_table),
            topology: TopologyManager::new(),
            closed: Arc::new(AtomicBool::new(false)),
            last_connectivity: ConnectivityEvent::default(),
        })
    }

    pub fn membership(&self) -> &MembershipService {
        &self.membership
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn config(&self) -> &SpiderCastConfig {
        &self.ctx.config
    }

    /// Names in the live view, local node included.
    pub fn view_names(&self) -> Vec<String> {
        self.membership.view().names().map(str::to_string).collect()
    }

    pub fn now(&self) -> Timestamp {
        self.ctx.now()
    }

    /// Earliest pending task deadline.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.ctx.scheduler.next_deadline()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // INBOUND MESSAGES
    // =========================================================================

    fn validate(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        if envelope.bus_name != self.ctx.config.bus_name {
            return Err(ProtocolError::WrongBus {
                expected: self.ctx.config.bus_name.clone(),
                actual: envelope.bus_name.clone(),
            });
        }
        if let Some(target) = &envelope.target {
            if target != self.ctx.local_name() {
                return Err(ProtocolError::WrongTarget {
                    expected: self.ctx.local_name().to_string(),
                    actual: target.clone(),
                });
            }
        }
        if let Message::Topology(TopologyMessage::DiscoveryReply { part, total, .. }) =
            &envelope.body
        {
            if *total == 0 || part >= total {
                return Err(ProtocolError::Malformed(format!(
                    "discovery reply part {part} of {total}"
                )));
            }
        }
        Ok(())
    }

    fn on_envelope(&mut self, source: MessageSource, envelope: Envelope) {
        if let Err(err) = self.validate(&envelope) {
            self.protocol_violation(source, Some(&envelope.sender.name), err);
            return;
        }
        let sender_name = envelope.sender.name.clone();
        if sender_name == self.ctx.local_name() {
            if envelope.sender.version.incarnation > self.ctx.version.incarnation {
                let peers = self.topology.routable_peers();
                self.membership
                    .merge_records(&mut self.ctx, std::slice::from_ref(&envelope.sender), &peers);
            }
            return;
        }

        let was_known = self.membership.view().contains(&sender_name);
        let peers = self.topology.routable_peers();
        let view_changed = self
            .membership
            .merge_records(&mut self.ctx, std::slice::from_ref(&envelope.sender), &peers);
        let Some(sender) = self.ctx.cache.get(&sender_name) else {
            debug!(node = %self.ctx.local, peer = %sender_name, "sender unknown after merge");
            return;
        };
        if let Some(connection) = source.connection() {
            self.topology.note_connection(connection, &sender);
        }

        match envelope.body {
            Message::Topology(msg) => {
                self.on_topology(source, &sender, msg, was_known, view_changed)
            }
            Message::Membership(MembershipMessage::Update { joined, departed }) => {
                if source.connection().is_none() {
                    let err = ProtocolError::Unexpected {
                        peer: sender_name,
                        detail: "membership update outside a connection".to_string(),
                    };
                    self.protocol_violation(source, Some(sender.name()), err);
                    return;
                }
                let peers = self.topology.routable_peers();
                self.membership
                    .handle_update(&mut self.ctx, sender.name(), &joined, &departed, &peers);
            }
            Message::Metadata(msg) => self.on_metadata(source, &sender, msg),
        }
    }

    fn on_topology(
        &mut self,
        source: MessageSource,
        sender: &NodeRef,
        msg: TopologyMessage,
        sender_was_known: bool,
        mut view_changed: bool,
    ) {
        let peers = self.topology.routable_peers();
        match &msg {
            TopologyMessage::DiscoveryRequest { view, .. }
            | TopologyMessage::DiscoveryReply { view, .. } => {
                view_changed |= self.membership.merge_records(&mut self.ctx, view, &peers);
            }
            TopologyMessage::ConnectRandomReply {
                redirect: Some(record),
                ..
            } => {
                self.membership
                    .merge_records(&mut self.ctx, std::slice::from_ref(record), &peers);
            }
            TopologyMessage::NodeLeave { version } => {
                self.membership
                    .node_left(&mut self.ctx, sender.name(), *version, &peers);
            }
            _ => {}
        }

        let inbound = Inbound {
            sender,
            source,
            sender_was_known,
            view_changed,
        };
        if let Err(err) = self
            .topology
            .on_message(&mut self.ctx, &self.membership, inbound, &msg)
        {
            self.protocol_violation(source, Some(sender.name()), err);
        }
    }

    fn on_metadata(&mut self, source: MessageSource, sender: &NodeRef, msg: MetadataMessage) {
        let Some(connection) = source.connection() else {
            let err = ProtocolError::Unexpected {
                peer: sender.name().to_string(),
                detail: "metadata outside a connection".to_string(),
            };
            self.protocol_violation(source, Some(sender.name()), err);
            return;
        };
        let result = match &msg {
            MetadataMessage::Update { digest } => {
                self.attributes
                    .on_update(&mut self.ctx, &self.membership, sender.name(), connection, digest)
            }
            MetadataMessage::Request { digest } => {
                self.attributes
                    .on_request(&self.ctx, &self.membership, sender.name(), connection, digest)
            }
            MetadataMessage::Reply { items } => {
                let peers = self.topology.routable_peers();
                self.attributes
                    .on_reply(&mut self.ctx, &self.membership, sender.name(), items, &peers)
            }
        };
        if let Err(fatal) = result {
            self.ctx.push(Effect::Fatal(fatal));
        }
    }

    fn protocol_violation(
        &mut self,
        source: MessageSource,
        peer: Option<&str>,
        err: ProtocolError,
    ) {
        warn!(
            node = %self.ctx.local,
            peer = peer.unwrap_or("-"),
            ?source,
            error = %err,
            "protocol violation"
        );
        self.ctx.publish(SpiderCastEvent::Warning(WarningEvent {
            kind: WarningKind::ProtocolViolation,
            peer: peer.map(str::to_string),
            message: err.to_string(),
        }));
        if let Some(connection) = source.connection() {
            self.topology.tear_down(&mut self.ctx, connection);
        }
    }

    // =========================================================================
    // TASKS AND EFFECTS
    // =========================================================================

    fn run_task(&mut self, kind: TaskKind) {
        let ctx = &mut self.ctx;
        match kind {
            TaskKind::Discovery => self.topology.discover(ctx, &self.membership),
            TaskKind::EndFrequentDiscovery => self.topology.end_frequent_discovery(ctx),
            TaskKind::ChangeSuccessor => self.topology.change_successor(ctx),
            TaskKind::RandomConnect => self.topology.random_connect(ctx, &self.membership),
            TaskKind::RandomDisconnect => self.topology.random_disconnect(ctx),
            TaskKind::StructuredConnect => self.topology.structured_connect(ctx, &self.membership),
            TaskKind::StructuredRefresh => self.topology.structured_refresh(ctx, &self.membership),
            TaskKind::DegreeUpdate => self.topology.degree_update(ctx),
            TaskKind::ConnectTimeouts => self.topology.expire_pending(ctx),
            TaskKind::AttributeUpdate => {
                let peers = self.topology.routable_peers();
                self.attributes.send_updates(ctx, &self.membership, &peers);
                let interval = ctx.config.attribute_update_interval;
                ctx.schedule_in(TaskKind::AttributeUpdate, interval);
            }
            TaskKind::AttributeNotify => {
                let notification = self.attributes.prepare_notification(&mut self.membership);
                if let Some(notification) = notification {
                    debug!(
                        node = %ctx.local,
                        full = notification.full,
                        nodes = notification.nodes.len(),
                        departed = notification.departed.len(),
                        "view notification"
                    );
                    ctx.publish(SpiderCastEvent::ViewChanged(notification));
                }
            }
            TaskKind::HistoryPurge => {
                let purged = self.membership.purge_history(ctx);
                if purged > 0 {
                    debug!(node = %ctx.local, purged, "history purged");
                }
                let interval = ctx.config.history_purge_interval;
                ctx.schedule_in(TaskKind::HistoryPurge, interval);
            }
        }
    }

    /// Route effects until none remain.
    fn drain_effects(&mut self) {
        while let Some(effect) = self.ctx.effects.pop_front() {
            if self.is_closed() {
                if let Effect::DisconnectedNeighbor { node, link } = effect {
                    self.ctx.routing.remove_routing_neighbor(&node, link);
                }
                continue;
            }
            match effect {
                Effect::NewNeighbor {
                    node,
                    link,
                    connection,
                } => {
                    self.ctx.routing.add_routing_neighbor(&node, link);
                    self.membership
                        .new_neighbor(&mut self.ctx, node.name(), connection);
                    self.attributes
                        .send_full_digest(&mut self.ctx, &self.membership, node.name(), connection);
                }
                Effect::DisconnectedNeighbor { node, link } => {
                    self.ctx.routing.remove_routing_neighbor(&node, link);
                    if !self.topology.is_linked(node.name()) {
                        self.membership.disconnected_neighbor(&self.ctx, node.name());
                    }
                }
                Effect::ResyncFailed(connection) => {
                    if self.topology.carries_link(connection) {
                        warn!(
                            node = %self.ctx.local,
                            %connection,
                            "initial sync lost, dropping link"
                        );
                        self.topology.tear_down(&mut self.ctx, connection);
                    }
                }
                Effect::ReportSuspect(node) => {
                    let peers = self.topology.routable_peers();
                    self.membership.report_suspect(&mut self.ctx, &node, &peers);
                }
                Effect::SuccessorChanged(successor) => {
                    self.topology.set_successor(&mut self.ctx, successor);
                }
                Effect::ViewChanged => {
                    self.ctx.schedule_now(TaskKind::AttributeNotify);
                    self.topology.on_view_changed(&mut self.ctx);
                }
                Effect::Fatal(fatal) => self.fatal(fatal),
            }
        }
    }

    fn fatal(&mut self, fatal: FatalError) {
        error!(
            node = %self.ctx.local,
            code = %fatal.code,
            cause = %fatal.cause,
            "fatal error, closing node"
        );
        self.ctx
            .publish(SpiderCastEvent::FatalError((&fatal).into()));
        self.shutdown(false);
    }

    fn shutdown(&mut self, soft: bool) {
        if self.is_closed() {
            return;
        }
        self.topology.close(&mut self.ctx, soft);
        self.closed.store(true, Ordering::Release);
        self.ctx.scheduler.cancel_all();
        info!(node = %self.ctx.local, version = %self.ctx.version, soft, "node closed");
    }

    fn publish_connectivity(&mut self) {
        let current = self.topology.connectivity();
        if current != self.last_connectivity {
            debug!(node = %self.ctx.local, ?current, "connectivity changed");
            self.last_connectivity = current;
            self.ctx.publish(SpiderCastEvent::Connectivity(current));
        }
    }
}

impl SpiderCastApi for SpiderCast {
    fn start(&mut self) {
        if self.topology.state() != TopologyState::Init {
            return;
        }
        info!(
            node = %self.ctx.local,
            version = %self.ctx.version,
            bus = %self.ctx.config.bus_name,
            "starting node"
        );
        self.topology.start(&mut self.ctx);
        self.ctx.schedule_now(TaskKind::AttributeNotify);
        let update = self.ctx.config.attribute_update_interval;
        self.ctx.schedule_in(TaskKind::AttributeUpdate, update);
        let purge = self.ctx.config.history_purge_interval;
        self.ctx.schedule_in(TaskKind::HistoryPurge, purge);
        self.drain_effects();
    }

    fn close(&mut self, soft: bool) {
        self.shutdown(soft);
        self.drain_effects();
        self.publish_connectivity();
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            TransportEvent::ConnectSucceeded { connection } => {
                self.topology
                    .on_connect_succeeded(&mut self.ctx, &self.membership, connection);
            }
            TransportEvent::ConnectFailed { connection, reason } => {
                self.topology
                    .on_connect_failed(&mut self.ctx, connection, &reason);
            }
            TransportEvent::ConnectionBroken { connection } => {
                self.topology.on_connection_broken(&mut self.ctx, connection);
            }
            TransportEvent::Received { source, envelope } => self.on_envelope(source, envelope),
            TransportEvent::Malformed { source, detail } => {
                self.protocol_violation(source, None, ProtocolError::Malformed(detail));
            }
        }
        self.drain_effects();
        self.publish_connectivity();
    }

    fn poll(&mut self) -> Option<Timestamp> {
        if self.is_closed() {
            return None;
        }
        let now = self.ctx.now();
        for _ in 0..MAX_TASKS_PER_POLL {
            let Some(kind) = self.ctx.scheduler.pop_due(now) else {
                break;
            };
            self.run_task(kind);
            self.ctx.scheduler.complete(kind);
            self.drain_effects();
            if self.is_closed() {
                break;
            }
        }
        self.publish_connectivity();
        self.ctx.scheduler.next_deadline()
    }

    fn state(&self) -> NodeState {
        self.topology.state().into()
    }

    fn local_node(&self) -> &NodeRef {
        &self.ctx.local
    }

    fn local_version(&self) -> NodeVersion {
        self.ctx.version
    }

    fn attributes(&self) -> AttributeHandle {
        AttributeHandle::new(self.attributes.local_table().clone(), self.closed.clone())
    }

    fn attribute_of(&self, node: &str, key: &str) -> Option<Vec<u8>> {
        let entry = self.membership.view().get(node)?;
        let table = entry.table.lock();
        table.get(key).map(<[u8]>::to_vec)
    }

    fn view_snapshot(&self) -> Vec<NodeSnapshot> {
        self.membership
            .view()
            .iter()
            .map(|entry| NodeSnapshot {
                name: entry.node.name().to_string(),
                version: entry.version,
                attributes: entry.table.lock().snapshot(),
            })
            .collect()
    }

    fn connectivity(&self) -> ConnectivityEvent {
        self.topology.connectivity()
    }

    fn request_full_view(&mut self) {
        self.attributes.request_full_view();
        if !self.is_closed() {
            self.ctx.schedule_now(TaskKind::AttributeNotify);
        }
    }

    fn clear_retained(&mut self, node: &str) -> bool {
        self.membership.clear_retained(node)
    }
}
