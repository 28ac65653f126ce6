//! Shared node context.
//!
//! Components never reference each other. They receive the context by
//! `&mut`, read and write shared facilities through it and push `Effect`s that
//! the node routes to the other components once the handler returns.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::scheduler::{TaskKind, TaskScheduler};
use crate::domain::events::SpiderCastEvent;
use crate::domain::messages::{Envelope, Message};
use crate::domain::{
    ConnectionId, FatalError, LinkType, NodeId, NodeIdCache, NodeRecord, NodeRef, NodeVersion,
    SpiderCastConfig, Timestamp,
};
use crate::ports::{EventSink, RoutingListener, TimeSource, Transport, TransportError};

/// Collaborators a node is wired to.
pub struct NodePorts {
    pub transport: Arc<dyn Transport>,
    pub clock: Box<dyn TimeSource>,
    pub events: Arc<dyn EventSink>,
    pub routing: Arc<dyn RoutingListener>,
}

/// Cross-component notifications, drained by the node after each input.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    /// A link became routable.
    NewNeighbor {
        node: NodeRef,
        link: LinkType,
        connection: ConnectionId,
    },
    /// A routable link went away.
    DisconnectedNeighbor { node: NodeRef, link: LinkType },
    /// Topology believes the node is unreachable.
    ReportSuspect(NodeRef),
    /// Membership picked a new ring successor.
    SuccessorChanged(Option<NodeRef>),
    /// View composition or attributes changed.
    ViewChanged,
    /// A link lost its initial sync; tearing it down lets a new link resend it.
    ResyncFailed(ConnectionId),
    Fatal(FatalError),
}

pub(crate) struct NodeContext {
    pub local: NodeRef,
    pub version: NodeVersion,
    pub config: SpiderCastConfig,
    pub transport: Arc<dyn Transport>,
    pub events: Arc<dyn EventSink>,
    pub routing: Arc<dyn RoutingListener>,
    pub clock: Box<dyn TimeSource>,
    pub scheduler: TaskScheduler,
    pub cache: NodeIdCache,
    pub rng: StdRng,
    pub effects: VecDeque<Effect>,
    next_stream_id: u64,
}

impl NodeContext {
    pub fn new(
        local: NodeId,
        version: NodeVersion,
        config: SpiderCastConfig,
        ports: NodePorts,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut cache = NodeIdCache::new();
        let local = cache.intern(local);
        Self {
            local,
            version,
            config,
            transport: ports.transport,
            events: ports.events,
            routing: ports.routing,
            clock: ports.clock,
            scheduler: TaskScheduler::new(),
            cache,
            rng,
            effects: VecDeque::new(),
            next_stream_id: 0,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn local_name(&self) -> &str {
        self.local.name()
    }

    pub fn local_record(&self) -> NodeRecord {
        NodeRecord::new(&self.local, self.version)
    }

    pub fn envelope(&self, target: Option<&str>, body: Message) -> Envelope {
        Envelope {
            bus_name: self.config.bus_name.clone(),
            sender: self.local_record(),
            target: target.map(str::to_string),
            body,
        }
    }

    /// Send on a connection. Failures are logged and reported to the caller.
    pub fn send(
        &self,
        connection: ConnectionId,
        target: &str,
        body: Message,
    ) -> Result<(), TransportError> {
        let label = body.label();
        let envelope = self.envelope(Some(target), body);
        self.transport.send(connection, &envelope).map_err(|err| {
            debug!(
                node = %self.local,
                peer = target,
                %connection,
                message = label,
                error = %err,
                "send failed"
            );
            err
        })
    }

    /// Send on a connection whose peer name is not known yet.
    pub fn send_untargeted(
        &self,
        connection: ConnectionId,
        body: Message,
    ) -> Result<(), TransportError> {
        let envelope = self.envelope(None, body);
        self.transport.send(connection, &envelope)
    }

    /// Send a datagram.
    pub fn send_to(
        &self,
        endpoint: SocketAddr,
        target: Option<&str>,
        body: Message,
    ) -> Result<(), TransportError> {
        let envelope = self.envelope(target, body);
        self.transport.send_to(endpoint, &envelope)
    }

    pub fn send_to_multicast_group(&self, body: Message) -> Result<(), TransportError> {
        let envelope = self.envelope(None, body);
        self.transport.send_to_multicast_group(&envelope)
    }

    pub fn schedule_in(&mut self, kind: TaskKind, delay: Duration) {
        let at = self.now().after(delay);
        self.scheduler.schedule(kind, at);
    }

    pub fn schedule_now(&mut self, kind: TaskKind) {
        let now = self.now();
        self.scheduler.schedule(kind, now);
    }

    pub fn push(&mut self, effect: Effect) {
        self.effects.push_back(effect);
    }

    pub fn publish(&self, event: SpiderCastEvent) {
        self.events.publish(event);
    }

    pub fn next_stream_id(&mut self) -> u64 {
        self.next_stream_id += 1;
        self.next_stream_id
    }
}
