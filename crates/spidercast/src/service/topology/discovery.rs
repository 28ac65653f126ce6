//! Bootstrap and multicast discovery.

use std::net::SocketAddr;
use tracing::{debug, info, trace};

use super::manager::{ConnectionEntry, Inbound, TopologyManager, TopologyState};
use crate::domain::messages::{DiscoveryTransport, Message, TopologyMessage};
use crate::domain::{ConnectionId, NodeRecord};
use crate::ports::MessageSource;
use crate::service::context::NodeContext;
use crate::service::membership::MembershipService;
use crate::service::scheduler::TaskKind;

fn request(
    ctx: &mut NodeContext,
    membership: &MembershipService,
    transport: DiscoveryTransport,
) -> Message {
    let limit = ctx.config.discovery_view_limit;
    Message::Topology(TopologyMessage::DiscoveryRequest {
        transport,
        view: membership.partial_view(ctx, limit),
        part: 0,
        total: 1,
    })
}

/// Split `records` into reply parts of at most `chunk` records. An empty view
/// still yields one part.
fn reply_parts(
    records: Vec<NodeRecord>,
    chunk: usize,
    transport: DiscoveryTransport,
) -> Vec<Message> {
    let chunk = chunk.max(1);
    let parts: Vec<Vec<NodeRecord>> = if records.is_empty() {
        vec![Vec::new()]
    } else {
        records.chunks(chunk).map(<[NodeRecord]>::to_vec).collect()
    };
    let total = parts.len() as u32;
    parts
        .into_iter()
        .enumerate()
        .map(|(part, view)| {
            Message::Topology(TopologyMessage::DiscoveryReply {
                transport,
                view,
                part: part as u32,
                total,
            })
        })
        .collect()
}

impl TopologyManager {
    /// `Discovery` task: contact bootstrap endpoints and the multicast group.
    pub(crate) fn discover(&mut self, ctx: &mut NodeContext, membership: &MembershipService) {
        if !self.is_active() {
            return;
        }
        let now = ctx.now();
        let transports = ctx.config.discovery;
        let bootstrap: Vec<SocketAddr> = ctx
            .config
            .bootstrap
            .iter()
            .filter(|endpoint| !ctx.local.endpoints().contains(endpoint))
            .filter(|endpoint| !self.pending_discovery.contains_key(endpoint))
            .copied()
            .collect();

        for endpoint in bootstrap {
            if transports.tcp {
                match ctx.transport.connect(endpoint) {
                    Ok(connection) => {
                        self.connections.insert(
                            connection,
                            ConnectionEntry {
                                peer: None,
                                established: false,
                                outgoing: true,
                                discovery: Some(endpoint),
                            },
                        );
                        self.pending_discovery.insert(endpoint, now);
                    }
                    Err(err) => {
                        debug!(
                            node = %ctx.local,
                            %endpoint,
                            error = %err,
                            "bootstrap connect refused"
                        )
                    }
                }
            }
            if transports.udp {
                let body = request(ctx, membership, DiscoveryTransport::Udp);
                if ctx.send_to(endpoint, None, body).is_ok() {
                    self.pending_discovery.insert(endpoint, now);
                }
            }
        }
        if transports.multicast {
            let body = request(ctx, membership, DiscoveryTransport::Multicast);
            if let Err(err) = ctx.send_to_multicast_group(body) {
                debug!(node = %ctx.local, error = %err, "multicast discovery failed");
            }
        }

        let interval = if self.state == TopologyState::Discovery {
            ctx.config.frequent_discovery_interval
        } else {
            ctx.config.discovery_interval
        };
        ctx.schedule_in(TaskKind::Discovery, interval);
    }

    /// `EndFrequentDiscovery` task.
    pub(crate) fn end_frequent_discovery(&mut self, ctx: &mut NodeContext) {
        if self.state == TopologyState::Discovery {
            self.state = TopologyState::Normal;
            info!(node = %ctx.local, view = ?self.connectivity(), "discovery warm-up over");
            let interval = ctx.config.discovery_interval;
            ctx.schedule_in(TaskKind::Discovery, interval);
        }
    }

    pub(super) fn send_discovery_request(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        connection: ConnectionId,
    ) {
        let body = request(ctx, membership, DiscoveryTransport::Tcp);
        if ctx.send_untargeted(connection, body).is_err() {
            self.close_discovery(ctx, connection);
        }
    }

    /// Answer a discovery request with the full view, in parts. Multicast
    /// requests are answered only when they taught us something.
    pub(super) fn on_discovery_request(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        inbound: Inbound<'_>,
        transport: DiscoveryTransport,
    ) {
        if !self.is_active() {
            return;
        }
        let sender = inbound.sender;
        if let MessageSource::Multicast(_) = inbound.source {
            if inbound.sender_was_known && !inbound.view_changed {
                trace!(node = %ctx.local, peer = %sender, "ignoring multicast discovery");
                return;
            }
        }

        let chunk = ctx.config.discovery_view_chunk;
        let parts = reply_parts(membership.view().records(), chunk, transport);
        trace!(
            node = %ctx.local,
            peer = %sender,
            parts = parts.len(),
            ?transport,
            "discovery reply"
        );
        for body in parts {
            let sent = match inbound.source {
                MessageSource::Connection(connection) => ctx.send(connection, sender.name(), body),
                MessageSource::Datagram(endpoint) => {
                    ctx.send_to(endpoint, Some(sender.name()), body)
                }
                MessageSource::Multicast(endpoint) => {
                    let endpoint = sender.primary_endpoint().unwrap_or(endpoint);
                    ctx.send_to(endpoint, Some(sender.name()), body)
                }
            };
            if sent.is_err() {
                break;
            }
        }
    }

    /// A reply part arrived; the last part of a bootstrap exchange closes
    /// its connection.
    pub(super) fn on_discovery_reply(
        &mut self,
        ctx: &mut NodeContext,
        inbound: Inbound<'_>,
        part: u32,
        total: u32,
    ) {
        match inbound.source {
            MessageSource::Connection(connection) => {
                let endpoint = self.connections.get(&connection).and_then(|e| e.discovery);
                if let Some(endpoint) = endpoint {
                    self.pending_discovery.remove(&endpoint);
                    if part.saturating_add(1) >= total {
                        self.close_discovery(ctx, connection);
                    }
                }
            }
            MessageSource::Datagram(endpoint) | MessageSource::Multicast(endpoint) => {
                self.pending_discovery.remove(&endpoint);
            }
        }
        for endpoint in inbound.sender.endpoints() {
            self.pending_discovery.remove(endpoint);
        }
    }

    fn close_discovery(&mut self, ctx: &NodeContext, connection: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&connection) {
            if let Some(endpoint) = entry.discovery.take() {
                self.pending_discovery.remove(&endpoint);
            }
        }
        self.release_connection(ctx, connection);
    }
}
