//! Connect and disconnect handshakes for all link types.

use tracing::{debug, trace};

use super::manager::{
    AttemptPhase, ConnectAttempt, ConnectionEntry, Inbound, PendingDisconnect, TopologyManager,
};
use crate::domain::messages::{Message, TopologyMessage};
use crate::domain::{ConnectionId, LinkType, Neighbor, NodeRecord, NodeRef, ProtocolError};
use crate::ports::TransportError;
use crate::service::context::NodeContext;
use crate::service::membership::MembershipService;
use crate::service::scheduler::TaskKind;

fn topology(msg: TopologyMessage) -> Message {
    Message::Topology(msg)
}

impl TopologyManager {
    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Handle a topology message. Discovery exchanges may arrive from any
    /// source; everything else needs a connection.
    pub(crate) fn on_message(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        inbound: Inbound<'_>,
        msg: &TopologyMessage,
    ) -> Result<(), ProtocolError> {
        let sender = inbound.sender;
        match msg {
            TopologyMessage::DiscoveryRequest { transport, .. } => {
                self.on_discovery_request(ctx, membership, inbound, *transport);
                return Ok(());
            }
            TopologyMessage::DiscoveryReply { part, total, .. } => {
                self.on_discovery_reply(ctx, inbound, *part, *total);
                return Ok(());
            }
            _ => {}
        }
        let Some(connection) = inbound.source.connection() else {
            return Err(ProtocolError::Unexpected {
                peer: sender.name().to_string(),
                detail: format!("{} outside a connection", msg.label()),
            });
        };

        match msg {
            TopologyMessage::ConnectSuccessor => self.on_connect_successor(ctx, sender, connection),
            TopologyMessage::ConnectSuccessorOk { accepted } => {
                self.on_connect_successor_ok(ctx, sender, connection, *accepted)
            }
            TopologyMessage::ConnectRandomRequest { vacancy, urgent } => {
                self.on_connect_random_request(
                    ctx, membership, sender, connection, *vacancy, *urgent,
                )
            }
            TopologyMessage::ConnectRandomReply {
                accepted,
                vacancy,
                redirect,
            } => self.on_connect_random_reply(
                ctx,
                sender,
                connection,
                *accepted,
                *vacancy,
                redirect.as_ref(),
            ),
            TopologyMessage::ConnectStructuredRequest { degree } => {
                self.on_connect_structured_request(ctx, sender, connection, *degree)
            }
            TopologyMessage::ConnectStructuredReply { accepted, degree } => {
                self.on_connect_structured_reply(ctx, sender, *accepted, *degree)
            }
            TopologyMessage::DisconnectRequest { link_type, vacancy } => {
                self.on_disconnect_request(ctx, sender, connection, *link_type, *vacancy)
            }
            TopologyMessage::DisconnectReply {
                link_type,
                accepted,
                vacancy,
            } => self.on_disconnect_reply(ctx, sender, *link_type, *accepted, *vacancy),
            TopologyMessage::DegreeChanged { vacancy } => {
                self.on_degree_changed(ctx, sender, *vacancy)
            }
            TopologyMessage::NodeLeave { .. } => self.on_peer_left(ctx, sender.name()),
            TopologyMessage::DiscoveryRequest { .. } | TopologyMessage::DiscoveryReply { .. } => {}
        }
        Ok(())
    }

    // =========================================================================
    // OUTGOING ATTEMPTS
    // =========================================================================

    /// Start a handshake with `peer`, reusing a connection when one exists.
    pub(super) fn begin_attempt(
        &mut self,
        ctx: &mut NodeContext,
        peer: NodeRef,
        link: LinkType,
        urgent: bool,
    ) {
        let key = (peer.name().to_string(), link);
        if self.attempts.contains_key(&key) {
            return;
        }
        let started = ctx.now();
        let (connection, phase) = match self.connection_to(peer.name()) {
            Some((connection, true)) => (connection, AttemptPhase::RequestSent),
            Some((connection, false)) => (connection, AttemptPhase::Connecting),
            None => {
                let Some(endpoint) = peer.primary_endpoint() else {
                    debug!(node = %ctx.local, %peer, "no endpoint to connect to");
                    self.count_connect_failure(ctx, &peer);
                    return;
                };
                match ctx.transport.connect(endpoint) {
                    Ok(connection) => {
                        self.connections.insert(
                            connection,
                            ConnectionEntry {
                                peer: Some(peer.clone()),
                                established: false,
                                outgoing: true,
                                discovery: None,
                            },
                        );
                        (connection, AttemptPhase::Connecting)
                    }
                    Err(err) => {
                        debug!(
                            node = %ctx.local,
                            %peer,
                            %endpoint,
                            error = %err,
                            "connect refused"
                        );
                        self.count_connect_failure(ctx, &peer);
                        return;
                    }
                }
            }
        };

        trace!(node = %ctx.local, %peer, %link, %connection, ?phase, "connect attempt");
        let attempt = ConnectAttempt {
            peer,
            link,
            connection,
            phase,
            started,
            urgent,
        };
        if phase == AttemptPhase::RequestSent && self.send_connect_request(ctx, &attempt).is_err() {
            self.fail_attempt(ctx, attempt);
            return;
        }
        self.attempts.insert(key, attempt);
    }

    fn send_connect_request(
        &self,
        ctx: &NodeContext,
        attempt: &ConnectAttempt,
    ) -> Result<(), TransportError> {
        let body = match attempt.link {
            LinkType::Successor => TopologyMessage::ConnectSuccessor,
            LinkType::Random => TopologyMessage::ConnectRandomRequest {
                vacancy: self.random_vacancy(ctx.config.random_degree),
                urgent: attempt.urgent,
            },
            LinkType::Structured => TopologyMessage::ConnectStructuredRequest {
                degree: self.structured_out.len() as u32,
            },
        };
        ctx.send(attempt.connection, attempt.peer.name(), topology(body))
    }

    /// The transport finished dialing `connection`.
    pub(crate) fn on_connect_succeeded(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        connection: ConnectionId,
    ) {
        let Some(entry) = self.connections.get_mut(&connection) else {
            debug!(node = %ctx.local, %connection, "connect succeeded for unknown connection");
            ctx.transport.disconnect(connection);
            return;
        };
        entry.established = true;
        if entry.discovery.is_some() {
            self.send_discovery_request(ctx, membership, connection);
            return;
        }

        let waiting: Vec<_> = self
            .attempts
            .iter()
            .filter(|(_, a)| a.connection == connection && a.phase == AttemptPhase::Connecting)
            .map(|(key, _)| key.clone())
            .collect();
        for key in waiting {
            let Some(attempt) = self.attempts.get_mut(&key) else {
                continue;
            };
            attempt.phase = AttemptPhase::RequestSent;
            let attempt = attempt.clone();
            if self.send_connect_request(ctx, &attempt).is_err() {
                self.attempts.remove(&key);
                self.fail_attempt(ctx, attempt);
            }
        }
    }

    fn take_attempt(&mut self, name: &str, link: LinkType) -> Option<ConnectAttempt> {
        self.attempts.remove(&(name.to_string(), link))
    }

    pub(super) fn request_disconnect(
        &mut self,
        ctx: &NodeContext,
        peer: &str,
        connection: ConnectionId,
        link: LinkType,
    ) {
        let body = topology(TopologyMessage::DisconnectRequest {
            link_type: link,
            vacancy: self.random_vacancy(ctx.config.random_degree),
        });
        if ctx.send(connection, peer, body).is_ok() {
            self.pending_disconnects.insert(
                (peer.to_string(), link),
                PendingDisconnect {
                    connection,
                    since: ctx.now(),
                },
            );
        } else {
            self.release_connection(ctx, connection);
        }
    }

    // =========================================================================
    // RING
    // =========================================================================

    fn on_connect_successor(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        connection: ConnectionId,
    ) {
        let accepted = self.is_active();
        if accepted && !self.predecessors.contains(sender.name()) {
            let stream = ctx.next_stream_id();
            let neighbor = Neighbor::new(sender.clone(), connection, stream, ctx.now()).routable();
            self.predecessors.insert(neighbor);
            self.link_established(ctx, sender, LinkType::Successor, connection);
        }
        let _ = ctx.send(
            connection,
            sender.name(),
            topology(TopologyMessage::ConnectSuccessorOk { accepted }),
        );
    }

    fn on_connect_successor_ok(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        connection: ConnectionId,
        accepted: bool,
    ) {
        let attempt = self.take_attempt(sender.name(), LinkType::Successor);
        let wanted = self
            .desired_successor
            .as_ref()
            .is_some_and(|d| d.name() == sender.name());
        let attempt = match attempt {
            Some(attempt) if wanted => attempt,
            other => {
                if accepted {
                    debug!(node = %ctx.local, peer = %sender, "successor link no longer wanted");
                    self.request_disconnect(ctx, sender.name(), connection, LinkType::Successor);
                }
                if let Some(stale) = other {
                    self.release_connection(ctx, stale.connection);
                }
                return;
            }
        };
        if !accepted {
            self.fail_attempt(ctx, attempt);
            return;
        }

        self.successor_failures.remove(sender.name());
        let stream = ctx.next_stream_id();
        let neighbor = Neighbor::new(sender.clone(), connection, stream, ctx.now()).routable();
        let previous = self.successor.replace(neighbor);
        self.link_established(ctx, sender, LinkType::Successor, connection);
        if let Some(previous) = previous.filter(|p| p.name() != sender.name()) {
            self.link_lost(ctx, &previous.node, LinkType::Successor);
            self.request_disconnect(ctx, previous.name(), previous.connection, LinkType::Successor);
        }
    }

    // =========================================================================
    // RANDOM
    // =========================================================================

    fn random_reply(
        &self,
        ctx: &NodeContext,
        peer: &str,
        connection: ConnectionId,
        accepted: bool,
        redirect: Option<NodeRecord>,
    ) {
        let body = topology(TopologyMessage::ConnectRandomReply {
            accepted,
            vacancy: self.random_vacancy(ctx.config.random_degree),
            redirect,
        });
        let _ = ctx.send(connection, peer, body);
    }

    fn on_connect_random_request(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        sender: &NodeRef,
        connection: ConnectionId,
        vacancy: i32,
        urgent: bool,
    ) {
        let name = sender.name();
        if !self.is_active() {
            self.random_reply(ctx, name, connection, false, None);
            return;
        }
        if self.random.contains(name) {
            self.random.set_vacancy(name, vacancy);
            self.random_reply(ctx, name, connection, true, None);
            return;
        }
        if self.attempts.contains_key(&(name.to_string(), LinkType::Random)) {
            // Simultaneous requests: the greater name yields its own attempt.
            if ctx.local_name() < name {
                trace!(node = %ctx.local, peer = %sender, "rejecting crossed random request");
                self.random_reply(ctx, name, connection, false, None);
                return;
            }
            if let Some(own) = self.take_attempt(name, LinkType::Random) {
                if own.connection != connection {
                    self.release_connection(ctx, own.connection);
                }
            }
        }
        if self.random.len() >= ctx.config.random_upper_bound() && !urgent {
            let redirect = self
                .random
                .highest_vacancy(name)
                .and_then(|n| membership.view().get(n.name()))
                .map(|entry| entry.record());
            debug!(node = %ctx.local, peer = %sender, "random degree full, rejecting");
            self.random_reply(ctx, name, connection, false, redirect);
            return;
        }

        let stream = ctx.next_stream_id();
        let neighbor = Neighbor::new(sender.clone(), connection, stream, ctx.now())
            .routable()
            .with_vacancy(vacancy);
        self.random.insert(neighbor);
        self.link_established(ctx, sender, LinkType::Random, connection);
        self.random_reply(ctx, name, connection, true, None);
        self.random_degree_changed(ctx);
    }

    fn on_connect_random_reply(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        connection: ConnectionId,
        accepted: bool,
        vacancy: i32,
        redirect: Option<&NodeRecord>,
    ) {
        let Some(attempt) = self.take_attempt(sender.name(), LinkType::Random) else {
            if accepted && !self.random.contains(sender.name()) {
                debug!(node = %ctx.local, peer = %sender, "undoing stale random accept");
                self.request_disconnect(ctx, sender.name(), connection, LinkType::Random);
            }
            return;
        };

        if !accepted {
            self.random_rejections += 1;
            self.redirect = redirect
                .map(|r| r.name.clone())
                .filter(|r| r != ctx.local_name());
            debug!(
                node = %ctx.local,
                peer = %sender,
                rejections = self.random_rejections,
                redirect = self.redirect.as_deref().unwrap_or("-"),
                "random connect rejected"
            );
            self.release_connection(ctx, attempt.connection);
            let retry = ctx.config.connect_retry_delay;
            ctx.schedule_in(TaskKind::RandomConnect, retry);
            return;
        }

        self.random_rejections = 0;
        self.connect_failures.remove(sender.name());
        let stream = ctx.next_stream_id();
        let neighbor = Neighbor::new(sender.clone(), connection, stream, ctx.now())
            .routable()
            .with_vacancy(vacancy);
        self.random.insert(neighbor);
        self.link_established(ctx, sender, LinkType::Random, connection);
        if attempt.connection != connection {
            self.release_connection(ctx, attempt.connection);
        }
        self.random_degree_changed(ctx);
    }

    /// Follow-up work after the random degree moved.
    pub(super) fn random_degree_changed(&self, ctx: &mut NodeContext) {
        ctx.schedule_now(TaskKind::DegreeUpdate);
        if self.random.len() > ctx.config.random_upper_bound() {
            ctx.schedule_now(TaskKind::RandomDisconnect);
        }
        if self.random.len() < ctx.config.random_degree {
            ctx.schedule_now(TaskKind::RandomConnect);
        }
    }

    fn on_degree_changed(&mut self, ctx: &mut NodeContext, sender: &NodeRef, vacancy: i32) {
        if self.random.set_vacancy(sender.name(), vacancy)
            && self.random.len() > ctx.config.random_upper_bound()
        {
            ctx.schedule_now(TaskKind::RandomDisconnect);
        }
    }

    // =========================================================================
    // STRUCTURED
    // =========================================================================

    fn on_connect_structured_request(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        connection: ConnectionId,
        _degree: u32,
    ) {
        let limit = ctx.config.structured_degree + ctx.config.structured_margin;
        let known = self.structured_in.contains(sender.name());
        let accepted = self.is_active() && (known || self.structured_in.len() < limit);
        if accepted && !known {
            let stream = ctx.next_stream_id();
            let neighbor = Neighbor::new(sender.clone(), connection, stream, ctx.now()).routable();
            self.structured_in.insert(neighbor);
            self.link_established(ctx, sender, LinkType::Structured, connection);
        }
        let body = topology(TopologyMessage::ConnectStructuredReply {
            accepted,
            degree: self.structured_in.len() as u32,
        });
        let _ = ctx.send(connection, sender.name(), body);
    }

    fn on_connect_structured_reply(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        accepted: bool,
        degree: u32,
    ) {
        let Some(attempt) = self.take_attempt(sender.name(), LinkType::Structured) else {
            return;
        };
        if !accepted {
            self.release_connection(ctx, attempt.connection);
            let retry = ctx.config.connect_retry_delay;
            ctx.schedule_in(TaskKind::StructuredConnect, retry);
            return;
        }
        self.connect_failures.remove(sender.name());
        let stream = ctx.next_stream_id();
        let neighbor =
            Neighbor::new(sender.clone(), attempt.connection, stream, ctx.now()).routable();
        self.structured_out.insert(neighbor, degree);
        self.link_established(ctx, sender, LinkType::Structured, attempt.connection);
    }

    // =========================================================================
    // DISCONNECT
    // =========================================================================

    fn on_disconnect_request(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        connection: ConnectionId,
        link: LinkType,
        vacancy: i32,
    ) {
        let name = sender.name();
        let removed = match link {
            LinkType::Random => {
                if self.random.contains(name) && self.random.len() <= ctx.config.random_degree {
                    self.random.set_vacancy(name, vacancy);
                    None
                } else {
                    Some(self.random.remove(name))
                }
            }
            LinkType::Successor => Some(self.predecessors.remove(name)),
            LinkType::Structured => Some(self.structured_in.remove(name)),
        };
        let accepted = removed.is_some();
        if let Some(Some(neighbor)) = &removed {
            self.link_lost(ctx, &neighbor.node, link);
        }
        debug!(node = %ctx.local, peer = %sender, %link, accepted, "disconnect requested");

        let body = topology(TopologyMessage::DisconnectReply {
            link_type: link,
            accepted,
            vacancy: self.random_vacancy(ctx.config.random_degree),
        });
        let _ = ctx.send(connection, name, body);

        if let Some(Some(neighbor)) = removed {
            self.release_connection(ctx, neighbor.connection);
            if link == LinkType::Random {
                self.random_degree_changed(ctx);
            }
        }
    }

    fn on_disconnect_reply(
        &mut self,
        ctx: &mut NodeContext,
        sender: &NodeRef,
        link: LinkType,
        accepted: bool,
        vacancy: i32,
    ) {
        let key = (sender.name().to_string(), link);
        let Some(pending) = self.pending_disconnects.remove(&key) else {
            return;
        };
        if link == LinkType::Random {
            if accepted {
                self.disconnect_refusals = 0;
                if let Some(neighbor) = self.random.remove(sender.name()) {
                    self.link_lost(ctx, &neighbor.node, LinkType::Random);
                }
                self.random_degree_changed(ctx);
            } else {
                self.disconnect_refusals += 1;
                self.random.set_vacancy(sender.name(), vacancy);
                let delay = self.disconnect_backoff(ctx);
                ctx.schedule_in(TaskKind::RandomDisconnect, delay);
            }
        }
        self.release_connection(ctx, pending.connection);
    }

    pub(super) fn disconnect_backoff(&self, ctx: &NodeContext) -> std::time::Duration {
        ctx.config.degree_check_interval * (1 + self.disconnect_refusals.min(8))
    }
}
