//! Attribute manager implementation.

use std::cmp::Ordering;
use tracing::{debug, trace};

use crate::domain::events::{NodeSnapshot, ViewNotification};
use crate::domain::messages::{DigestItem, Message, MetadataMessage, ReplyItem, TableDelta};
use crate::domain::{
    ConnectionId, FatalError, FatalErrorCode, Located, NodeVersion, SharedTable, ViewEntry,
};
use crate::service::context::{Effect, NodeContext};
use crate::service::membership::{MembershipService, Peers};
use crate::service::scheduler::TaskKind;

/// Anti-entropy protocol engine and view notification source.
#[derive(Debug)]
pub struct AttributeManager {
    local_table: SharedTable,
    full_view_pending: bool,
}

fn incarnation_ahead(name: &str, remote: NodeVersion, local: NodeVersion) -> FatalError {
    FatalError::new(
        FatalErrorCode::IncarnationAhead,
        format!("peer reports {name} at {remote}, alive locally at {local}"),
    )
}

fn digest_item(entry: &ViewEntry, table_version: u64) -> DigestItem {
    DigestItem {
        name: entry.node.name().to_string(),
        version: entry.version,
        table_version,
    }
}

/// Ask every neighbor. Failed sends are left to the expiry retry.
fn push_request(ctx: &NodeContext, digest: &[DigestItem], peers: &Peers) {
    for (peer, connection) in peers {
        let body = Message::Metadata(MetadataMessage::Request {
            digest: digest.to_vec(),
        });
        let _ = ctx.send(*connection, peer, body);
    }
}

impl AttributeManager {
    pub(crate) fn new(local_table: SharedTable) -> Self {
        Self {
            local_table,
            full_view_pending: true,
        }
    }

    pub fn local_table(&self) -> &SharedTable {
        &self.local_table
    }

    /// Make the next notification carry the full view.
    pub(crate) fn request_full_view(&mut self) {
        self.full_view_pending = true;
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// `AttributeUpdate` task: announce every table with unsent versions.
    pub(crate) fn send_updates(
        &self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        peers: &Peers,
    ) {
        if self.local_table.lock().notify_needed() {
            ctx.schedule_now(TaskKind::AttributeNotify);
        }
        if peers.is_empty() {
            return;
        }
        self.retry_expired(ctx, membership, peers);
        let digest: Vec<DigestItem> = membership
            .view()
            .iter()
            .filter_map(|entry| {
                let table = entry.table.lock();
                let unsent = table.version() > table.version_sent();
                unsent.then(|| digest_item(entry, table.version()))
            })
            .collect();
        if digest.is_empty() {
            return;
        }

        let mut delivered = false;
        for (peer, connection) in peers {
            let body = Message::Metadata(MetadataMessage::Update {
                digest: digest.clone(),
            });
            delivered |= ctx.send(*connection, peer, body).is_ok();
        }
        if !delivered {
            return;
        }
        for item in &digest {
            if let Some(entry) = membership.view().get(&item.name) {
                entry.table.lock().mark_version_sent(item.table_version);
            }
        }
        debug!(
            node = %ctx.local,
            tables = digest.len(),
            peers = peers.len(),
            "sent metadata digest"
        );
    }

    /// Re-issue requests that outlived their timeout as one push request.
    fn retry_expired(&self, ctx: &NodeContext, membership: &MembershipService, peers: &Peers) {
        let now = ctx.now();
        let timeout = ctx.config.attribute_request_timeout;
        let mut push = Vec::new();
        for entry in membership.view().iter() {
            let mut table = entry.table.lock();
            let Some(version) = table.expired_pending(now, timeout) else {
                continue;
            };
            table.clear_pending();
            if version > table.version() {
                table.mark_pending(version, None, now);
                push.push(digest_item(entry, table.version()));
            }
        }
        if push.is_empty() {
            return;
        }
        debug!(node = %ctx.local, items = push.len(), "re-issuing expired table requests");
        push_request(ctx, &push, peers);
    }

    /// Full digest for a newly routable neighbor, regardless of `version_sent`.
    pub(crate) fn send_full_digest(
        &self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        peer: &str,
        connection: ConnectionId,
    ) {
        let digest = membership
            .view()
            .iter()
            .map(|entry| digest_item(entry, entry.table.lock().version()))
            .collect();
        let body = Message::Metadata(MetadataMessage::Update { digest });
        if ctx.send(connection, peer, body).is_err() {
            ctx.push(Effect::ResyncFailed(connection));
        }
    }

    /// Handle a digest: request every table we hold an older version of.
    pub(crate) fn on_update(
        &self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        sender: &str,
        connection: ConnectionId,
        digest: &[DigestItem],
    ) -> Result<(), FatalError> {
        let now = ctx.now();
        let timeout = ctx.config.attribute_request_timeout;
        let mut request = Vec::new();

        for item in digest {
            if item.name == ctx.local_name() {
                continue;
            }
            let Some(Located::View(entry)) = membership.lookup(&ctx.cache, &item.name)? else {
                continue;
            };
            match item.version.incarnation.cmp(&entry.version.incarnation) {
                Ordering::Less => continue,
                Ordering::Greater => {
                    return Err(incarnation_ahead(&item.name, item.version, entry.version))
                }
                Ordering::Equal => {}
            }
            let mut table = entry.table.lock();
            if table.version() >= item.table_version
                || table.pending_covers(item.table_version, now, timeout)
            {
                continue;
            }
            table.mark_pending(item.table_version, Some(sender.to_string()), now);
            request.push(digest_item(entry, table.version()));
        }

        if request.is_empty() {
            return Ok(());
        }
        trace!(node = %ctx.local, peer = sender, items = request.len(), "requesting tables");
        let body = Message::Metadata(MetadataMessage::Request {
            digest: request.clone(),
        });
        if ctx.send(connection, sender, body).is_err() {
            for item in &request {
                if let Some(entry) = membership.view().get(&item.name) {
                    entry.table.lock().clear_pending_from(sender);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // REQUEST / REPLY
    // =========================================================================

    /// Answer a request with deltas, empty deltas or invalidations.
    pub(crate) fn on_request(
        &self,
        ctx: &NodeContext,
        membership: &MembershipService,
        sender: &str,
        connection: ConnectionId,
        digest: &[DigestItem],
    ) -> Result<(), FatalError> {
        let mut items = Vec::with_capacity(digest.len());
        for item in digest {
            let invalidated = ReplyItem {
                name: item.name.clone(),
                version: item.version,
                table_version: 0,
                delta: TableDelta::Invalidated,
            };
            let reply = match membership.lookup(&ctx.cache, &item.name)? {
                Some(Located::View(entry)) => {
                    match item.version.incarnation.cmp(&entry.version.incarnation) {
                        Ordering::Greater => {
                            return Err(incarnation_ahead(&item.name, item.version, entry.version))
                        }
                        Ordering::Less => invalidated,
                        Ordering::Equal => {
                            let table = entry.table.lock();
                            let entries = if table.version() > item.table_version {
                                table.delta_since(item.table_version)
                            } else {
                                Vec::new()
                            };
                            ReplyItem {
                                name: item.name.clone(),
                                version: entry.version,
                                table_version: table.version(),
                                delta: TableDelta::Entries(entries),
                            }
                        }
                    }
                }
                Some(Located::History(_)) | None => invalidated,
            };
            items.push(reply);
        }
        trace!(node = %ctx.local, peer = sender, items = items.len(), "replying to table request");
        let answered: Vec<String> = items
            .iter()
            .filter(|item| matches!(item.delta, TableDelta::Entries(_)))
            .map(|item| item.name.clone())
            .collect();
        let body = Message::Metadata(MetadataMessage::Reply { items });
        if ctx.send(connection, sender, body).is_err() {
            // Lost deltas go out again with the next digest.
            for name in &answered {
                if let Some(entry) = membership.view().get(name) {
                    entry.table.lock().reannounce();
                }
            }
        }
        Ok(())
    }

    /// Merge a reply. Invalidations of a request targeted at `sender` turn
    /// into one push request to every routable neighbor.
    pub(crate) fn on_reply(
        &self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
        sender: &str,
        items: &[ReplyItem],
        peers: &Peers,
    ) -> Result<(), FatalError> {
        let now = ctx.now();
        let mut push = Vec::new();
        let mut changed = false;

        for item in items {
            if item.name == ctx.local_name() {
                continue;
            }
            let entry = match membership.lookup(&ctx.cache, &item.name)? {
                None => continue,
                Some(Located::History(entry)) => {
                    if let Some(table) = &entry.table {
                        table.lock().clear_pending_from(sender);
                    }
                    continue;
                }
                Some(Located::View(entry)) => entry,
            };
            match item.version.incarnation.cmp(&entry.version.incarnation) {
                Ordering::Less => continue,
                Ordering::Greater => {
                    return Err(incarnation_ahead(&item.name, item.version, entry.version))
                }
                Ordering::Equal => {}
            }

            let mut table = entry.table.lock();
            match &item.delta {
                TableDelta::Invalidated => {
                    let targeted = table
                        .pending()
                        .filter(|p| p.target.as_deref() == Some(sender))
                        .map(|p| p.version);
                    table.clear_pending();
                    if let Some(version) = targeted {
                        table.mark_pending(version, None, now);
                        push.push(digest_item(entry, table.version()));
                    }
                }
                TableDelta::Entries(entries) => {
                    changed |= table.merge(item.table_version, entries);
                    let satisfied = table.pending().is_some_and(|p| {
                        p.version <= table.version() || p.target.as_deref() == Some(sender)
                    });
                    if satisfied {
                        table.clear_pending();
                    }
                }
            }
        }

        if changed {
            ctx.schedule_now(TaskKind::AttributeNotify);
            ctx.schedule_now(TaskKind::AttributeUpdate);
        }
        if !push.is_empty() {
            debug!(
                node = %ctx.local,
                peer = sender,
                items = push.len(),
                "pushing request after invalidation"
            );
            push_request(ctx, &push, peers);
        }
        Ok(())
    }

    // =========================================================================
    // NOTIFICATION
    // =========================================================================

    /// Build the next view notification, or `None` if nothing changed.
    ///
    /// Dirty flags are cleared under each table's lock, so a local write that
    /// races with this call is reported by the next notification.
    pub(crate) fn prepare_notification(
        &mut self,
        membership: &mut MembershipService,
    ) -> Option<ViewNotification> {
        let full = std::mem::take(&mut self.full_view_pending);
        let (joined, departed) = membership.take_notification_changes();

        let mut nodes = Vec::new();
        for entry in membership.view().iter() {
            let mut table = entry.table.lock();
            let dirty = table.take_notify();
            if full || dirty || joined.contains(entry.node.name()) {
                nodes.push(NodeSnapshot {
                    name: entry.node.name().to_string(),
                    version: entry.version,
                    attributes: table.snapshot(),
                });
            }
        }

        if !full && nodes.is_empty() && departed.is_empty() {
            return None;
        }
        Some(ViewNotification {
            full,
            nodes,
            departed: departed.into_iter().collect(),
        })
    }
}
