//! Membership service implementation.

use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::domain::events::{DuplicateNodeEvent, SpiderCastEvent};
use crate::domain::messages::{DepartureKind, DepartureRecord, MembershipMessage, Message};
use crate::domain::{
    AttributeTable, ConnectionId, FatalError, FatalErrorCode, HistoryEntry, HistoryStatus,
    Located, MembershipViewMap, NodeHistoryMap, NodeIdCache, NodeRecord, NodeRef, NodeVersion,
    SharedTable, ViewEntry,
};
use crate::service::context::{Effect, NodeContext};

/// Routable neighbors as `(name, connection)` pairs.
pub(crate) type Peers = [(String, ConnectionId)];

#[derive(Debug, Clone)]
enum MembershipChange {
    Joined(NodeRecord),
    Departed(DepartureRecord),
}

/// Live view, departure history and ring successor of one node.
#[derive(Debug)]
pub struct MembershipService {
    view: MembershipViewMap,
    history: NodeHistoryMap,
    successor: Option<NodeRef>,
    /// View changes since start; drives structured refresh.
    churn: u64,
    joined_since_notify: BTreeSet<String>,
    departed_since_notify: BTreeSet<String>,
    reported_duplicate: Option<NodeVersion>,
}

impl MembershipService {
    pub(crate) fn new(ctx: &NodeContext, local_table: SharedTable) -> Self {
        let mut view = MembershipViewMap::new();
        view.insert(ViewEntry::new(ctx.local.clone(), ctx.version, local_table));
        Self {
            view,
            history: NodeHistoryMap::new(),
            successor: None,
            churn: 0,
            joined_since_notify: BTreeSet::new(),
            departed_since_notify: BTreeSet::new(),
            reported_duplicate: None,
        }
    }

    pub fn view(&self) -> &MembershipViewMap {
        &self.view
    }

    pub fn history(&self) -> &NodeHistoryMap {
        &self.history
    }

    pub fn successor(&self) -> Option<&NodeRef> {
        self.successor.as_ref()
    }

    pub fn churn(&self) -> u64 {
        self.churn
    }

    /// Locate a name known to the identity cache.
    ///
    /// Returns `Ok(None)` for names the cache does not know. A cached name
    /// that is in neither map, or in both, is a consistency violation.
    pub(crate) fn lookup<'a>(
        &'a self,
        cache: &NodeIdCache,
        name: &str,
    ) -> Result<Option<Located<'a>>, FatalError> {
        if !cache.contains(name) {
            return Ok(None);
        }
        match (self.view.get(name), self.history.get(name)) {
            (Some(entry), None) => Ok(Some(Located::View(entry))),
            (None, Some(entry)) => Ok(Some(Located::History(entry))),
            (Some(_), Some(_)) => Err(FatalError::new(
                FatalErrorCode::ViewHistoryOverlap,
                format!("{name} is both alive and departed"),
            )),
            (None, None) => Err(FatalError::new(
                FatalErrorCode::UnknownCachedNode,
                format!("{name} is cached but neither alive nor departed"),
            )),
        }
    }

    // =========================================================================
    // INBOUND RECORDS
    // =========================================================================

    /// Merge membership records; applied changes are flooded to `peers`.
    /// Returns whether the view changed.
    pub(crate) fn merge_records(
        &mut self,
        ctx: &mut NodeContext,
        records: &[NodeRecord],
        peers: &Peers,
    ) -> bool {
        let changes: Vec<_> = records
            .iter()
            .filter_map(|record| self.apply_record(ctx, record))
            .collect();
        self.commit(ctx, changes, peers)
    }

    /// Apply a `MembershipUpdate` received from `sender`.
    pub(crate) fn handle_update(
        &mut self,
        ctx: &mut NodeContext,
        sender: &str,
        joined: &[NodeRecord],
        departed: &[DepartureRecord],
        peers: &Peers,
    ) -> bool {
        let mut changes: Vec<_> = joined
            .iter()
            .filter_map(|record| self.apply_record(ctx, record))
            .collect();
        changes.extend(
            departed
                .iter()
                .filter_map(|departure| self.apply_departure(ctx, departure)),
        );
        debug!(
            node = %ctx.local,
            peer = sender,
            joined = joined.len(),
            departed = departed.len(),
            applied = changes.len(),
            "membership update"
        );
        // Skip the sender, except for a refutation.
        let refuting = changes.iter().any(|change| {
            matches!(change, MembershipChange::Joined(record) if record.name == ctx.local_name())
        });
        let forward: Vec<(String, ConnectionId)> = peers
            .iter()
            .filter(|(peer, _)| refuting || peer != sender)
            .cloned()
            .collect();
        self.commit(ctx, changes, &forward)
    }

    /// Topology reports `node` unreachable.
    pub(crate) fn report_suspect(&mut self, ctx: &mut NodeContext, node: &NodeRef, peers: &Peers) {
        let Some(entry) = self.view.get(node.name()) else {
            return;
        };
        if node.name() == ctx.local_name() {
            return;
        }
        let departure = DepartureRecord {
            name: node.name().to_string(),
            version: entry.version,
            kind: DepartureKind::Suspect,
        };
        info!(node = %ctx.local, peer = %node, version = %entry.version, "suspecting node");
        let changes: Vec<_> = self.apply_departure(ctx, &departure).into_iter().collect();
        self.commit(ctx, changes, peers);
    }

    /// `name` announced a graceful departure at `version`.
    pub(crate) fn node_left(
        &mut self,
        ctx: &mut NodeContext,
        name: &str,
        version: NodeVersion,
        peers: &Peers,
    ) {
        let departure = DepartureRecord {
            name: name.to_string(),
            version,
            kind: DepartureKind::Leave,
        };
        let changes: Vec<_> = self.apply_departure(ctx, &departure).into_iter().collect();
        self.commit(ctx, changes, peers);
    }

    fn apply_record(
        &mut self,
        ctx: &mut NodeContext,
        record: &NodeRecord,
    ) -> Option<MembershipChange> {
        if record.name == ctx.local_name() {
            if record.version.incarnation > ctx.version.incarnation {
                self.report_duplicate(ctx, record.version);
            }
            return None;
        }

        if let Some(entry) = self.view.get(&record.name) {
            if record.version < entry.version {
                return None;
            }
            if record.version == entry.version {
                let conflicting = !record.endpoints.is_empty()
                    && record.endpoints.as_slice() != entry.node.endpoints();
                if conflicting {
                    self.retire_duplicate(ctx, &record.name);
                }
                return None;
            }
            let new_incarnation = record.version.incarnation > entry.version.incarnation;
            let node = ctx.cache.intern(record.node_id());
            if let Some(entry) = self.view.get_mut(&record.name) {
                if new_incarnation {
                    entry.table = AttributeTable::shared();
                }
                entry.version = record.version;
                entry.node = node;
            }
            if new_incarnation {
                self.churn += 1;
            }
            self.joined_since_notify.insert(record.name.clone());
            debug!(
                node = %ctx.local,
                peer = %record.name,
                version = %record.version,
                "refreshed view entry"
            );
            return Some(MembershipChange::Joined(record.clone()));
        }

        let table = match self.history.get(&record.name) {
            Some(past) if record.version <= past.version => return None,
            Some(past) if past.version.incarnation == record.version.incarnation => past
                .table
                .clone()
                .unwrap_or_else(AttributeTable::shared),
            _ => AttributeTable::shared(),
        };
        self.history.remove(&record.name);
        let node = ctx.cache.intern(record.node_id());
        self.view.insert(ViewEntry::new(node, record.version, table));
        self.churn += 1;
        self.departed_since_notify.remove(&record.name);
        self.joined_since_notify.insert(record.name.clone());
        info!(
            node = %ctx.local,
            peer = %record.name,
            version = %record.version,
            "node joined view"
        );
        Some(MembershipChange::Joined(record.clone()))
    }

    fn apply_departure(
        &mut self,
        ctx: &mut NodeContext,
        departure: &DepartureRecord,
    ) -> Option<MembershipChange> {
        if departure.name == ctx.local_name() {
            if departure.version.incarnation > ctx.version.incarnation {
                self.report_duplicate(ctx, departure.version);
                return None;
            }
            if departure.version >= ctx.version {
                return Some(self.refute(ctx, departure.version));
            }
            return None;
        }

        let entry = self.view.get(&departure.name)?;
        if entry.version > departure.version {
            return None;
        }
        let entry = self.view.remove(&departure.name)?;
        let status = match departure.kind {
            DepartureKind::Leave => HistoryStatus::Leave,
            DepartureKind::Suspect => HistoryStatus::Suspect,
        };
        self.retire(ctx, entry, status, departure.version);
        Some(MembershipChange::Departed(departure.clone()))
    }

    /// Outlive a suspicion of the local node by bumping the minor version.
    fn refute(&mut self, ctx: &mut NodeContext, suspected: NodeVersion) -> MembershipChange {
        let refuted = NodeVersion::new(
            ctx.version.incarnation,
            ctx.version.minor.max(suspected.minor).saturating_add(1),
        );
        warn!(node = %ctx.local, suspected = %suspected, version = %refuted, "refuting suspicion");
        ctx.version = refuted;
        if let Some(entry) = self.view.get_mut(ctx.local_name()) {
            entry.version = refuted;
        }
        MembershipChange::Joined(ctx.local_record())
    }

    fn report_duplicate(&mut self, ctx: &mut NodeContext, remote: NodeVersion) {
        if self.reported_duplicate.is_some_and(|seen| seen >= remote) {
            return;
        }
        self.reported_duplicate = Some(remote);
        warn!(
            node = %ctx.local,
            local = %ctx.version,
            remote = %remote,
            "duplicate node name suspected"
        );
        ctx.publish(SpiderCastEvent::DuplicateNodeSuspected(DuplicateNodeEvent {
            name: ctx.local_name().to_string(),
            local_version: ctx.version,
            remote_version: remote,
        }));
    }

    /// Two processes advertise `name` with the same version.
    fn retire_duplicate(&mut self, ctx: &mut NodeContext, name: &str) {
        let Some(entry) = self.view.remove(name) else {
            return;
        };
        warn!(
            node = %ctx.local,
            peer = name,
            version = %entry.version,
            "conflicting endpoints for one version"
        );
        ctx.publish(SpiderCastEvent::DuplicateNodeSuspected(DuplicateNodeEvent {
            name: name.to_string(),
            local_version: entry.version,
            remote_version: entry.version,
        }));
        let version = entry.version;
        self.retire(ctx, entry, HistoryStatus::SuspectDuplicate, version);
        self.refresh_successor(ctx);
        ctx.push(Effect::ViewChanged);
    }

    fn retire(
        &mut self,
        ctx: &NodeContext,
        entry: ViewEntry,
        status: HistoryStatus,
        version: NodeVersion,
    ) {
        let name = entry.node.name().to_string();
        let table = ctx.config.retain_attributes.then_some(entry.table);
        info!(node = %ctx.local, peer = %name, version = %version, ?status, "node left view");
        self.history.insert(HistoryEntry {
            node: entry.node,
            version,
            table,
            status,
            since: ctx.now(),
        });
        self.churn += 1;
        self.joined_since_notify.remove(&name);
        self.departed_since_notify.insert(name);
    }

    /// Flood applied changes and propagate their consequences.
    fn commit(
        &mut self,
        ctx: &mut NodeContext,
        changes: Vec<MembershipChange>,
        peers: &Peers,
    ) -> bool {
        if changes.is_empty() {
            return false;
        }
        let mut joined = Vec::new();
        let mut departed = Vec::new();
        for change in changes {
            match change {
                MembershipChange::Joined(record) => joined.push(record),
                MembershipChange::Departed(departure) => departed.push(departure),
            }
        }
        for (peer, connection) in peers {
            let body = Message::Membership(MembershipMessage::Update {
                joined: joined.clone(),
                departed: departed.clone(),
            });
            // Best effort.
            let _ = ctx.send(*connection, peer, body);
        }
        self.refresh_successor(ctx);
        ctx.push(Effect::ViewChanged);
        true
    }

    // =========================================================================
    // SUCCESSOR
    // =========================================================================

    /// Recompute the ring successor and report a change.
    pub(crate) fn refresh_successor(&mut self, ctx: &mut NodeContext) {
        let candidate = self
            .view
            .successor_of(ctx.local_name())
            .map(|entry| entry.node.clone());
        let changed = match (&self.successor, &candidate) {
            (Some(current), Some(next)) => current.name() != next.name(),
            (None, None) => false,
            _ => true,
        };
        if changed {
            info!(
                node = %ctx.local,
                successor = candidate.as_ref().map(|n| n.name()).unwrap_or("-"),
                "successor changed"
            );
            self.successor = candidate.clone();
            ctx.push(Effect::SuccessorChanged(candidate));
        }
    }

    // =========================================================================
    // NEIGHBOR HOOKS
    // =========================================================================

    /// Send the full view to a newly routable neighbor.
    pub(crate) fn new_neighbor(&self, ctx: &mut NodeContext, peer: &str, connection: ConnectionId) {
        let body = Message::Membership(MembershipMessage::Update {
            joined: self.view.records(),
            departed: self.departures(),
        });
        if ctx.send(connection, peer, body).is_err() {
            ctx.push(Effect::ResyncFailed(connection));
        }
    }

    /// Forget requests awaiting a peer that is no longer linked.
    pub(crate) fn disconnected_neighbor(&self, ctx: &NodeContext, peer: &str) {
        debug!(node = %ctx.local, peer, "neighbor disconnected");
        for entry in self.view.iter() {
            entry.table.lock().clear_pending_from(peer);
        }
        for entry in self.history.iter() {
            if let Some(table) = &entry.table {
                table.lock().clear_pending_from(peer);
            }
        }
    }

    /// Departures worth telling a new neighbor about.
    pub fn departures(&self) -> Vec<DepartureRecord> {
        self.history
            .iter()
            .filter_map(|entry| {
                let kind = match entry.status {
                    HistoryStatus::Leave => DepartureKind::Leave,
                    HistoryStatus::Suspect => DepartureKind::Suspect,
                    HistoryStatus::Remove | HistoryStatus::SuspectDuplicate => return None,
                };
                Some(DepartureRecord {
                    name: entry.node.name().to_string(),
                    version: entry.version,
                    kind,
                })
            })
            .collect()
    }

    /// Up to `limit` view records; the local record always comes first.
    pub(crate) fn partial_view(&self, ctx: &mut NodeContext, limit: usize) -> Vec<NodeRecord> {
        use rand::seq::IteratorRandom;

        let mut records = vec![ctx.local_record()];
        let local = ctx.local.clone();
        let others = self
            .view
            .iter()
            .filter(|entry| entry.node.name() != local.name())
            .choose_multiple(&mut ctx.rng, limit.saturating_sub(1));
        records.extend(others.into_iter().map(ViewEntry::record));
        records
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Drop history entries older than the retention period.
    pub(crate) fn purge_history(&mut self, ctx: &mut NodeContext) -> usize {
        let expired = self
            .history
            .expired(ctx.now(), ctx.config.history_retention);
        for name in &expired {
            self.history.remove(name);
            ctx.cache.evict(name);
            debug!(node = %ctx.local, peer = %name, "purged history entry");
        }
        expired.len()
    }

    /// Forget the retained attributes of a departed node.
    pub(crate) fn clear_retained(&mut self, name: &str) -> bool {
        match self.history.get_mut(name) {
            Some(entry) => {
                entry.status = HistoryStatus::Remove;
                entry.table = None;
                true
            }
            None => false,
        }
    }

    /// Names joined/refreshed and departed since the last notification.
    pub(crate) fn take_notification_changes(&mut self) -> (BTreeSet<String>, BTreeSet<String>) {
        (
            std::mem::take(&mut self.joined_since_notify),
            std::mem::take(&mut self.departed_since_notify),
        )
    }
}
