//! Ring successor maintenance.

use tracing::{debug, info};

use super::manager::TopologyManager;
use crate::domain::{LinkType, NodeRef};
use crate::service::context::{Effect, NodeContext};
use crate::service::scheduler::TaskKind;

impl TopologyManager {
    /// Membership picked a new successor, or none when the view holds only
    /// the local node.
    pub(crate) fn set_successor(&mut self, ctx: &mut NodeContext, successor: Option<NodeRef>) {
        match successor {
            Some(node) => {
                self.desired_successor = Some(node);
                ctx.schedule_now(TaskKind::ChangeSuccessor);
            }
            None => {
                self.desired_successor = None;
                self.abandon_successor_attempts(ctx, None);
                if let Some(previous) = self.successor.take() {
                    self.link_lost(ctx, &previous.node, LinkType::Successor);
                    self.request_disconnect(
                        ctx,
                        previous.name(),
                        previous.connection,
                        LinkType::Successor,
                    );
                }
                self.enter_discovery(ctx);
            }
        }
    }

    /// `ChangeSuccessor` task: connect to the desired successor.
    pub(crate) fn change_successor(&mut self, ctx: &mut NodeContext) {
        if !self.is_active() {
            return;
        }
        let Some(desired) = self.desired_successor.clone() else {
            return;
        };
        if self
            .successor
            .as_ref()
            .is_some_and(|s| s.name() == desired.name())
        {
            return;
        }
        self.abandon_successor_attempts(ctx, Some(desired.name()));
        debug!(node = %ctx.local, successor = %desired, "connecting to successor");
        self.begin_attempt(ctx, desired, LinkType::Successor, false);
    }

    /// Drop successor attempts to anyone but `keep`.
    fn abandon_successor_attempts(&mut self, ctx: &NodeContext, keep: Option<&str>) {
        let stale: Vec<_> = self
            .attempts
            .keys()
            .filter(|(name, link)| *link == LinkType::Successor && Some(name.as_str()) != keep)
            .cloned()
            .collect();
        for key in stale {
            if let Some(attempt) = self.attempts.remove(&key) {
                self.release_connection(ctx, attempt.connection);
            }
        }
    }

    /// A successor attempt failed; report the candidate once the failure
    /// budget is spent and retry either way.
    pub(super) fn successor_attempt_failed(&mut self, ctx: &mut NodeContext, peer: &NodeRef) {
        let failures = self
            .successor_failures
            .entry(peer.name().to_string())
            .or_insert(0);
        *failures += 1;
        if *failures >= ctx.config.successor_max_failures {
            self.successor_failures.remove(peer.name());
            info!(node = %ctx.local, successor = %peer, "successor unreachable");
            ctx.push(Effect::ReportSuspect(peer.clone()));
        }
        let retry = ctx.config.connect_retry_delay;
        ctx.schedule_in(TaskKind::ChangeSuccessor, retry);
    }
}
