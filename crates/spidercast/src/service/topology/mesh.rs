//! Random and structured degree maintenance.

use rand::seq::IteratorRandom;
use tracing::{debug, trace};

use super::manager::TopologyManager;
use crate::domain::messages::{Message, TopologyMessage};
use crate::domain::{LinkType, NodeRef};
use crate::service::context::NodeContext;
use crate::service::membership::MembershipService;
use crate::service::scheduler::TaskKind;

impl TopologyManager {
    /// View members eligible for a new link of type `link`.
    fn candidates(
        &self,
        ctx: &NodeContext,
        membership: &MembershipService,
        link: LinkType,
    ) -> Vec<NodeRef> {
        membership
            .view()
            .iter()
            .filter(|entry| entry.node.name() != ctx.local_name())
            .filter(|entry| {
                let name = entry.node.name();
                let linked = match link {
                    LinkType::Random => self.random.contains(name),
                    LinkType::Structured => self.structured_out.contains(name),
                    LinkType::Successor => false,
                };
                !linked && !self.attempts.contains_key(&(name.to_string(), link))
            })
            .map(|entry| entry.node.clone())
            .collect()
    }

    // =========================================================================
    // RANDOM
    // =========================================================================

    /// `RandomConnect` task: request links until the degree, counting
    /// attempts in flight, reaches D.
    pub(crate) fn random_connect(&mut self, ctx: &mut NodeContext, membership: &MembershipService) {
        if !self.is_active() {
            return;
        }
        let target = ctx.config.random_degree;
        let needed = target.saturating_sub(self.random.len() + self.attempts_of(LinkType::Random));
        if needed == 0 {
            return;
        }

        let mut candidates = self.candidates(ctx, membership, LinkType::Random);
        let mut chosen = Vec::with_capacity(needed);
        if let Some(redirect) = self.redirect.take() {
            if let Some(pos) = candidates.iter().position(|c| c.name() == redirect) {
                chosen.push(candidates.swap_remove(pos));
            }
        }
        let remaining = needed - chosen.len();
        chosen.extend(candidates.into_iter().choose_multiple(&mut ctx.rng, remaining));

        let urgent = self.random_rejections >= ctx.config.random_max_rejections;
        trace!(node = %ctx.local, needed, chosen = chosen.len(), urgent, "random connect");
        for peer in chosen {
            self.begin_attempt(ctx, peer, LinkType::Random, urgent);
        }
        if self.random.len() < target {
            let check = ctx.config.degree_check_interval;
            ctx.schedule_in(TaskKind::RandomConnect, check);
        }
    }

    /// `RandomDisconnect` task: shed one link while the degree exceeds D+M.
    pub(crate) fn random_disconnect(&mut self, ctx: &mut NodeContext) {
        if !self.is_active() || self.random.len() <= ctx.config.random_upper_bound() {
            return;
        }
        let skip: Vec<String> = self
            .pending_disconnects
            .keys()
            .filter(|(_, link)| *link == LinkType::Random)
            .map(|(name, _)| name.clone())
            .collect();
        let outstanding = self.random.len().saturating_sub(skip.len());
        if outstanding > ctx.config.random_upper_bound() {
            let candidate = self
                .random
                .disconnect_candidate(ctx.local_name(), &skip)
                .map(|n| (n.name().to_string(), n.connection));
            if let Some((peer, connection)) = candidate {
                debug!(
                    node = %ctx.local,
                    %peer,
                    degree = self.random.len(),
                    "shedding random link"
                );
                self.request_disconnect(ctx, &peer, connection, LinkType::Random);
            }
        }
        let delay = self.disconnect_backoff(ctx);
        ctx.schedule_in(TaskKind::RandomDisconnect, delay);
    }

    /// `DegreeUpdate` task: advertise the vacancy after the degree moved.
    pub(crate) fn degree_update(&mut self, ctx: &mut NodeContext) {
        let degree = self.random.len();
        if self.announced_degree == Some(degree) {
            return;
        }
        self.announced_degree = Some(degree);
        let vacancy = self.random_vacancy(ctx.config.random_degree);
        for neighbor in self.random.iter().filter(|n| n.routable) {
            let body = Message::Topology(TopologyMessage::DegreeChanged { vacancy });
            let _ = ctx.send(neighbor.connection, neighbor.name(), body);
        }
    }

    // =========================================================================
    // STRUCTURED
    // =========================================================================

    /// `StructuredConnect` task: fill outgoing structured links up to target.
    pub(crate) fn structured_connect(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
    ) {
        if !self.is_active() || !ctx.config.structured_enabled() {
            return;
        }
        let target = ctx.config.structured_degree;
        let held = self.structured_out.len() + self.attempts_of(LinkType::Structured);
        let needed = target.saturating_sub(held);
        if needed == 0 {
            return;
        }
        let chosen = self
            .candidates(ctx, membership, LinkType::Structured)
            .into_iter()
            .choose_multiple(&mut ctx.rng, needed);
        for peer in chosen {
            self.begin_attempt(ctx, peer, LinkType::Structured, false);
        }
        if self.structured_out.len() < target {
            let check = ctx.config.degree_check_interval;
            ctx.schedule_in(TaskKind::StructuredConnect, check);
        }
    }

    /// `StructuredRefresh` task: once enough of the view has churned, replace
    /// one outgoing structured link.
    pub(crate) fn structured_refresh(
        &mut self,
        ctx: &mut NodeContext,
        membership: &MembershipService,
    ) {
        if !self.is_active() || !ctx.config.structured_enabled() {
            return;
        }
        let interval = ctx.config.structured_refresh_interval;
        ctx.schedule_in(TaskKind::StructuredRefresh, interval);

        let churn = membership.churn() - self.structured_churn_mark;
        let threshold = (ctx.config.structured_refresh_ratio * membership.view().len() as f64)
            .ceil()
            .max(1.0) as u64;
        if churn < threshold || self.structured_out.is_empty() {
            return;
        }
        self.structured_churn_mark = membership.churn();

        let victim = self
            .structured_out
            .table()
            .iter()
            .choose(&mut ctx.rng)
            .map(|n| n.name().to_string());
        let Some(victim) = victim else {
            return;
        };
        if let Some(neighbor) = self.structured_out.remove(&victim) {
            debug!(node = %ctx.local, peer = %victim, churn, "refreshing structured link");
            self.link_lost(ctx, &neighbor.node, LinkType::Structured);
            self.request_disconnect(ctx, &victim, neighbor.connection, LinkType::Structured);
        }
        ctx.schedule_now(TaskKind::StructuredConnect);
    }
}
