//! # Membership Scenarios
//!
//! - The ring closes over every node.
//! - A graceful leave reaches every view as a leave, ahead of any timeout.
//! - A crash is suspected by the neighbors and the ring repairs around it.
//! - A restarted node is readmitted under its new incarnation.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spidercast::testing::SimNetwork;
    use spidercast::{HistoryStatus, NodeState, SpiderCastApi, SpiderCastConfig};

    use crate::support::{cluster, converge, ring_complete};

    fn history_status(net: &SimNetwork, holder: &str, departed: &str) -> Option<HistoryStatus> {
        net.node(holder)
            .membership()
            .history()
            .get(departed)
            .map(|entry| entry.status)
    }

    fn views_without(departed: &'static str) -> impl FnMut(&SimNetwork) -> bool {
        move |net| {
            net.nodes()
                .all(|sim| !sim.node.view_names().iter().any(|n| n == departed))
        }
    }

    // =========================================================================
    // TEST GROUP 1: Formation
    // =========================================================================

    #[test]
    fn test_ring_forms_over_all_nodes() {
        let mut net = cluster(6);
        converge(&mut net, Duration::from_secs(5));

        assert!(net.run_until(Duration::from_secs(3), ring_complete));
        assert!(net
            .nodes()
            .all(|sim| matches!(sim.node.state(), NodeState::Discovery | NodeState::Normal)));
    }

    #[test]
    fn test_late_joiner_is_admitted_everywhere() {
        let mut net = cluster(4);
        converge(&mut net, Duration::from_secs(5));

        net.add_node("n9");
        net.start("n9");

        converge(&mut net, Duration::from_secs(5));
        assert_eq!(net.node("n9").view_names().len(), 5);
    }

    // =========================================================================
    // TEST GROUP 2: Departures
    // =========================================================================

    #[test]
    fn test_graceful_leave_recorded_as_leave() {
        let mut net = cluster(5);
        converge(&mut net, Duration::from_secs(5));

        net.close("n2", true);

        // Well under any failure detection window.
        assert!(net.run_until(Duration::from_secs(1), |net| {
            net.views_converged()
                && net
                    .names()
                    .iter()
                    .all(|name| history_status(net, name, "n2") == Some(HistoryStatus::Leave))
        }));
    }

    #[test]
    fn test_crashed_node_suspected_and_ring_repaired() {
        let mut net = cluster(5);
        converge(&mut net, Duration::from_secs(5));
        assert!(net.run_until(Duration::from_secs(3), ring_complete));

        net.kill("n3");

        assert!(net.run_until(Duration::from_secs(5), |net| {
            net.views_converged() && ring_complete(net)
        }));
        assert!(net
            .names()
            .iter()
            .all(|name| history_status(&net, name, "n3") == Some(HistoryStatus::Suspect)));
        assert_eq!(
            net.node("n2").topology().successor().map(|s| s.name().to_string()),
            Some("n4".to_string())
        );
    }

    #[test]
    fn test_successor_loss_reenters_discovery() {
        let mut net = cluster(4);
        converge(&mut net, Duration::from_secs(5));
        net.run_for(Duration::from_secs(1));
        assert_eq!(net.node("n1").state(), NodeState::Normal);
        assert_eq!(
            net.node("n1").topology().successor().map(|s| s.name().to_string()),
            Some("n2".to_string())
        );

        net.kill("n2");

        assert!(net.run_until(Duration::from_secs(1), |net| {
            net.node("n1").state() == NodeState::Discovery
        }));
    }

    #[test]
    fn test_departures_visible_in_notifications() {
        let mut net = cluster(3);
        converge(&mut net, Duration::from_secs(5));
        net.sim("n0").events.take();

        net.close("n1", true);
        assert!(net.run_until(Duration::from_secs(2), |net| {
            net.sim("n0")
                .events
                .notifications()
                .iter()
                .any(|n| n.departed.iter().any(|d| d == "n1"))
        }));
    }

    // =========================================================================
    // TEST GROUP 3: Rejoin
    // =========================================================================

    #[test]
    fn test_restarted_node_rejoins_with_new_incarnation() {
        let mut net = cluster(4);
        converge(&mut net, Duration::from_secs(5));

        net.kill("n1");
        assert!(net.run_until(Duration::from_secs(5), views_without("n1")));

        let config = SpiderCastConfig {
            bootstrap: vec![net.sim("n0").endpoint],
            ..SpiderCastConfig::for_testing()
        };
        net.add_node_with("n1", 5, config);
        net.start("n1");

        converge(&mut net, Duration::from_secs(5));
        assert!(net.nodes().all(|sim| {
            sim.node
                .membership()
                .view()
                .get("n1")
                .is_some_and(|entry| entry.version.incarnation == 5)
        }));
        assert!(net
            .nodes()
            .all(|sim| !sim.node.membership().history().contains("n1")));
    }
}
