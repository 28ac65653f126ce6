//! # Runtime Scenarios
//!
//! Nodes on their own tokio tasks, on the system clock, exchanging traffic
//! over a shared in-memory fabric.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use spidercast::testing::{RecordingSink, SimFabric, SimTransport};
    use spidercast::{
        spawn_node, NoOpRoutingListener, NodeHandle, NodeId, NodeInput, NodePorts, SpiderCast,
        SpiderCastApi, SpiderCastConfig, SystemTimeSource,
    };
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::task::JoinHandle;

    use crate::support::{endpoint, init_logging};

    struct Running {
        handle: NodeHandle,
        events: Arc<RecordingSink>,
    }

    fn launch(fabric: &Arc<SimFabric>, name: &str, port: u16, bootstrap: Option<u16>) -> Running {
        let events = Arc::new(RecordingSink::new());
        let ports = NodePorts {
            transport: Arc::new(SimTransport::new(fabric.clone(), name, endpoint(port))),
            clock: Box::new(SystemTimeSource::new()),
            events: events.clone(),
            routing: Arc::new(NoOpRoutingListener),
        };
        let config = SpiderCastConfig {
            bootstrap: bootstrap.into_iter().map(endpoint).collect(),
            ..SpiderCastConfig::for_testing()
        };
        let node = SpiderCast::new(NodeId::new(name, vec![endpoint(port)]), 1, config, ports)
            .expect("test config is valid");
        Running {
            handle: spawn_node(node),
            events,
        }
    }

    /// Forward fabric traffic to the node tasks until aborted.
    fn pump(
        fabric: Arc<SimFabric>,
        inputs: HashMap<String, UnboundedSender<NodeInput>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                while let Some((dest, event)) = fabric.pop() {
                    if let Some(input) = inputs.get(&dest) {
                        let _ = input.send(NodeInput::Transport(event));
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    fn sees(events: &RecordingSink, peer: &str) -> bool {
        events
            .notifications()
            .iter()
            .any(|n| n.nodes.iter().any(|snapshot| snapshot.name == peer))
    }

    #[tokio::test]
    async fn test_spawned_nodes_join_and_share_attributes() {
        init_logging();
        let fabric = Arc::new(SimFabric::new());
        let a = launch(&fabric, "alpha", 7301, None);
        let b = launch(&fabric, "beta", 7302, Some(7301));
        let inputs = HashMap::from([
            ("alpha".to_string(), a.handle.sender()),
            ("beta".to_string(), b.handle.sender()),
        ]);
        let pump = pump(fabric.clone(), inputs);

        b.handle.attributes().set("zone", b"eu-1".to_vec()).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let attribute = a.events.notifications().iter().any(|n| {
                    n.nodes.iter().any(|snapshot| {
                        let zone = snapshot.attributes.get("zone").map(Vec::as_slice);
                        snapshot.name == "beta" && zone == Some(&b"eu-1"[..])
                    })
                });
                if sees(&b.events, "alpha") && attribute {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(joined.is_ok(), "nodes did not find each other in time");

        // Stop traffic first so neither node hears the other leave.
        pump.abort();
        a.handle.close(true);
        b.handle.close(true);
        let alpha = a.handle.join().await.expect("alpha task");
        let beta = b.handle.join().await.expect("beta task");

        assert!(alpha.view_names().contains(&"beta".to_string()));
        assert!(beta.view_names().contains(&"alpha".to_string()));
        assert!(alpha.attributes().is_closed());
    }
}
