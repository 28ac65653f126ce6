//! # Tokio Driver
//!
//! Runs a node on its own task. Transport events and close requests reach
//! it through an unbounded channel; between inputs the task sleeps until the
//! next task deadline.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ports::{SpiderCastApi, TransportError, TransportEvent};
use crate::service::{AttributeHandle, SpiderCast};

/// Longest sleep between polls when no task is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Input accepted by a running node.
#[derive(Debug)]
pub enum NodeInput {
    Transport(TransportEvent),
    Close { soft: bool },
}

/// Handle on a node running on a tokio task.
pub struct NodeHandle {
    input: mpsc::UnboundedSender<NodeInput>,
    attributes: AttributeHandle,
    task: JoinHandle<SpiderCast>,
}

impl NodeHandle {
    /// Forward a transport event to the node.
    pub fn send_event(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.input
            .send(NodeInput::Transport(event))
            .map_err(|_| TransportError::Closed)
    }

    /// Sender for transport tasks.
    pub fn sender(&self) -> mpsc::UnboundedSender<NodeInput> {
        self.input.clone()
    }

    pub fn attributes(&self) -> &AttributeHandle {
        &self.attributes
    }

    /// Ask the node to close. A soft close announces the departure.
    pub fn close(&self, soft: bool) {
        let _ = self.input.send(NodeInput::Close { soft });
    }

    /// Wait for the node task to finish and take the node back.
    pub async fn join(self) -> Option<SpiderCast> {
        self.task.await.ok()
    }
}

/// Start `node` and drive it on a new tokio task.
pub fn spawn_node(mut node: SpiderCast) -> NodeHandle {
    let (input, mut rx) = mpsc::unbounded_channel();
    let attributes = node.attributes();
    let task = tokio::spawn(async move {
        node.start();
        info!(node = %node.local_node(), "node task running");
        loop {
            let wait = match node.poll() {
                Some(deadline) => deadline.since(node.now()).min(IDLE_POLL),
                None if node.attributes().is_closed() => break,
                None => IDLE_POLL,
            };
            tokio::select! {
                input = rx.recv() => match input {
                    Some(NodeInput::Transport(event)) => node.handle_event(event),
                    Some(NodeInput::Close { soft }) => {
                        node.close(soft);
                        break;
                    }
                    None => {
                        debug!(node = %node.local_node(), "input channel closed");
                        node.close(false);
                        break;
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(node = %node.local_node(), "node task stopped");
        node
    });
    NodeHandle {
        input,
        attributes,
        task,
    }
}
