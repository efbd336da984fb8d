use crate::error::NodeError;
use crate::messages::FlowMessage;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use vaultflow_core::id::Party;

/// Delivers messages between nodes
///
/// Implementations must preserve FIFO order per sender and receiver.
pub trait MessageTransport: Send + Sync {
    fn send(&self, message: FlowMessage) -> Result<(), NodeError>;
}

/// Transport connecting nodes in the same process
#[derive(Default)]
pub struct InProcessNetwork {
    routes: Mutex<HashMap<Party, mpsc::UnboundedSender<FlowMessage>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, replacing any earlier route for it
    ///
    /// # Returns
    /// The receiving end of the node's inbound queue
    pub fn register(&self, party: Party) -> mpsc::UnboundedReceiver<FlowMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(party, sender);
        receiver
    }

    pub fn unregister(&self, party: &Party) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(party);
    }
}

impl MessageTransport for InProcessNetwork {
    fn send(&self, message: FlowMessage) -> Result<(), NodeError> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let route = routes
            .get(&message.recipient)
            .ok_or_else(|| NodeError::Transport(format!("no route to {}", message.recipient)))?;
        route
            .send(message)
            .map_err(|e| NodeError::Transport(format!("{} is gone", e.0.recipient)))
    }
}
