use crate::flow::FlowId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vaultflow_core::id::Party;

/// Payload of a session message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// First message on a session; creates the responder on the receiving node
    Initiate(Value),
    /// Any later message
    Data(Value),
    /// Last message on the session; the sending flow has finished
    Final(Value),
    /// The sending flow finished without a last message for this session
    End,
    /// The sending flow failed
    Error(String),
}

/// A message between two flows on (possibly) different nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMessage {
    pub sender: Party,
    pub recipient: Party,
    pub sender_flow: FlowId,
    /// Set once the sender has heard from the receiving flow
    pub recipient_flow: Option<FlowId>,
    pub protocol: String,
    pub body: MessageBody,
}

impl FlowMessage {
    pub fn is_error(&self) -> bool {
        matches!(self.body, MessageBody::Error(_))
    }

    /// Whether the sender is done with this session
    pub fn closes_session(&self) -> bool {
        matches!(self.body, MessageBody::Final(_) | MessageBody::End)
    }
}
