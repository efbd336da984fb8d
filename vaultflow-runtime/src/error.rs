use crate::flow::FlowId;
use thiserror::Error;
use vaultflow_core::error::{StorageError, TransactionError, VaultError};
use vaultflow_core::id::{Party, StateRef};

/// Every way a flow can fail
///
/// Each flow reports exactly one of these through its result future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The start request did not match the flow's declared parameters
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// No flow is registered under this name
    #[error("Unknown flow type: {0}")]
    UnknownFlow(String),

    #[error("Double spend of {0}")]
    DoubleSpend(StateRef),

    #[error("Duplicate production of {0}")]
    DuplicateProduction(StateRef),

    /// An awaited message never arrived
    #[error("Timed out waiting for {protocol} message from {peer}")]
    MessageTimeout { peer: Party, protocol: String },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// A peer sent something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A session peer failed and reported it
    #[error("Counterparty {party} failed: {reason}")]
    Counterparty { party: Party, reason: String },

    #[error("Insufficient {asset}: requested {requested}, available {available}")]
    InsufficientFunds {
        asset: String,
        requested: u64,
        available: u64,
    },

    #[error("Flow cancelled")]
    Cancelled,

    /// Cancellation requested after the flow committed to the vault
    #[error("Flow already committed and can no longer be cancelled")]
    AlreadyCommitted,

    #[error("Unknown flow {0}")]
    NoSuchFlow(FlowId),

    /// The node shut down before the flow reached an outcome
    #[error("Node stopped")]
    NodeStopped,
}

impl From<VaultError> for FlowError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::DoubleSpend(state_ref) => FlowError::DoubleSpend(state_ref),
            VaultError::DuplicateProduction(state_ref) => FlowError::DuplicateProduction(state_ref),
            VaultError::StorageFailure(reason) => FlowError::StorageFailure(reason),
        }
    }
}

impl From<StorageError> for FlowError {
    fn from(err: StorageError) -> Self {
        FlowError::StorageFailure(err.to_string())
    }
}

impl From<TransactionError> for FlowError {
    fn from(err: TransactionError) -> Self {
        FlowError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Protocol(format!("malformed payload: {}", err))
    }
}

/// Errors returned synchronously at the RPC boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown flow type: {0}")]
    UnknownFlow(String),

    /// The node is not accepting requests
    #[error("Node unavailable: {0}")]
    Unavailable(String),
}

impl From<FlowError> for RpcError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::InvalidArguments(reason) => RpcError::InvalidArguments(reason),
            FlowError::UnknownFlow(flow_type) => RpcError::UnknownFlow(flow_type),
            other => RpcError::Unavailable(other.to_string()),
        }
    }
}

/// Registration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),
}

/// Errors starting or running a node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Context(#[from] anyhow::Error),
}
