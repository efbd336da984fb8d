use crate::id::{StateRef, TxId};
use std::io;
use thiserror::Error;

/// Represents all possible errors that can occur when persisting vault data
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO errors that occur when reading/writing files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors related to missing or invalid data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Errors that occur during vault log operations
    #[error("Vault log error: {0}")]
    Log(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        StorageError::Other(err)
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        StorageError::Other(err.to_string())
    }
}

/// Consistency violations and persistence failures raised by `Vault::apply`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// A consumed identity is not currently unspent
    #[error("Double spend of {0}")]
    DoubleSpend(StateRef),

    /// A produced identity already exists in the vault's history
    #[error("Duplicate production of {0}")]
    DuplicateProduction(StateRef),

    /// The persistence collaborator failed; the vault was not mutated
    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        VaultError::StorageFailure(err.to_string())
    }
}

/// Errors raised while assembling or verifying a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction has neither inputs nor outputs")]
    Empty,

    #[error("Transaction consumes the same state twice")]
    DuplicateInput,

    #[error("Transaction {0} does not match its content")]
    IdMismatch(TxId),

    #[error("Inputs and outputs of asset {0} do not balance")]
    Unbalanced(String),
}
