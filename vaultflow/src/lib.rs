//! Ledger node building blocks
//!
//! * [`core`] - identifiers, states, transactions and the settle-once result cell
//! * [`storage`] - the vault, its subscriptions and persistence backends
//! * [`runtime`] - flow engine, built-in flows, node event loop and RPC façade
//! * [`sim`] - deterministic single-threaded simulation

pub use vaultflow_core as core;
pub use vaultflow_runtime as runtime;
pub use vaultflow_sim as sim;
pub use vaultflow_storage as storage;

pub use vaultflow_core::{Party, StateObject, StateRef, TxId, VaultUpdate};
pub use vaultflow_runtime::{FlowError, FlowRegistry, NodeConfig, NodeHandle, RpcError, RpcServer};
pub use vaultflow_sim::{SimulationConfig, SimulationDriver, SimulationState};
pub use vaultflow_storage::Vault;
