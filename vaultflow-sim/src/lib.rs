//! Deterministic simulation of a network of vaultflow nodes
//!
//! A single thread drives every node. Each call to
//! [`SimulationDriver::iterate`] delivers at most one message and runs at
//! most one flow step, so a run is fully reproducible.

pub mod driver;
pub mod network;

pub use driver::{SimulationConfig, SimulationDriver, SimulationError, SimulationFuture, SimulationState};
pub use network::SimulatedNetwork;
