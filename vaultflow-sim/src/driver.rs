use crate::network::SimulatedNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use vaultflow_core::error::VaultError;
use vaultflow_core::id::Party;
use vaultflow_core::result_cell::ResultCell;
use vaultflow_runtime::engine::FlowEngine;
use vaultflow_runtime::error::FlowError;
use vaultflow_runtime::flow::FlowHandle;
use vaultflow_runtime::messages::FlowMessage;
use vaultflow_runtime::network_map::NetworkMap;
use vaultflow_runtime::notary::UniquenessProvider;
use vaultflow_runtime::registry::FlowRegistry;
use vaultflow_storage::store::MemoryVaultStore;
use vaultflow_storage::vault::{Vault, DEFAULT_SUBSCRIBER_BUFFER};

/// Outcome of a whole simulation: every root's payload, or the cause of failure
pub type SimulationFuture = ResultCell<Vec<Value>, FlowError>;

/// Lifecycle of a simulation
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationState {
    Idle,
    Running,
    /// Every root flow succeeded; payloads in scheduling order
    Completed(Vec<Value>),
    Failed(FlowError),
}

impl SimulationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SimulationState::Completed(_) | SimulationState::Failed(_))
    }
}

/// Errors from driving a simulation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Simulation is no longer idle")]
    NotIdle,

    #[error("Simulation has not been started")]
    NotStarted,

    #[error("Unknown node: {0}")]
    UnknownNode(Party),

    #[error("Node already exists: {0}")]
    DuplicateNode(Party),

    #[error("Simulation did not finish within {0} steps")]
    StepLimitExceeded(u64),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Simulation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Fail the simulation as soon as any root flow fails
    pub abort_on_first_failure: bool,

    /// Upper bound on iterations for `run_to_completion`
    pub max_steps: u64,

    /// Capacity of each vault subscriber's buffer
    pub subscriber_buffer: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            abort_on_first_failure: false,
            max_steps: 100_000,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

struct Root {
    node: Party,
    flow_type: String,
    args: Vec<Value>,
    handle: Option<FlowHandle>,
}

/// Drives a set of nodes over a simulated network on the calling thread
///
/// Nodes and root flows are added while `Idle`. `start` launches the roots;
/// from then on every call to `iterate` performs one unit of work:
///
/// 1. run one step of a runnable flow, visiting nodes round-robin;
/// 2. otherwise deliver one in-flight message and run the step it unblocked;
/// 3. otherwise fail every suspended flow with `MessageTimeout`, since no
///    message can arrive any more.
pub struct SimulationDriver {
    config: SimulationConfig,
    registry: Arc<FlowRegistry>,
    network_map: NetworkMap,
    network: SimulatedNetwork,
    nodes: BTreeMap<Party, FlowEngine>,
    roots: Vec<Root>,
    state: SimulationState,
    outcome: SimulationFuture,
    next_node: usize,
    steps: u64,
}

impl SimulationDriver {
    /// A driver running the built-in flows
    pub fn new(config: SimulationConfig) -> Self {
        Self::with_registry(config, Arc::new(FlowRegistry::with_builtin_flows()))
    }

    pub fn with_registry(config: SimulationConfig, registry: Arc<FlowRegistry>) -> Self {
        Self {
            config,
            registry,
            network_map: NetworkMap::new(),
            network: SimulatedNetwork::new(),
            nodes: BTreeMap::new(),
            roots: Vec::new(),
            state: SimulationState::Idle,
            outcome: SimulationFuture::new(),
            next_node: 0,
            steps: 0,
        }
    }

    pub fn add_node(&mut self, party: impl Into<Party>) -> Result<(), SimulationError> {
        self.insert_node(party.into(), false)
    }

    /// Add a node running a notary service
    pub fn add_notary(&mut self, party: impl Into<Party>) -> Result<(), SimulationError> {
        self.insert_node(party.into(), true)
    }

    fn insert_node(&mut self, party: Party, notary: bool) -> Result<(), SimulationError> {
        self.require_idle()?;
        if self.nodes.contains_key(&party) {
            return Err(SimulationError::DuplicateNode(party));
        }

        let vault = Vault::open(
            party.clone(),
            Arc::new(MemoryVaultStore::new()),
            self.config.subscriber_buffer,
        )?;
        let mut engine = FlowEngine::new(
            party.clone(),
            Arc::new(vault),
            Arc::clone(&self.registry),
            self.network_map.clone(),
        );
        if notary {
            engine = engine.with_notary_service(Arc::new(UniquenessProvider::new()));
        }

        self.network_map.register(party.clone(), notary);
        log::debug!("Simulation added node {} (notary: {})", party, notary);
        self.nodes.insert(party, engine);
        Ok(())
    }

    /// Schedule a root flow to start on `node` when the simulation starts
    pub fn schedule(
        &mut self,
        node: impl Into<Party>,
        flow_type: &str,
        args: Vec<Value>,
    ) -> Result<(), SimulationError> {
        self.require_idle()?;
        let node = node.into();
        if !self.nodes.contains_key(&node) {
            return Err(SimulationError::UnknownNode(node));
        }
        self.roots.push(Root {
            node,
            flow_type: flow_type.to_string(),
            args,
            handle: None,
        });
        Ok(())
    }

    /// Start every scheduled root flow
    ///
    /// # Returns
    /// The simulation's outcome future, or the first invalid root's error with
    /// nothing started and the driver still idle
    pub fn start(&mut self) -> Result<SimulationFuture, SimulationError> {
        self.require_idle()?;

        for root in &self.roots {
            let engine = self
                .nodes
                .get(&root.node)
                .ok_or_else(|| SimulationError::UnknownNode(root.node.clone()))?;
            engine.check_start(&root.flow_type, &root.args)?;
        }

        for root in &mut self.roots {
            let engine = self
                .nodes
                .get_mut(&root.node)
                .ok_or_else(|| SimulationError::UnknownNode(root.node.clone()))?;
            root.handle = Some(engine.start_flow(&root.flow_type, root.args.clone())?);
        }

        log::info!(
            "Simulation running {} nodes, {} root flows",
            self.nodes.len(),
            self.roots.len()
        );
        self.state = SimulationState::Running;
        self.check_roots();
        Ok(self.outcome.clone())
    }

    /// Advance the simulation by one unit of work
    ///
    /// # Returns
    /// false once the simulation is not running
    pub fn iterate(&mut self) -> bool {
        if self.state != SimulationState::Running {
            return false;
        }
        self.steps += 1;

        if !self.run_one_step() {
            match self.network.pop_next() {
                Some(message) => self.deliver(message),
                None => self.fail_stalled(),
            }
        }

        self.collect_outboxes();
        self.check_roots();
        self.state == SimulationState::Running
    }

    /// Iterate until the simulation reaches a terminal state
    ///
    /// # Returns
    /// The terminal state, or StepLimitExceeded after `max_steps` iterations
    pub fn run_to_completion(&mut self) -> Result<SimulationState, SimulationError> {
        if self.state == SimulationState::Idle {
            return Err(SimulationError::NotStarted);
        }

        let mut iterations = 0;
        while self.state == SimulationState::Running {
            if iterations >= self.config.max_steps {
                return Err(SimulationError::StepLimitExceeded(self.config.max_steps));
            }
            self.iterate();
            iterations += 1;
        }
        Ok(self.state.clone())
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    /// Iterations performed since start
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn engine(&self, party: &Party) -> Option<&FlowEngine> {
        self.nodes.get(party)
    }

    pub fn vault(&self, party: &Party) -> Option<Arc<Vault>> {
        self.nodes.get(party).map(FlowEngine::vault)
    }

    /// Handles of the root flows, in scheduling order
    pub fn root_handles(&self) -> Vec<FlowHandle> {
        self.roots.iter().filter_map(|root| root.handle.clone()).collect()
    }

    fn require_idle(&self) -> Result<(), SimulationError> {
        if self.state == SimulationState::Idle {
            Ok(())
        } else {
            Err(SimulationError::NotIdle)
        }
    }

    fn run_one_step(&mut self) -> bool {
        let count = self.nodes.len();
        for offset in 0..count {
            let index = (self.next_node + offset) % count;
            let Some(engine) = self.nodes.values_mut().nth(index) else {
                continue;
            };
            if engine.run_next().is_some() {
                self.next_node = (index + 1) % count;
                return true;
            }
        }
        false
    }

    fn deliver(&mut self, message: FlowMessage) {
        let Some(engine) = self.nodes.get_mut(&message.recipient) else {
            log::warn!("Simulation dropping message for unknown node {}", message.recipient);
            return;
        };
        log::debug!(
            "Delivering {} message {} -> {}",
            message.protocol,
            message.sender,
            message.recipient
        );
        engine.deliver(message);
        engine.run_next();
    }

    fn fail_stalled(&mut self) {
        let stalled: usize = self
            .nodes
            .values_mut()
            .map(|engine| engine.fail_stalled().len())
            .sum();
        if stalled > 0 {
            log::warn!("Network is quiescent, timed out {} suspended flows", stalled);
        }
    }

    fn collect_outboxes(&mut self) {
        for engine in self.nodes.values_mut() {
            for message in engine.drain_outbox() {
                self.network.push(message);
            }
        }
    }

    fn check_roots(&mut self) {
        if self.state != SimulationState::Running {
            return;
        }

        let outcomes: Vec<Option<Result<Value, FlowError>>> = self
            .roots
            .iter()
            .map(|root| root.handle.as_ref().and_then(|h| h.result.try_get()))
            .collect();
        let first_failure = outcomes.iter().find_map(|outcome| match outcome {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        });
        let all_done = outcomes.iter().all(Option::is_some);

        let next = match first_failure {
            Some(err) if self.config.abort_on_first_failure || all_done => {
                SimulationState::Failed(err)
            }
            None if all_done => SimulationState::Completed(
                outcomes.into_iter().flatten().filter_map(Result::ok).collect(),
            ),
            _ => {
                if self.nodes.values().all(|e| e.live_flows() == 0) && self.network.is_quiescent() {
                    // Nothing left that could settle the remaining roots
                    SimulationState::Failed(FlowError::Protocol(
                        "simulation stalled with unsettled root flows".to_string(),
                    ))
                } else {
                    return;
                }
            }
        };

        let settled = match &next {
            SimulationState::Completed(payloads) => {
                log::info!("Simulation completed after {} steps", self.steps);
                self.outcome.settle(Ok(payloads.clone()))
            }
            SimulationState::Failed(err) => {
                log::warn!("Simulation failed after {} steps: {}", self.steps, err);
                self.outcome.settle(Err(err.clone()))
            }
            _ => Ok(()),
        };
        if settled.is_err() {
            log::error!("Simulation outcome was settled twice");
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bank_and_corp(config: SimulationConfig) -> SimulationDriver {
        let mut driver = SimulationDriver::new(config);
        driver.add_notary("Bank").unwrap();
        driver.add_node("Corp").unwrap();
        driver
    }

    fn quantities(driver: &SimulationDriver, party: &str) -> Vec<u64> {
        driver
            .vault(&Party::new(party))
            .unwrap()
            .current_states()
            .iter()
            .map(|s| s.quantity)
            .collect()
    }

    #[test]
    fn test_issuance_completes() {
        let mut driver = bank_and_corp(SimulationConfig::default());
        driver
            .schedule(
                "Corp",
                "IssuanceRequester",
                vec![json!(1000), json!("USD"), json!("Corp"), json!("1"), json!("Bank")],
            )
            .unwrap();

        let outcome = driver.start().unwrap();
        assert_eq!(driver.state(), &SimulationState::Running);
        assert!(!outcome.is_done());

        while driver.iterate() {}

        let payloads = outcome.try_get().unwrap().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["result"], "Success");
        assert_eq!(driver.state(), &SimulationState::Completed(payloads));
        assert_eq!(quantities(&driver, "Corp"), vec![1000]);
        assert!(quantities(&driver, "Bank").is_empty());
        assert!(!driver.iterate());
    }

    #[test]
    fn test_setup_only_while_idle() {
        let mut driver = bank_and_corp(SimulationConfig::default());
        assert_eq!(
            driver.add_node("Bank"),
            Err(SimulationError::DuplicateNode(Party::new("Bank")))
        );
        assert_eq!(
            driver.schedule("Nobody", "CashIssue", vec![]),
            Err(SimulationError::UnknownNode(Party::new("Nobody")))
        );
        assert_eq!(driver.run_to_completion(), Err(SimulationError::NotStarted));

        driver.start().unwrap();
        assert_eq!(driver.add_node("Late"), Err(SimulationError::NotIdle));
        assert_eq!(
            driver.schedule("Corp", "CashIssue", vec![]),
            Err(SimulationError::NotIdle)
        );
        assert!(matches!(driver.start(), Err(SimulationError::NotIdle)));
    }

    #[test]
    fn test_invalid_root_fails_start() {
        let mut driver = bank_and_corp(SimulationConfig::default());
        driver
            .schedule("Bank", "CashIssue", vec![json!(5), json!("USD"), json!("Bank")])
            .unwrap();
        driver
            .schedule("Corp", "CashIssue", vec![json!(0), json!("USD"), json!("Bank")])
            .unwrap();

        assert!(matches!(
            driver.start(),
            Err(SimulationError::Flow(FlowError::InvalidArguments(_)))
        ));
        assert_eq!(driver.state(), &SimulationState::Idle);
        assert_eq!(driver.engine(&Party::new("Bank")).unwrap().live_flows(), 0);
    }

    #[test]
    fn test_no_roots_completes_immediately() {
        let mut driver = bank_and_corp(SimulationConfig::default());
        let outcome = driver.start().unwrap();
        assert_eq!(driver.state(), &SimulationState::Completed(vec![]));
        assert_eq!(outcome.try_get(), Some(Ok(vec![])));
    }

    #[test]
    fn test_failure_waits_for_all_roots_by_default() {
        let mut driver = bank_and_corp(SimulationConfig::default());
        driver
            .schedule(
                "Corp",
                "CashPayment",
                vec![json!(5), json!("USD"), json!("Bank"), json!("Bank")],
            )
            .unwrap();
        driver
            .schedule("Bank", "CashIssue", vec![json!(5), json!("USD"), json!("Bank")])
            .unwrap();

        let outcome = driver.start().unwrap();
        assert_eq!(
            driver.run_to_completion(),
            Ok(SimulationState::Failed(FlowError::InsufficientFunds {
                asset: "USD".to_string(),
                requested: 5,
                available: 0,
            }))
        );
        assert!(outcome.try_get().unwrap().is_err());
        assert_eq!(quantities(&driver, "Bank"), vec![5]);
    }

    #[test]
    fn test_step_limit() {
        let mut driver = bank_and_corp(SimulationConfig {
            max_steps: 1,
            ..SimulationConfig::default()
        });
        driver
            .schedule(
                "Corp",
                "IssuanceRequester",
                vec![json!(10), json!("USD"), json!("Corp"), json!("1"), json!("Bank")],
            )
            .unwrap();
        driver.start().unwrap();

        assert_eq!(
            driver.run_to_completion(),
            Err(SimulationError::StepLimitExceeded(1))
        );
        assert_eq!(driver.state(), &SimulationState::Running);
    }
}
