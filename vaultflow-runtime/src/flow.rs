use crate::error::FlowError;
use crate::network_map::NetworkMap;
use crate::notary::UniquenessProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use vaultflow_core::id::{Party, TxId};
use vaultflow_core::result_cell::ResultCell;
use vaultflow_core::transaction::LedgerTransaction;
use vaultflow_core::update::VaultUpdate;
use vaultflow_storage::transactions::TransactionStorage;
use vaultflow_storage::vault::Vault;

/// Identifies a flow instance within its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// Outcome of a flow: its payload on success, its cause on failure
pub type FlowResultFuture = ResultCell<Value, FlowError>;

/// Returned by `start_flow`
#[derive(Debug, Clone)]
pub struct FlowHandle {
    pub id: FlowId,
    pub result: FlowResultFuture,
}

/// One side of a conversation: the peer and the protocol spoken with it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Session {
    pub peer: Party,
    pub protocol: String,
}

impl Session {
    pub fn new(peer: Party, protocol: impl Into<String>) -> Self {
        Self {
            peer,
            protocol: protocol.into(),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.protocol, self.peer)
    }
}

/// What wakes a flow
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// First step of an initiating flow
    Start,
    /// A message arrived on a session
    Received { session: Session, payload: Value },
}

/// What a flow wants after a step
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    /// Suspend until a message arrives on this session
    Receive(Session),
    /// Finish with this payload
    Done(Value),
}

/// A protocol written as an explicit state machine
///
/// The engine calls `on_event` once per event. Between calls the flow is
/// parked in the engine's table and holds no thread.
pub trait FlowLogic: Send {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError>;
}

/// Node services available to a flow while it runs a step
pub struct FlowContext {
    me: Party,
    flow_id: FlowId,
    vault: Arc<Vault>,
    transactions: Arc<dyn TransactionStorage>,
    network: NetworkMap,
    notary: Option<Arc<UniquenessProvider>>,
    outbound: Vec<(Session, Value)>,
    committed: bool,
    salts_drawn: u64,
}

impl FlowContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        me: Party,
        flow_id: FlowId,
        vault: Arc<Vault>,
        transactions: Arc<dyn TransactionStorage>,
        network: NetworkMap,
        notary: Option<Arc<UniquenessProvider>>,
        committed: bool,
        salts_drawn: u64,
    ) -> Self {
        Self {
            me,
            flow_id,
            vault,
            transactions,
            network,
            notary,
            outbound: Vec::new(),
            committed,
            salts_drawn,
        }
    }

    pub fn me(&self) -> &Party {
        &self.me
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn network(&self) -> &NetworkMap {
        &self.network
    }

    pub fn transactions(&self) -> &dyn TransactionStorage {
        self.transactions.as_ref()
    }

    /// The local uniqueness service, if this node is a notary
    pub fn notary_service(&self) -> Option<&UniquenessProvider> {
        self.notary.as_deref()
    }

    /// Queue a message; it is sent once the current step finishes
    pub fn send(&mut self, session: &Session, payload: Value) {
        self.outbound.push((session.clone(), payload));
    }

    /// Apply an update to this node's vault
    ///
    /// The first successful commit is the flow's commit point; the flow can no
    /// longer be cancelled afterwards.
    pub fn commit(&mut self, update: VaultUpdate) -> Result<(), FlowError> {
        if update.is_empty() {
            return Ok(());
        }
        self.vault.apply(update)?;
        self.committed = true;
        Ok(())
    }

    /// Record a finalised transaction and apply the slice relevant to this node
    ///
    /// # Parameters
    /// * `tx` - The transaction to record
    ///
    /// # Returns
    /// The update applied to the vault; empty if the transaction was already recorded
    pub fn record_transaction(&mut self, tx: &LedgerTransaction) -> Result<VaultUpdate, FlowError> {
        tx.verify()?;
        if self.transactions.get_transaction(&tx.id)?.is_some() {
            log::debug!("{} already recorded {}", self.me, tx.id);
            return Ok(VaultUpdate::default());
        }

        let update = tx.vault_update_for(&self.me);
        self.commit(update.clone())?;
        self.transactions.store_transaction(tx)?;
        log::info!(
            "{} recorded {} consuming {} and producing {} of its states",
            self.me,
            tx.id,
            update.consumed.len(),
            update.produced.len()
        );
        Ok(update)
    }

    /// A salt unique to this node, flow and draw
    pub fn fresh_salt(&mut self) -> u64 {
        self.salts_drawn += 1;
        let digest = TxId::derive(&[
            b"salt",
            self.me.name().as_bytes(),
            &self.flow_id.0.to_le_bytes(),
            &self.salts_drawn.to_le_bytes(),
        ]);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn has_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn into_effects(self) -> (Vec<(Session, Value)>, bool, u64) {
        (self.outbound, self.committed, self.salts_drawn)
    }
}
