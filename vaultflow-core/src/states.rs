use crate::id::{Party, StateRef};
use serde::{Deserialize, Serialize};

/// An immutable claim held on the ledger
///
/// States are never edited. Transferring a claim consumes the state and
/// produces a new one owned by the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateObject {
    /// Producing transaction and output index
    pub state_ref: StateRef,

    /// Party that may consume this state
    pub owner: Party,

    /// Asset type tag, e.g. a currency code
    pub asset: String,

    /// Amount of the asset this state represents
    pub quantity: u64,
}

impl StateObject {
    pub fn new(state_ref: StateRef, owner: Party, asset: impl Into<String>, quantity: u64) -> Self {
        Self {
            state_ref,
            owner,
            asset: asset.into(),
            quantity,
        }
    }

    /// Identity of this state
    pub fn id(&self) -> StateRef {
        self.state_ref
    }

    pub fn is_owned_by(&self, party: &Party) -> bool {
        &self.owner == party
    }
}
