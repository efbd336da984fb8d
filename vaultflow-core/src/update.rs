use crate::id::StateRef;
use crate::states::StateObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An atomic delta to a vault: the identities it consumes and the states it produces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultUpdate {
    /// Identities removed from the unspent set
    pub consumed: BTreeSet<StateRef>,

    /// States added to the unspent set, in output order
    pub produced: Vec<StateObject>,
}

impl VaultUpdate {
    pub fn new(consumed: BTreeSet<StateRef>, produced: Vec<StateObject>) -> Self {
        Self { consumed, produced }
    }

    /// An update that only produces states
    pub fn issue(produced: Vec<StateObject>) -> Self {
        Self {
            consumed: BTreeSet::new(),
            produced,
        }
    }

    /// An update that only consumes states
    pub fn spend(consumed: impl IntoIterator<Item = StateRef>) -> Self {
        Self {
            consumed: consumed.into_iter().collect(),
            produced: Vec::new(),
        }
    }

    /// True for the degenerate identity update
    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty() && self.produced.is_empty()
    }

    /// `(consumed, produced)` counts
    pub fn sizes(&self) -> (usize, usize) {
        (self.consumed.len(), self.produced.len())
    }

    pub fn produced_refs(&self) -> impl Iterator<Item = StateRef> + '_ {
        self.produced.iter().map(|state| state.state_ref)
    }
}
