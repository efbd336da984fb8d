use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use vaultflow_core::id::Party;

#[derive(Default)]
struct Directory {
    parties: BTreeSet<Party>,
    notaries: BTreeSet<Party>,
}

/// Shared directory of the parties and notaries on the network
///
/// Clones share the same directory, so nodes registered later are visible to
/// engines created earlier.
#[derive(Clone, Default)]
pub struct NetworkMap {
    directory: Arc<RwLock<Directory>>,
}

impl NetworkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a party, optionally as a notary
    ///
    /// # Returns
    /// false if the party was already registered
    pub fn register(&self, party: Party, notary: bool) -> bool {
        let mut directory = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if notary {
            directory.notaries.insert(party.clone());
        }
        directory.parties.insert(party)
    }

    pub fn contains(&self, party: &Party) -> bool {
        self.read().parties.contains(party)
    }

    pub fn is_notary(&self, party: &Party) -> bool {
        self.read().notaries.contains(party)
    }

    pub fn parties(&self) -> Vec<Party> {
        self.read().parties.iter().cloned().collect()
    }

    pub fn notaries(&self) -> Vec<Party> {
        self.read().notaries.iter().cloned().collect()
    }

    /// The first notary by name
    pub fn default_notary(&self) -> Option<Party> {
        self.read().notaries.iter().next().cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Directory> {
        self.directory.read().unwrap_or_else(PoisonError::into_inner)
    }
}
