use std::sync::{Mutex, PoisonError};
use vaultflow_core::error::StorageError;
use vaultflow_core::update::VaultUpdate;

/// Persistence collaborator behind a vault
///
/// A store records every accepted update before the vault mutates, and replays
/// them in order when the vault is reopened.
pub trait VaultStore: Send + Sync {
    /// Load every recorded update in application order
    ///
    /// # Returns
    /// The update history, oldest first
    fn load(&self) -> Result<Vec<VaultUpdate>, StorageError>;

    /// Durably record an update that is about to be applied
    ///
    /// # Parameters
    /// * `update` - The update that passed the vault's consistency checks
    ///
    /// # Returns
    /// Ok(()) if successful, Err otherwise; on error the vault stays unmutated
    fn record(&self, update: &VaultUpdate) -> Result<(), StorageError>;
}

/// Volatile store keeping the update history in memory
#[derive(Default)]
pub struct MemoryVaultStore {
    history: Mutex<Vec<VaultUpdate>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of updates recorded so far
    pub fn len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VaultStore for MemoryVaultStore {
    fn load(&self) -> Result<Vec<VaultUpdate>, StorageError> {
        Ok(self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn record(&self, update: &VaultUpdate) -> Result<(), StorageError> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update.clone());
        Ok(())
    }
}
