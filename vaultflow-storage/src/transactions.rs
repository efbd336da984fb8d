use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use vaultflow_core::error::StorageError;
use vaultflow_core::id::{StateRef, TxId};
use vaultflow_core::transaction::LedgerTransaction;

/// Iterator for traversing recorded transactions
pub trait TransactionIterator: Iterator<Item = Result<LedgerTransaction, StorageError>> {}

/// Storage interface for transactions a node has recorded
pub trait TransactionStorage: Send + Sync {
    /// Store a transaction
    ///
    /// # Parameters
    /// * `tx` - The transaction to store
    ///
    /// # Returns
    /// Ok(true) if the transaction was new, Ok(false) if it was already stored
    fn store_transaction(&self, tx: &LedgerTransaction) -> Result<bool, StorageError>;

    /// Get a transaction by id
    ///
    /// # Parameters
    /// * `id` - The transaction id
    ///
    /// # Returns
    /// Some(transaction) if found, None otherwise
    fn get_transaction(&self, id: &TxId) -> Result<Option<LedgerTransaction>, StorageError>;

    /// Get every transaction that produced or consumed a state
    ///
    /// # Parameters
    /// * `state_ref` - The state identity
    ///
    /// # Returns
    /// An iterator yielding the producing transaction first, then the consuming one
    fn transactions_for_state(&self, state_ref: &StateRef) -> Box<dyn TransactionIterator + '_>;
}

/// In-memory transaction storage
#[derive(Default)]
pub struct InMemoryTransactionStorage {
    // Mapping from transaction id to transaction, with its arrival order
    transactions_by_id: Mutex<HashMap<TxId, (u64, LedgerTransaction)>>,

    // Mapping from state identity to the transactions that touched it
    transactions_by_state: Mutex<HashMap<StateRef, HashSet<TxId>>>,
}

impl InMemoryTransactionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Iterator over a materialized list of transactions
pub struct InMemoryTransactionIterator {
    transactions: std::vec::IntoIter<LedgerTransaction>,
}

impl Iterator for InMemoryTransactionIterator {
    type Item = Result<LedgerTransaction, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.transactions.next().map(Ok)
    }
}

impl TransactionIterator for InMemoryTransactionIterator {}

impl TransactionStorage for InMemoryTransactionStorage {
    fn store_transaction(&self, tx: &LedgerTransaction) -> Result<bool, StorageError> {
        {
            let mut by_id = self
                .transactions_by_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if by_id.contains_key(&tx.id) {
                return Ok(false);
            }
            let order = by_id.len() as u64;
            by_id.insert(tx.id, (order, tx.clone()));
        }

        // Index by the states the transaction consumed and produced
        {
            let mut by_state = self
                .transactions_by_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for state in tx.inputs.iter().chain(tx.outputs.iter()) {
                by_state.entry(state.state_ref).or_default().insert(tx.id);
            }
        }

        Ok(true)
    }

    fn get_transaction(&self, id: &TxId) -> Result<Option<LedgerTransaction>, StorageError> {
        let by_id = self
            .transactions_by_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(by_id.get(id).map(|(_, tx)| tx.clone()))
    }

    fn transactions_for_state(&self, state_ref: &StateRef) -> Box<dyn TransactionIterator + '_> {
        let ids = {
            let by_state = self
                .transactions_by_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            by_state.get(state_ref).cloned().unwrap_or_default()
        };

        let mut transactions: Vec<(u64, LedgerTransaction)> = {
            let by_id = self
                .transactions_by_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
        };

        // Oldest first
        transactions.sort_by_key(|(order, _)| *order);

        Box::new(InMemoryTransactionIterator {
            transactions: transactions
                .into_iter()
                .map(|(_, tx)| tx)
                .collect::<Vec<_>>()
                .into_iter(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultflow_core::id::Party;
    use vaultflow_core::transaction::TransactionBuilder;

    #[test]
    fn test_store_and_index_transactions() {
        let storage = InMemoryTransactionStorage::new();
        let notary = Party::new("Notary");

        let issue = TransactionBuilder::new(notary.clone())
            .add_output(Party::new("Bank"), "USD", 100)
            .build()
            .unwrap();
        let state = issue.outputs[0].clone();
        let spend = TransactionBuilder::new(notary)
            .add_input(state.clone())
            .add_output(Party::new("Corp"), "USD", 100)
            .build()
            .unwrap();

        assert!(storage.store_transaction(&issue).unwrap());
        assert!(storage.store_transaction(&spend).unwrap());
        // Storing twice is a no-op
        assert!(!storage.store_transaction(&issue).unwrap());

        assert_eq!(storage.get_transaction(&spend.id).unwrap(), Some(spend.clone()));
        assert_eq!(storage.get_transaction(&TxId::new([9; 32])).unwrap(), None);

        let history: Vec<TxId> = storage
            .transactions_for_state(&state.state_ref)
            .map(|tx| tx.unwrap().id)
            .collect();
        assert_eq!(history, vec![issue.id, spend.id]);
    }
}
