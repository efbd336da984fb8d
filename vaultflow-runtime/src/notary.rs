use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use vaultflow_core::id::{StateRef, TxId};
use vaultflow_core::transaction::LedgerTransaction;

/// An input already consumed by another transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConflict {
    pub state_ref: StateRef,
    pub consumed_by: TxId,
}

/// The result of a uniqueness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResult {
    /// No input has been consumed yet
    NoConflict,
    /// These inputs were consumed by other transactions
    Conflict(Vec<StateConflict>),
    /// The same transaction was already notarised
    AlreadyCommitted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotaryError {
    #[error("Inputs already consumed: {0:?}")]
    Conflict(Vec<StateConflict>),

    #[error("Transaction {0} failed verification: {1}")]
    Invalid(TxId, String),
}

/// Registry of consumed inputs kept by a notary
///
/// Each input may be consumed by exactly one transaction. Committing the same
/// transaction again is accepted.
#[derive(Default)]
pub struct UniquenessProvider {
    consumed: Mutex<HashMap<StateRef, TxId>>,
}

impl UniquenessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a transaction against the consumed inputs
    ///
    /// # Parameters
    /// * `tx` - The transaction to check
    ///
    /// # Returns
    /// A ConflictResult indicating whether conflicts were detected
    pub fn check(&self, tx: &LedgerTransaction) -> ConflictResult {
        let consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        Self::check_locked(&consumed, tx)
    }

    /// Verify and commit a transaction's inputs as consumed
    ///
    /// # Parameters
    /// * `tx` - The transaction to notarise
    ///
    /// # Returns
    /// Ok(()) if every input is now consumed by `tx`, Err with the conflicts otherwise
    pub fn commit(&self, tx: &LedgerTransaction) -> Result<(), NotaryError> {
        tx.verify()
            .map_err(|e| NotaryError::Invalid(tx.id, e.to_string()))?;

        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        match Self::check_locked(&consumed, tx) {
            ConflictResult::AlreadyCommitted => Ok(()),
            ConflictResult::Conflict(conflicts) => {
                log::warn!("Notary rejected {}: {} conflicting inputs", tx.id, conflicts.len());
                Err(NotaryError::Conflict(conflicts))
            }
            ConflictResult::NoConflict => {
                for input in &tx.inputs {
                    consumed.insert(input.state_ref, tx.id);
                }
                log::debug!("Notary committed {} with {} inputs", tx.id, tx.inputs.len());
                Ok(())
            }
        }
    }

    fn check_locked(consumed: &HashMap<StateRef, TxId>, tx: &LedgerTransaction) -> ConflictResult {
        let mut conflicts = Vec::new();
        let mut already = 0;

        for input in &tx.inputs {
            match consumed.get(&input.state_ref) {
                Some(consumer) if *consumer == tx.id => already += 1,
                Some(consumer) => conflicts.push(StateConflict {
                    state_ref: input.state_ref,
                    consumed_by: *consumer,
                }),
                None => {}
            }
        }

        if !conflicts.is_empty() {
            ConflictResult::Conflict(conflicts)
        } else if already > 0 && already == tx.inputs.len() {
            ConflictResult::AlreadyCommitted
        } else {
            ConflictResult::NoConflict
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultflow_core::id::Party;
    use vaultflow_core::transaction::TransactionBuilder;

    #[test]
    fn test_uniqueness_provider() {
        let provider = UniquenessProvider::new();
        let notary = Party::new("Notary");

        let issue = TransactionBuilder::new(notary.clone())
            .add_output(Party::new("Bank"), "USD", 100)
            .build()
            .unwrap();
        let coin = issue.outputs[0].clone();

        let to_corp = TransactionBuilder::new(notary.clone())
            .add_input(coin.clone())
            .add_output(Party::new("Corp"), "USD", 100)
            .build()
            .unwrap();
        let to_other = TransactionBuilder::new(notary)
            .add_input(coin.clone())
            .add_output(Party::new("Other"), "USD", 100)
            .build()
            .unwrap();

        assert_eq!(provider.check(&to_corp), ConflictResult::NoConflict);
        provider.commit(&to_corp).unwrap();
        assert_eq!(provider.check(&to_corp), ConflictResult::AlreadyCommitted);

        // Re-notarising is idempotent
        assert!(provider.commit(&to_corp).is_ok());

        let expected = vec![StateConflict {
            state_ref: coin.state_ref,
            consumed_by: to_corp.id,
        }];
        assert_eq!(provider.check(&to_other), ConflictResult::Conflict(expected.clone()));
        assert_eq!(provider.commit(&to_other), Err(NotaryError::Conflict(expected)));
    }
}
