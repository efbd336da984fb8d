use crate::error::TransactionError;
use crate::id::{Party, StateRef, TxId};
use crate::states::StateObject;
use crate::update::VaultUpdate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An output of a transaction that has not been built yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub owner: Party,
    pub asset: String,
    pub quantity: u64,
}

/// A resolved ledger transaction
///
/// Inputs carry the full consumed states so every participant can compute its
/// own vault update without looking anything up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TxId,
    pub inputs: Vec<StateObject>,
    pub outputs: Vec<StateObject>,
    pub notary: Party,
    pub salt: u64,
}

impl LedgerTransaction {
    /// True if the transaction creates states without consuming any
    pub fn is_issuance(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn input_refs(&self) -> BTreeSet<StateRef> {
        self.inputs.iter().map(|state| state.state_ref).collect()
    }

    /// Every party owning an input or an output
    pub fn participants(&self) -> BTreeSet<Party> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|state| state.owner.clone())
            .collect()
    }

    /// The slice of this transaction relevant to `party`'s vault
    ///
    /// # Parameters
    /// * `party` - The vault owner
    ///
    /// # Returns
    /// Consumed inputs the party owned and produced outputs the party owns
    pub fn vault_update_for(&self, party: &Party) -> VaultUpdate {
        let consumed = self
            .inputs
            .iter()
            .filter(|state| state.is_owned_by(party))
            .map(|state| state.state_ref)
            .collect();
        let produced = self
            .outputs
            .iter()
            .filter(|state| state.is_owned_by(party))
            .cloned()
            .collect();
        VaultUpdate::new(consumed, produced)
    }

    /// Check the id matches the content and that non-issuance transactions conserve every asset
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.outputs.is_empty() && self.inputs.is_empty() {
            return Err(TransactionError::Empty);
        }

        let specs: Vec<OutputSpec> = self
            .outputs
            .iter()
            .map(|state| OutputSpec {
                owner: state.owner.clone(),
                asset: state.asset.clone(),
                quantity: state.quantity,
            })
            .collect();
        let expected = compute_id(&self.input_refs(), &specs, &self.notary, self.salt);
        if expected != self.id {
            return Err(TransactionError::IdMismatch(self.id));
        }

        for (index, output) in self.outputs.iter().enumerate() {
            if output.state_ref != StateRef::new(self.id, index as u32) {
                return Err(TransactionError::IdMismatch(self.id));
            }
        }

        if self.is_issuance() {
            return Ok(());
        }

        let inputs = asset_totals(&self.inputs);
        let outputs = asset_totals(&self.outputs);
        if inputs != outputs {
            let asset = inputs
                .keys()
                .chain(outputs.keys())
                .find(|asset| inputs.get(*asset) != outputs.get(*asset))
                .map(|asset| asset.to_string())
                .unwrap_or_default();
            return Err(TransactionError::Unbalanced(asset));
        }

        Ok(())
    }
}

/// Assembles a transaction and derives its id
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    notary: Party,
    inputs: Vec<StateObject>,
    outputs: Vec<OutputSpec>,
    salt: u64,
}

impl TransactionBuilder {
    pub fn new(notary: Party) -> Self {
        Self {
            notary,
            inputs: Vec::new(),
            outputs: Vec::new(),
            salt: 0,
        }
    }

    pub fn add_input(mut self, state: StateObject) -> Self {
        self.inputs.push(state);
        self
    }

    pub fn add_output(mut self, owner: Party, asset: impl Into<String>, quantity: u64) -> Self {
        self.outputs.push(OutputSpec {
            owner,
            asset: asset.into(),
            quantity,
        });
        self
    }

    /// Salt distinguishes otherwise identical transactions
    pub fn salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    pub fn build(self) -> Result<LedgerTransaction, TransactionError> {
        let input_refs: BTreeSet<StateRef> = self.inputs.iter().map(|s| s.state_ref).collect();
        if input_refs.len() != self.inputs.len() {
            return Err(TransactionError::DuplicateInput);
        }

        let id = compute_id(&input_refs, &self.outputs, &self.notary, self.salt);
        let outputs = self
            .outputs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                StateObject::new(
                    StateRef::new(id, index as u32),
                    spec.owner,
                    spec.asset,
                    spec.quantity,
                )
            })
            .collect();

        let tx = LedgerTransaction {
            id,
            inputs: self.inputs,
            outputs,
            notary: self.notary,
            salt: self.salt,
        };
        tx.verify()?;
        Ok(tx)
    }
}

fn asset_totals(states: &[StateObject]) -> BTreeMap<&str, u128> {
    let mut sums: BTreeMap<&str, u128> = BTreeMap::new();
    for state in states {
        *sums.entry(state.asset.as_str()).or_default() += state.quantity as u128;
    }
    sums
}

fn compute_id(
    inputs: &BTreeSet<StateRef>,
    outputs: &[OutputSpec],
    notary: &Party,
    salt: u64,
) -> TxId {
    let mut seeds: Vec<Vec<u8>> = Vec::with_capacity(inputs.len() + outputs.len() * 3 + 2);
    for input in inputs {
        let mut bytes = input.txid.bytes().to_vec();
        bytes.extend_from_slice(&input.index.to_le_bytes());
        seeds.push(bytes);
    }
    for output in outputs {
        seeds.push(output.owner.name().as_bytes().to_vec());
        seeds.push(output.asset.as_bytes().to_vec());
        seeds.push(output.quantity.to_le_bytes().to_vec());
    }
    seeds.push(notary.name().as_bytes().to_vec());
    seeds.push(salt.to_le_bytes().to_vec());

    let slices: Vec<&[u8]> = seeds.iter().map(|seed| seed.as_slice()).collect();
    TxId::derive(&slices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(owner: &str, quantity: u64, salt: u64) -> LedgerTransaction {
        TransactionBuilder::new(Party::new("Notary"))
            .add_output(Party::new(owner), "USD", quantity)
            .salt(salt)
            .build()
            .unwrap()
    }

    #[test]
    fn test_issuance_outputs_reference_the_transaction() {
        let tx = issue("Bank", 1000, 1);
        assert!(tx.is_issuance());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].state_ref, StateRef::new(tx.id, 0));
        assert!(tx.verify().is_ok());

        // Different salt, different id
        assert_ne!(tx.id, issue("Bank", 1000, 2).id);
    }

    #[test]
    fn test_vault_update_per_participant() {
        let issued = issue("Bank", 1000, 1);
        let state = issued.outputs[0].clone();

        let moved = TransactionBuilder::new(Party::new("Notary"))
            .add_input(state.clone())
            .add_output(Party::new("Corp"), "USD", 1000)
            .build()
            .unwrap();

        let bank = moved.vault_update_for(&Party::new("Bank"));
        assert_eq!(bank.sizes(), (1, 0));
        assert!(bank.consumed.contains(&state.state_ref));

        let corp = moved.vault_update_for(&Party::new("Corp"));
        assert_eq!(corp.sizes(), (0, 1));

        let bystander = moved.vault_update_for(&Party::new("Other"));
        assert!(bystander.is_empty());

        let participants: Vec<String> = moved
            .participants()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(participants, vec!["Bank", "Corp"]);
    }

    #[test]
    fn test_unbalanced_move_is_rejected() {
        let issued = issue("Bank", 100, 1);
        let result = TransactionBuilder::new(Party::new("Notary"))
            .add_input(issued.outputs[0].clone())
            .add_output(Party::new("Corp"), "USD", 150)
            .build();
        assert_eq!(result, Err(TransactionError::Unbalanced("USD".to_string())));
    }

    #[test]
    fn test_duplicate_input_and_empty_transaction() {
        let issued = issue("Bank", 100, 1);
        let state = issued.outputs[0].clone();
        let result = TransactionBuilder::new(Party::new("Notary"))
            .add_input(state.clone())
            .add_input(state)
            .add_output(Party::new("Corp"), "USD", 200)
            .build();
        assert_eq!(result, Err(TransactionError::DuplicateInput));

        let empty = TransactionBuilder::new(Party::new("Notary")).build();
        assert_eq!(empty, Err(TransactionError::Empty));
    }

    #[test]
    fn test_tampered_transaction_fails_verification() {
        let mut tx = issue("Bank", 100, 1);
        tx.outputs[0].quantity = 1_000_000;
        assert_eq!(tx.verify(), Err(TransactionError::IdMismatch(tx.id)));
    }
}
