use crate::store::{MemoryVaultStore, VaultStore};
use crate::subscription::VaultUpdates;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use vaultflow_core::error::VaultError;
use vaultflow_core::id::{Party, StateRef};
use vaultflow_core::states::StateObject;
use vaultflow_core::update::VaultUpdate;

/// Default capacity of each subscriber's buffer
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Unspent states plus every identity ever produced
#[derive(Default)]
struct Ledger {
    unspent: BTreeMap<StateRef, StateObject>,
    produced: HashSet<StateRef>,
}

impl Ledger {
    fn check(&self, update: &VaultUpdate) -> Result<(), VaultError> {
        for consumed in &update.consumed {
            if !self.unspent.contains_key(consumed) {
                return Err(VaultError::DoubleSpend(*consumed));
            }
        }

        let mut seen = HashSet::with_capacity(update.produced.len());
        for state in &update.produced {
            if self.produced.contains(&state.state_ref) || !seen.insert(state.state_ref) {
                return Err(VaultError::DuplicateProduction(state.state_ref));
            }
        }

        Ok(())
    }

    // Only called after `check` succeeded
    fn mutate(&mut self, update: &VaultUpdate) {
        for consumed in &update.consumed {
            self.unspent.remove(consumed);
        }
        for state in &update.produced {
            self.produced.insert(state.state_ref);
            self.unspent.insert(state.state_ref, state.clone());
        }
    }
}

/// Live subscribers, in subscription order
struct Publisher {
    subscribers: Vec<mpsc::Sender<VaultUpdate>>,
    buffer: usize,
}

impl Publisher {
    fn add(&mut self) -> VaultUpdates {
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.subscribers.push(sender);
        VaultUpdates::new(receiver)
    }

    // Live subscribers at this point of the update order
    fn targets(&mut self) -> Vec<mpsc::Sender<VaultUpdate>> {
        self.subscribers.retain(|subscriber| !subscriber.is_closed());
        self.subscribers.clone()
    }
}

// Hand `update` to each subscriber, waiting on any whose buffer is full
fn publish(owner: &Party, subscribers: Vec<mpsc::Sender<VaultUpdate>>, update: &VaultUpdate) {
    for subscriber in subscribers {
        match subscriber.try_send(update.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                log::warn!(
                    "Vault {} subscriber buffer full, waiting for it to drain",
                    owner
                );
                if futures::executor::block_on(subscriber.send(update)).is_err() {
                    log::debug!("Vault {} subscriber went away while full", owner);
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Vault {} dropping closed subscriber", owner);
            }
        }
    }
}

/// A participant's ledger of unspent states
///
/// Writers are serialized by the writer lock, which is held from the
/// consistency check until the update has been handed to every subscriber,
/// so each subscriber sees updates in application order. The ledger is
/// mutated under the publisher lock, which is released before any send.
/// A slow subscriber therefore stalls later writers only: `current_states`,
/// `subscribe` and `snapshot_and_subscribe` never wait for it.
pub struct Vault {
    owner: Party,
    ledger: RwLock<Ledger>,
    writer: Mutex<()>,
    publisher: Mutex<Publisher>,
    store: Arc<dyn VaultStore>,
}

impl Vault {
    /// Create an empty in-memory vault
    pub fn new(owner: Party) -> Self {
        Self::empty(
            owner,
            Arc::new(MemoryVaultStore::new()),
            DEFAULT_SUBSCRIBER_BUFFER,
        )
    }

    /// Open a vault backed by `store`, replaying its recorded history
    ///
    /// # Parameters
    /// * `owner` - The party owning this vault
    /// * `store` - The persistence collaborator
    /// * `subscriber_buffer` - Capacity of each subscriber's buffer
    ///
    /// # Returns
    /// The vault in the state reached by the recorded history
    pub fn open(
        owner: Party,
        store: Arc<dyn VaultStore>,
        subscriber_buffer: usize,
    ) -> Result<Self, VaultError> {
        let history = store.load()?;
        let vault = Self::empty(owner, store, subscriber_buffer);

        {
            let mut ledger = vault.write_ledger();
            for (position, update) in history.iter().enumerate() {
                ledger.check(update).map_err(|e| {
                    VaultError::StorageFailure(format!(
                        "recorded update {} is inconsistent: {}",
                        position, e
                    ))
                })?;
                ledger.mutate(update);
            }
            log::info!(
                "Vault {} replayed {} updates, {} unspent states",
                vault.owner,
                history.len(),
                ledger.unspent.len()
            );
        }

        Ok(vault)
    }

    fn empty(owner: Party, store: Arc<dyn VaultStore>, subscriber_buffer: usize) -> Self {
        Self {
            owner,
            ledger: RwLock::new(Ledger::default()),
            writer: Mutex::new(()),
            publisher: Mutex::new(Publisher {
                subscribers: Vec::new(),
                buffer: subscriber_buffer.max(1),
            }),
            store,
        }
    }

    pub fn owner(&self) -> &Party {
        &self.owner
    }

    /// Snapshot of every unspent state, ordered by identity
    pub fn current_states(&self) -> Vec<StateObject> {
        self.read_ledger().unspent.values().cloned().collect()
    }

    /// Unspent states matching `predicate`, ordered by identity
    pub fn query<P>(&self, predicate: P) -> Vec<StateObject>
    where
        P: Fn(&StateObject) -> bool,
    {
        self.read_ledger()
            .unspent
            .values()
            .filter(|state| predicate(state))
            .cloned()
            .collect()
    }

    pub fn is_unspent(&self, state_ref: &StateRef) -> bool {
        self.read_ledger().unspent.contains_key(state_ref)
    }

    /// Atomically apply `update` and publish it
    ///
    /// # Parameters
    /// * `update` - The consumed identities and produced states
    ///
    /// # Returns
    /// Ok(()) once the update is applied and handed to every subscriber.
    /// On error nothing was mutated or published.
    pub fn apply(&self, update: VaultUpdate) -> Result<(), VaultError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.read_ledger().check(&update) {
            log::warn!("Vault {} rejected update: {}", self.owner, e);
            return Err(e);
        }

        if let Err(e) = self.store.record(&update) {
            log::error!("Vault {} failed to persist update: {}", self.owner, e);
            return Err(VaultError::from(e));
        }

        let subscribers = {
            let mut publisher = self.lock_publisher();
            self.write_ledger().mutate(&update);
            publisher.targets()
        };
        log::debug!(
            "Vault {} applied update consuming {} and producing {} states",
            self.owner,
            update.consumed.len(),
            update.produced.len()
        );

        publish(&self.owner, subscribers, &update);
        Ok(())
    }

    /// Subscribe to every update applied from now on
    pub fn subscribe(&self) -> VaultUpdates {
        self.lock_publisher().add()
    }

    /// A snapshot and a subscription with no gap or overlap between them
    pub fn snapshot_and_subscribe(&self) -> (Vec<StateObject>, VaultUpdates) {
        let mut publisher = self.lock_publisher();
        let snapshot = self.current_states();
        (snapshot, publisher.add())
    }

    /// Number of subscribers that have not been dropped
    pub fn subscriber_count(&self) -> usize {
        let mut publisher = self.lock_publisher();
        publisher.subscribers.retain(|s| !s.is_closed());
        publisher.subscribers.len()
    }

    fn lock_publisher(&self) -> MutexGuard<'_, Publisher> {
        self.publisher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_ledger(&self) -> std::sync::RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_ledger(&self) -> std::sync::RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use std::thread;
    use std::time::Duration;
    use vaultflow_core::error::StorageError;
    use vaultflow_core::id::TxId;

    fn state(seed: u8, index: u32, quantity: u64) -> StateObject {
        StateObject::new(
            StateRef::new(TxId::new([seed; 32]), index),
            Party::new("Bank"),
            "USD",
            quantity,
        )
    }

    fn refs(states: &[StateObject]) -> BTreeSet<StateRef> {
        states.iter().map(|s| s.state_ref).collect()
    }

    struct FailingStore;

    impl VaultStore for FailingStore {
        fn load(&self) -> Result<Vec<VaultUpdate>, StorageError> {
            Ok(Vec::new())
        }

        fn record(&self, _update: &VaultUpdate) -> Result<(), StorageError> {
            Err(StorageError::Log("disk full".to_string()))
        }
    }

    #[test]
    fn test_unspent_set_is_produced_minus_consumed() {
        let vault = Vault::new(Party::new("Bank"));
        let a = state(1, 0, 10);
        let b = state(1, 1, 20);
        let c = state(2, 0, 30);

        vault.apply(VaultUpdate::issue(vec![a.clone(), b.clone()])).unwrap();
        vault
            .apply(VaultUpdate::new(refs(&[a.clone()]), vec![c.clone()]))
            .unwrap();
        vault.apply(VaultUpdate::spend([b.state_ref])).unwrap();

        assert_eq!(vault.current_states(), vec![c.clone()]);
        assert!(!vault.is_unspent(&a.state_ref));
        assert!(vault.is_unspent(&c.state_ref));
    }

    #[test]
    fn test_double_spend_leaves_vault_unmutated() {
        let vault = Vault::new(Party::new("Bank"));
        let a = state(1, 0, 10);
        let b = state(1, 1, 20);
        vault.apply(VaultUpdate::issue(vec![a.clone(), b.clone()])).unwrap();
        vault.apply(VaultUpdate::spend([a.state_ref])).unwrap();

        let mut updates = vault.subscribe();
        let before = vault.current_states();

        // b is unspent but a is not, so nothing in the update may take effect
        let result = vault.apply(VaultUpdate::new(
            refs(&[b.clone(), a.clone()]),
            vec![state(3, 0, 30)],
        ));
        assert_eq!(result, Err(VaultError::DoubleSpend(a.state_ref)));
        assert_eq!(vault.current_states(), before);
        assert!(updates.try_next_update().is_none());
    }

    #[test]
    fn test_duplicate_production_checks_history() {
        let vault = Vault::new(Party::new("Bank"));
        let a = state(1, 0, 10);
        vault.apply(VaultUpdate::issue(vec![a.clone()])).unwrap();
        vault.apply(VaultUpdate::spend([a.state_ref])).unwrap();

        // Spent, but still produced once before
        assert_eq!(
            vault.apply(VaultUpdate::issue(vec![a.clone()])),
            Err(VaultError::DuplicateProduction(a.state_ref))
        );

        // Duplicates within one update
        let b = state(2, 0, 5);
        assert_eq!(
            vault.apply(VaultUpdate::issue(vec![b.clone(), b.clone()])),
            Err(VaultError::DuplicateProduction(b.state_ref))
        );
        assert!(vault.current_states().is_empty());
    }

    #[test]
    fn test_storage_failure_is_reported_without_mutation() {
        let vault = Vault::open(Party::new("Bank"), Arc::new(FailingStore), 4).unwrap();
        let result = vault.apply(VaultUpdate::issue(vec![state(1, 0, 10)]));
        assert!(matches!(result, Err(VaultError::StorageFailure(_))));
        assert!(vault.current_states().is_empty());
    }

    #[test]
    fn test_subscriber_sees_issue_then_move() {
        let vault = Vault::new(Party::new("Bank"));
        let mut updates = vault.subscribe();
        let a = state(1, 0, 1000);

        vault.apply(VaultUpdate::issue(vec![a.clone()])).unwrap();
        vault.apply(VaultUpdate::spend([a.state_ref])).unwrap();

        let sizes: Vec<_> = updates.drain_buffered().iter().map(|u| u.sizes()).collect();
        assert_eq!(sizes, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_snapshot_and_subscribe_has_no_overlap() {
        let vault = Vault::new(Party::new("Bank"));
        let a = state(1, 0, 10);
        vault.apply(VaultUpdate::issue(vec![a.clone()])).unwrap();

        let (snapshot, mut updates) = vault.snapshot_and_subscribe();
        assert_eq!(snapshot, vec![a.clone()]);
        assert!(updates.try_next_update().is_none());

        let b = state(2, 0, 20);
        vault.apply(VaultUpdate::issue(vec![b.clone()])).unwrap();
        assert_eq!(updates.try_next_update().unwrap().produced, vec![b]);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let vault = Vault::new(Party::new("Bank"));
        let kept = vault.subscribe();
        let dropped = vault.subscribe();
        assert_eq!(vault.subscriber_count(), 2);

        drop(dropped);
        vault.apply(VaultUpdate::issue(vec![state(1, 0, 1)])).unwrap();
        assert_eq!(vault.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_full_buffer_blocks_writer_until_drained() {
        let store = Arc::new(MemoryVaultStore::new());
        let vault = Arc::new(Vault::open(Party::new("Bank"), store, 1).unwrap());
        let mut updates = vault.subscribe();

        let writer = {
            let vault = Arc::clone(&vault);
            thread::spawn(move || {
                for seed in 1..=3u8 {
                    vault.apply(VaultUpdate::issue(vec![state(seed, 0, seed as u64)])).unwrap();
                }
            })
        };

        // The writer cannot finish while the single slot is occupied
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        let mut received = Vec::new();
        while received.len() < 3 {
            let update = updates.blocking_next_update().unwrap();
            received.push(update.produced[0].quantity);
        }
        writer.join().unwrap();

        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn test_open_replays_store_history() {
        let store = Arc::new(MemoryVaultStore::new());
        let a = state(1, 0, 10);
        {
            let vault = Vault::open(Party::new("Bank"), store.clone(), 8).unwrap();
            vault.apply(VaultUpdate::issue(vec![a.clone(), state(1, 1, 5)])).unwrap();
            vault.apply(VaultUpdate::spend([a.state_ref])).unwrap();
        }
        assert_eq!(store.len(), 2);

        let reopened = Vault::open(Party::new("Bank"), store, 8).unwrap();
        assert_eq!(reopened.current_states(), vec![state(1, 1, 5)]);
        assert_eq!(
            reopened.apply(VaultUpdate::issue(vec![a.clone()])),
            Err(VaultError::DuplicateProduction(a.state_ref))
        );
    }

    #[test]
    fn test_subscribing_does_not_wait_for_slow_subscriber() {
        let store = Arc::new(MemoryVaultStore::new());
        let vault = Arc::new(Vault::open(Party::new("Bank"), store, 1).unwrap());
        let mut slow = vault.subscribe();
        vault.apply(VaultUpdate::issue(vec![state(1, 0, 1)])).unwrap();

        let writer = {
            let vault = Arc::clone(&vault);
            thread::spawn(move || {
                vault.apply(VaultUpdate::issue(vec![state(2, 0, 2)])).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        // The blocked update is already applied: in the snapshot, not the feed
        let (snapshot, mut late) = vault.snapshot_and_subscribe();
        assert_eq!(snapshot.len(), 2);
        assert!(late.try_next_update().is_none());
        assert_eq!(vault.current_states().len(), 2);

        for expected in 1..=2 {
            assert_eq!(slow.blocking_next_update().unwrap().produced[0].quantity, expected);
        }
        writer.join().unwrap();

        vault.apply(VaultUpdate::issue(vec![state(3, 0, 3)])).unwrap();
        assert_eq!(late.try_next_update().unwrap().produced[0].quantity, 3);
        assert_eq!(slow.try_next_update().unwrap().produced[0].quantity, 3);
    }

    fn fresh(tx: u32, index: u32, quantity: u64) -> StateObject {
        let mut id = [0u8; 32];
        id[..4].copy_from_slice(&tx.to_le_bytes());
        StateObject::new(
            StateRef::new(TxId::new(id), index),
            Party::new("Bank"),
            "USD",
            quantity,
        )
    }

    #[test]
    fn test_generated_histories_keep_produced_minus_consumed() {
        for seed in 0..25u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let vault = Vault::open(Party::new("Bank"), Arc::new(MemoryVaultStore::new()), 1024).unwrap();
            let mut feed = vault.subscribe();
            let mut accepted: Vec<VaultUpdate> = Vec::new();
            let mut produced_ever: Vec<StateObject> = Vec::new();

            for tx in 0..60u32 {
                let unspent = vault.current_states();
                let mut consumed: BTreeSet<StateRef> = unspent
                    .iter()
                    .filter(|_| rng.gen_bool(0.3))
                    .map(|s| s.state_ref)
                    .collect();
                let mut produced: Vec<StateObject> = (0..rng.gen_range(0..3u32))
                    .map(|index| fresh(tx, index, rng.gen_range(1..100)))
                    .collect();

                // Now and then replay an old identity or consume a spent one
                let spent: Vec<StateRef> = produced_ever
                    .iter()
                    .map(|s| s.state_ref)
                    .filter(|r| !unspent.iter().any(|u| u.state_ref == *r))
                    .collect();
                let expected = match rng.gen_range(0..6) {
                    0 if !produced_ever.is_empty() => {
                        let old = produced_ever[rng.gen_range(0..produced_ever.len())].clone();
                        let state_ref = old.state_ref;
                        produced.push(old);
                        Err(VaultError::DuplicateProduction(state_ref))
                    }
                    1 if !spent.is_empty() => {
                        let state_ref = spent[rng.gen_range(0..spent.len())];
                        consumed.insert(state_ref);
                        Err(VaultError::DoubleSpend(state_ref))
                    }
                    _ => Ok(()),
                };

                let update = VaultUpdate::new(consumed, produced);
                let before = vault.current_states();
                let result = vault.apply(update.clone());
                assert_eq!(result, expected, "seed {} tx {}", seed, tx);
                if result.is_ok() {
                    produced_ever.extend(update.produced.iter().cloned());
                    accepted.push(update);
                } else {
                    assert_eq!(vault.current_states(), before);
                }
            }

            let all_produced: BTreeSet<StateRef> = accepted
                .iter()
                .flat_map(|u| u.produced.iter().map(|s| s.state_ref))
                .collect();
            let all_consumed: BTreeSet<StateRef> =
                accepted.iter().flat_map(|u| u.consumed.iter().copied()).collect();
            let expected: BTreeSet<StateRef> =
                all_produced.difference(&all_consumed).copied().collect();

            assert_eq!(refs(&vault.current_states()), expected, "seed {}", seed);
            assert_eq!(feed.drain_buffered(), accepted, "seed {}", seed);
        }
    }
}
