// Vault and its persistence backends
pub mod store;
pub mod subscription;
pub mod transactions;
pub mod vault;
pub mod wal;

pub use store::{MemoryVaultStore, VaultStore};
pub use subscription::VaultUpdates;
pub use transactions::{InMemoryTransactionStorage, TransactionIterator, TransactionStorage};
pub use vault::{Vault, DEFAULT_SUBSCRIBER_BUFFER};
pub use wal::{FileVaultLog, VaultLogEntry};
