pub mod error;
pub mod id;
pub mod result_cell;
pub mod states;
pub mod transaction;
pub mod update;

pub use error::{StorageError, TransactionError, VaultError};
pub use id::{Party, StateRef, TxId};
pub use result_cell::{AlreadySettled, ResultCell, Settlement};
pub use states::StateObject;
pub use transaction::{LedgerTransaction, OutputSpec, TransactionBuilder};
pub use update::VaultUpdate;
