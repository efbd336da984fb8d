use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// State of a [`ResultCell`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<T, E> {
    Unset,
    Success(T),
    Failure(E),
}

impl<T: Clone, E: Clone> Settlement<T, E> {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Settlement::Unset)
    }

    fn outcome(&self) -> Option<Result<T, E>> {
        match self {
            Settlement::Unset => None,
            Settlement::Success(value) => Some(Ok(value.clone())),
            Settlement::Failure(err) => Some(Err(err.clone())),
        }
    }
}

/// Returned by a second attempt to settle a cell
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("result already settled")]
pub struct AlreadySettled;

/// Single-assignment result shared between one writer and any number of readers
///
/// The cell moves from `Unset` to `Success` or `Failure` exactly once. Later
/// writes are rejected and leave the first outcome in place. Clones share the
/// same underlying cell.
pub struct ResultCell<T, E> {
    state: Arc<watch::Sender<Settlement<T, E>>>,
}

impl<T, E> Clone for ResultCell<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone, E: Clone> Default for ResultCell<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for ResultCell<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResultCell")
            .field(&*self.state.borrow())
            .finish()
    }
}

impl<T: Clone, E: Clone> ResultCell<T, E> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Settlement::Unset);
        Self {
            state: Arc::new(state),
        }
    }

    /// Settle the cell with `outcome`
    ///
    /// # Parameters
    /// * `outcome` - `Ok` settles to `Success`, `Err` to `Failure`
    ///
    /// # Returns
    /// Err(AlreadySettled) if the cell was settled before; the stored outcome is unchanged
    pub fn settle(&self, outcome: Result<T, E>) -> Result<(), AlreadySettled> {
        let mut outcome = Some(outcome);
        let written = self.state.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            *state = match outcome.take() {
                Some(Ok(value)) => Settlement::Success(value),
                Some(Err(err)) => Settlement::Failure(err),
                None => return false,
            };
            true
        });

        if written {
            Ok(())
        } else {
            Err(AlreadySettled)
        }
    }

    /// Run `block` and settle the cell with whatever it returns
    pub fn settle_with<F>(&self, block: F) -> Result<(), AlreadySettled>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        let outcome = block();
        if let Err(err) = &outcome {
            log::warn!("Settling result with failure: {}", err);
        }
        self.settle(outcome)
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().is_settled()
    }

    /// Current state of the cell
    pub fn settlement(&self) -> Settlement<T, E> {
        self.state.borrow().clone()
    }

    /// The outcome if settled, without waiting
    pub fn try_get(&self) -> Option<Result<T, E>> {
        self.state.borrow().outcome()
    }

    /// Wait until the cell is settled
    pub async fn wait(&self) -> Result<T, E> {
        let mut receiver = self.state.subscribe();
        loop {
            if let Some(outcome) = receiver.borrow_and_update().outcome() {
                return outcome;
            }
            // The sender is owned by `self`, so this only returns on a new value
            let _ = receiver.changed().await;
        }
    }

    /// Wait until the cell is settled or `timeout` elapses
    ///
    /// # Returns
    /// None if the timeout elapsed first
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settles_exactly_once() {
        let cell: ResultCell<u32, String> = ResultCell::new();
        assert!(!cell.is_done());
        assert_eq!(cell.try_get(), None);

        assert_eq!(cell.settle(Ok(7)), Ok(()));
        assert_eq!(cell.settle(Err("late".to_string())), Err(AlreadySettled));
        assert_eq!(cell.settle(Ok(8)), Err(AlreadySettled));

        assert!(cell.is_done());
        assert_eq!(cell.try_get(), Some(Ok(7)));
        assert_eq!(cell.settlement(), Settlement::Success(7));
    }

    #[test]
    fn test_clones_share_the_outcome() {
        let writer: ResultCell<u32, String> = ResultCell::new();
        let reader = writer.clone();
        writer.settle(Err("boom".to_string())).unwrap();
        assert_eq!(reader.try_get(), Some(Err("boom".to_string())));
        assert_eq!(reader.settle(Ok(1)), Err(AlreadySettled));
    }

    #[test]
    fn test_settle_with_captures_errors() {
        let cell: ResultCell<u32, String> = ResultCell::new();
        cell.settle_with(|| Err("failed".to_string())).unwrap();
        assert_eq!(cell.try_get(), Some(Err("failed".to_string())));
    }

    #[tokio::test]
    async fn test_wait_resolves_after_settle() {
        let cell: ResultCell<u32, String> = ResultCell::new();
        let reader = cell.clone();
        let waiter = tokio::spawn(async move { reader.wait().await });

        tokio::task::yield_now().await;
        cell.settle(Ok(42)).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(42));
        // Waiting on a settled cell returns immediately
        assert_eq!(cell.wait().await, Ok(42));
    }

    #[tokio::test]
    async fn test_wait_timeout_on_unset_cell() {
        let cell: ResultCell<u32, String> = ResultCell::new();
        assert_eq!(cell.wait_timeout(Duration::from_millis(20)).await, None);
    }
}
