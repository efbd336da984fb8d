use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use vaultflow_core::update::VaultUpdate;

/// A subscriber's view of a vault's update feed
///
/// Updates arrive in application order, each exactly once. The feed is
/// backed by a bounded buffer; when it is full the vault's writer waits
/// for this subscriber to catch up. The stream ends when the vault is dropped.
pub struct VaultUpdates {
    receiver: mpsc::Receiver<VaultUpdate>,
}

impl VaultUpdates {
    pub(crate) fn new(receiver: mpsc::Receiver<VaultUpdate>) -> Self {
        Self { receiver }
    }

    /// Wait for the next update
    ///
    /// # Returns
    /// None once the vault has been dropped and the buffer is drained
    pub async fn next_update(&mut self) -> Option<VaultUpdate> {
        self.receiver.recv().await
    }

    /// The next buffered update, without waiting
    pub fn try_next_update(&mut self) -> Option<VaultUpdate> {
        self.receiver.try_recv().ok()
    }

    /// Block the current thread until the next update
    ///
    /// Must not be called from within an async execution context.
    pub fn blocking_next_update(&mut self) -> Option<VaultUpdate> {
        self.receiver.blocking_recv()
    }

    /// Take every update currently buffered
    pub fn drain_buffered(&mut self) -> Vec<VaultUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = self.receiver.try_recv() {
            updates.push(update);
        }
        updates
    }
}

impl Stream for VaultUpdates {
    type Item = VaultUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
