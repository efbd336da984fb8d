use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use vaultflow_core::id::Party;
use vaultflow_runtime::messages::FlowMessage;

type Link = (Party, Party);

/// In-flight messages, one FIFO queue per (sender, receiver) pair
///
/// Queues are served round-robin in pair order, starting after the pair that
/// was served last. Empty queues are dropped.
#[derive(Debug, Default)]
pub struct SimulatedNetwork {
    queues: BTreeMap<Link, VecDeque<FlowMessage>>,
    last_served: Option<Link>,
    delivered: u64,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message in flight
    pub fn push(&mut self, message: FlowMessage) {
        let link = (message.sender.clone(), message.recipient.clone());
        self.queues.entry(link).or_default().push_back(message);
    }

    /// Take the oldest message of the next non-empty queue
    pub fn pop_next(&mut self) -> Option<FlowMessage> {
        let link = match &self.last_served {
            Some(last) => self
                .queues
                .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next()
                .or_else(|| self.queues.iter().next())
                .map(|(link, _)| link.clone()),
            None => self.queues.keys().next().cloned(),
        }?;

        let queue = self.queues.get_mut(&link)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&link);
        }
        self.last_served = Some(link);
        self.delivered += message.is_some() as u64;
        message
    }

    /// Number of messages in flight
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_quiescent(&self) -> bool {
        self.queues.is_empty()
    }

    /// Messages delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}
