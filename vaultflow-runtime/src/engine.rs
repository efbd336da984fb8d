use crate::error::FlowError;
use crate::flow::{
    FlowContext, FlowEvent, FlowHandle, FlowId, FlowLogic, FlowResultFuture, FlowStep, Session,
};
use crate::messages::{FlowMessage, MessageBody};
use crate::network_map::NetworkMap;
use crate::notary::UniquenessProvider;
use crate::registry::FlowRegistry;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vaultflow_core::id::Party;
use vaultflow_storage::transactions::{InMemoryTransactionStorage, TransactionStorage};
use vaultflow_storage::vault::Vault;

/// Outcomes of finished flows kept for `flow_state` lookups
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

/// Externally visible state of a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    /// Waiting for a worker to run its next step
    Runnable,
    /// A step is executing
    Running,
    /// Parked until a message arrives on this session
    Suspended(Session),
    Succeeded,
    Failed(FlowError),
}

enum Status {
    Runnable(FlowEvent),
    Running,
    Waiting { session: Session, since: Instant },
}

struct FlowRecord {
    flow_type: String,
    logic: Option<Box<dyn FlowLogic>>,
    status: Status,
    // Messages that arrived for sessions the flow is not waiting on yet
    inbox: VecDeque<(Session, MessageBody)>,
    // Peer flow id for every session the peer has spoken on
    peers: HashMap<Session, FlowId>,
    // Sessions this flow initiated
    opened: HashSet<Session>,
    committed: bool,
    cancel_requested: bool,
    salts_drawn: u64,
    result: FlowResultFuture,
}

impl FlowRecord {
    fn new(flow_type: String, logic: Box<dyn FlowLogic>, event: FlowEvent) -> Self {
        Self {
            flow_type,
            logic: Some(logic),
            status: Status::Runnable(event),
            inbox: VecDeque::new(),
            peers: HashMap::new(),
            opened: HashSet::new(),
            committed: false,
            cancel_requested: false,
            salts_drawn: 0,
            result: FlowResultFuture::new(),
        }
    }

    // Build the wire message for a send on `session`. A closing send on an
    // open session forgets it, so the next send initiates a fresh one.
    fn outgoing(
        &mut self,
        me: &Party,
        flow_id: FlowId,
        session: Session,
        payload: Value,
        closing: bool,
    ) -> FlowMessage {
        let recipient_flow = self.peers.get(&session).copied();
        let body = if recipient_flow.is_some() || self.opened.contains(&session) {
            if closing {
                self.forget(&session);
                MessageBody::Final(payload)
            } else {
                MessageBody::Data(payload)
            }
        } else {
            self.opened.insert(session.clone());
            MessageBody::Initiate(payload)
        };
        FlowMessage {
            sender: me.clone(),
            recipient: session.peer,
            sender_flow: flow_id,
            recipient_flow,
            protocol: session.protocol,
            body,
        }
    }

    fn forget(&mut self, session: &Session) {
        self.peers.remove(session);
        self.opened.remove(session);
    }

    // Every session with a counterpart that should hear about our outcome
    fn counterparts(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .peers
            .keys()
            .chain(self.opened.iter())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sessions.sort();
        sessions
    }
}

/// A step taken out of the engine, ready to run on any thread
pub struct PendingStep {
    flow_id: FlowId,
    flow_type: String,
    logic: Box<dyn FlowLogic>,
    event: FlowEvent,
    ctx: FlowContext,
}

impl PendingStep {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Execute the step
    pub fn run(self) -> StepCompletion {
        let PendingStep {
            flow_id,
            flow_type,
            mut logic,
            event,
            mut ctx,
        } = self;

        log::debug!("Running {} ({}) on {:?}", flow_id, flow_type, event_kind(&event));
        let outcome = logic.on_event(&mut ctx, event);
        let (outbound, committed, salts_drawn) = ctx.into_effects();

        StepCompletion {
            flow_id,
            logic,
            outcome,
            outbound,
            committed,
            salts_drawn,
        }
    }
}

fn event_kind(event: &FlowEvent) -> String {
    match event {
        FlowEvent::Start => "start".to_string(),
        FlowEvent::Received { session, .. } => format!("message from {}", session),
    }
}

/// Result of running a step, handed back to `finish_step`
pub struct StepCompletion {
    flow_id: FlowId,
    logic: Box<dyn FlowLogic>,
    outcome: Result<FlowStep, FlowError>,
    outbound: Vec<(Session, Value)>,
    committed: bool,
    salts_drawn: u64,
}

impl StepCompletion {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

/// Runs a node's flows as state machines
///
/// The engine owns every live flow. A flow is either runnable, running on
/// some worker, or suspended waiting on a session. Suspended flows hold no
/// thread; an arriving message makes them runnable again. Outbound messages
/// collect in an outbox that the transport (or the simulation) drains.
pub struct FlowEngine {
    me: Party,
    vault: Arc<Vault>,
    transactions: Arc<dyn TransactionStorage>,
    registry: Arc<FlowRegistry>,
    network: NetworkMap,
    notary: Option<Arc<UniquenessProvider>>,
    flows: BTreeMap<FlowId, FlowRecord>,
    // Most recent outcomes, oldest first in `finished_order`
    finished: HashMap<FlowId, FlowState>,
    finished_order: VecDeque<FlowId>,
    finished_retention: usize,
    stopped: bool,
    // (sender, sender flow, protocol) -> local flow
    sessions: HashMap<(Party, FlowId, String), FlowId>,
    run_queue: VecDeque<FlowId>,
    outbox: VecDeque<FlowMessage>,
    next_flow_id: u64,
}

impl FlowEngine {
    pub fn new(me: Party, vault: Arc<Vault>, registry: Arc<FlowRegistry>, network: NetworkMap) -> Self {
        Self {
            me,
            vault,
            transactions: Arc::new(InMemoryTransactionStorage::new()),
            registry,
            network,
            notary: None,
            flows: BTreeMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            finished_retention: DEFAULT_FINISHED_RETENTION,
            stopped: false,
            sessions: HashMap::new(),
            run_queue: VecDeque::new(),
            outbox: VecDeque::new(),
            next_flow_id: 1,
        }
    }

    /// Make this node a notary
    pub fn with_notary_service(mut self, provider: Arc<UniquenessProvider>) -> Self {
        self.notary = Some(provider);
        self
    }

    /// Keep at most `retention` finished outcomes visible to `flow_state`
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn with_transaction_storage(mut self, storage: Arc<dyn TransactionStorage>) -> Self {
        self.transactions = storage;
        self
    }

    pub fn me(&self) -> &Party {
        &self.me
    }

    pub fn vault(&self) -> Arc<Vault> {
        Arc::clone(&self.vault)
    }

    pub fn transactions(&self) -> Arc<dyn TransactionStorage> {
        Arc::clone(&self.transactions)
    }

    pub fn network(&self) -> &NetworkMap {
        &self.network
    }

    pub fn is_notary(&self) -> bool {
        self.notary.is_some()
    }

    /// Validate and queue a new flow
    ///
    /// # Parameters
    /// * `flow_type` - Registered flow type name
    /// * `args` - Positional arguments matching the flow's signature
    ///
    /// # Returns
    /// A handle with an unset result future, or InvalidArguments / UnknownFlow
    /// with nothing started
    pub fn start_flow(&mut self, flow_type: &str, args: Vec<Value>) -> Result<FlowHandle, FlowError> {
        if self.stopped {
            return Err(FlowError::NodeStopped);
        }
        let logic = self.instantiate(flow_type, &args)?;

        let flow_id = self.allocate_flow_id();
        let record = FlowRecord::new(flow_type.to_string(), logic, FlowEvent::Start);
        let result = record.result.clone();
        self.flows.insert(flow_id, record);
        self.run_queue.push_back(flow_id);

        log::info!("{} started {} ({})", self.me, flow_id, flow_type);
        Ok(FlowHandle {
            id: flow_id,
            result,
        })
    }

    /// Check a start request without queueing anything
    pub fn check_start(&self, flow_type: &str, args: &[Value]) -> Result<(), FlowError> {
        self.instantiate(flow_type, args).map(|_| ())
    }

    fn instantiate(&self, flow_type: &str, args: &[Value]) -> Result<Box<dyn FlowLogic>, FlowError> {
        let (validated, logic) = self.registry.instantiate(flow_type, args)?;
        for party in validated.parties() {
            if !self.network.contains(&party) {
                return Err(FlowError::InvalidArguments(format!(
                    "{}: unknown party {}",
                    flow_type, party
                )));
            }
        }
        Ok(logic)
    }

    /// Route an inbound message to its flow, creating a responder if it opens a session
    pub fn deliver(&mut self, message: FlowMessage) {
        if message.recipient != self.me {
            log::warn!(
                "{} received a message addressed to {}",
                self.me,
                message.recipient
            );
            return;
        }

        let session = Session::new(message.sender.clone(), message.protocol.clone());
        let key = (message.sender.clone(), message.sender_flow, message.protocol.clone());
        let target = message
            .recipient_flow
            .or_else(|| self.sessions.get(&key).copied());

        match target {
            Some(flow_id) if self.flows.contains_key(&flow_id) => {
                self.sessions.entry(key).or_insert(flow_id);
                self.enqueue(flow_id, session, message.sender_flow, message.body);
            }
            Some(flow_id) => match message.body {
                MessageBody::Initiate(_) | MessageBody::Data(_) => {
                    log::warn!("{} got {} message for finished {}", self.me, session, flow_id);
                    self.reject(&session, message.sender_flow, "session closed");
                }
                _ => {
                    log::debug!("{} dropping {} message for finished {}", self.me, session, flow_id);
                }
            },
            None => match message.body {
                MessageBody::Initiate(payload) => {
                    self.spawn_responder(session, key, message.sender_flow, payload)
                }
                MessageBody::Data(_) => {
                    log::warn!("{} has no session for {} message", self.me, session);
                    self.reject(&session, message.sender_flow, "no such session");
                }
                MessageBody::Final(_) | MessageBody::End => {
                    log::debug!("{} ignoring close of unknown {}", self.me, session);
                }
                MessageBody::Error(reason) => {
                    log::debug!("{} ignoring error on closed {}: {}", self.me, session, reason);
                }
            },
        }
    }

    fn spawn_responder(
        &mut self,
        session: Session,
        key: (Party, FlowId, String),
        peer_flow: FlowId,
        payload: Value,
    ) {
        let Some(logic) = self.registry.responder(&session.protocol) else {
            log::warn!("{} has no responder for {}", self.me, session.protocol);
            self.reject(&session, peer_flow, "no responder registered");
            return;
        };

        let flow_id = self.allocate_flow_id();
        let event = FlowEvent::Received {
            session: session.clone(),
            payload,
        };
        let mut record = FlowRecord::new(session.protocol.clone(), logic, event);
        record.peers.insert(session.clone(), peer_flow);

        self.flows.insert(flow_id, record);
        self.sessions.insert(key, flow_id);
        self.run_queue.push_back(flow_id);
        log::debug!("{} started responder {} for {}", self.me, flow_id, session);
    }

    fn reject(&mut self, session: &Session, peer_flow: FlowId, reason: &str) {
        self.outbox.push_back(FlowMessage {
            sender: self.me.clone(),
            recipient: session.peer.clone(),
            sender_flow: FlowId(0),
            recipient_flow: Some(peer_flow),
            protocol: session.protocol.clone(),
            body: MessageBody::Error(reason.to_string()),
        });
    }

    fn enqueue(&mut self, flow_id: FlowId, session: Session, peer_flow: FlowId, body: MessageBody) {
        let Some(record) = self.flows.get_mut(&flow_id) else {
            return;
        };
        match &body {
            MessageBody::Final(_) | MessageBody::End => record.forget(&session),
            _ if peer_flow != FlowId(0) => {
                record.peers.insert(session.clone(), peer_flow);
            }
            _ => {}
        }

        let waiting_on = match &record.status {
            Status::Waiting { session, .. } => Some(session.clone()),
            _ => None,
        };

        match body {
            MessageBody::Error(reason) if waiting_on.is_some() => {
                self.fail(
                    flow_id,
                    FlowError::Counterparty {
                        party: session.peer,
                        reason,
                    },
                );
            }
            // The peer is gone; a flow still waiting on it will time out
            MessageBody::End => {
                log::debug!("{} saw {} end for {}", self.me, session, flow_id);
            }
            MessageBody::Initiate(payload) | MessageBody::Data(payload) | MessageBody::Final(payload)
                if waiting_on.as_ref() == Some(&session) =>
            {
                log::debug!("{} resuming {} on {}", self.me, flow_id, session);
                record.status = Status::Runnable(FlowEvent::Received { session, payload });
                self.run_queue.push_back(flow_id);
            }
            body => record.inbox.push_back((session, body)),
        }
    }

    /// Take the next runnable flow out of the table
    pub fn begin_step(&mut self) -> Option<PendingStep> {
        while let Some(flow_id) = self.run_queue.pop_front() {
            let Some(record) = self.flows.get_mut(&flow_id) else {
                continue;
            };
            let event = match std::mem::replace(&mut record.status, Status::Running) {
                Status::Runnable(event) => event,
                other => {
                    record.status = other;
                    continue;
                }
            };
            let Some(logic) = record.logic.take() else {
                record.status = Status::Runnable(event);
                continue;
            };

            let ctx = FlowContext::new(
                self.me.clone(),
                flow_id,
                Arc::clone(&self.vault),
                Arc::clone(&self.transactions),
                self.network.clone(),
                self.notary.clone(),
                record.committed,
                record.salts_drawn,
            );
            return Some(PendingStep {
                flow_id,
                flow_type: record.flow_type.clone(),
                logic,
                event,
                ctx,
            });
        }
        None
    }

    /// Put a flow back after its step ran: park it, or settle its result
    pub fn finish_step(&mut self, completion: StepCompletion) {
        let StepCompletion {
            flow_id,
            logic,
            outcome,
            outbound,
            committed,
            salts_drawn,
        } = completion;

        let Some(record) = self.flows.get_mut(&flow_id) else {
            log::warn!("{} finished a step for unknown {}", self.me, flow_id);
            return;
        };
        record.logic = Some(logic);
        record.committed |= committed;
        record.salts_drawn = salts_drawn;

        let cancelled = record.cancel_requested && !record.committed;
        let finishing = !cancelled && matches!(outcome, Ok(FlowStep::Done(_)));
        // A finishing flow closes each session with its last send on it
        let closing: Vec<bool> = (0..outbound.len())
            .map(|index| {
                finishing
                    && !outbound[index + 1..]
                        .iter()
                        .any(|(later, _)| *later == outbound[index].0)
            })
            .collect();
        for ((session, payload), closing) in outbound.into_iter().zip(closing) {
            let message = record.outgoing(&self.me, flow_id, session, payload, closing);
            self.outbox.push_back(message);
        }

        if cancelled {
            self.fail(flow_id, FlowError::Cancelled);
            return;
        }

        match outcome {
            Ok(FlowStep::Done(payload)) => self.complete(flow_id, payload),
            Ok(FlowStep::Receive(session)) => self.suspend(flow_id, session),
            Err(err) => self.fail(flow_id, err),
        }
    }

    /// Run one step synchronously
    ///
    /// # Returns
    /// The flow that stepped, or None if nothing was runnable
    pub fn run_next(&mut self) -> Option<FlowId> {
        let step = self.begin_step()?;
        let completion = step.run();
        let flow_id = completion.flow_id();
        self.finish_step(completion);
        Some(flow_id)
    }

    fn suspend(&mut self, flow_id: FlowId, session: Session) {
        let Some(record) = self.flows.get_mut(&flow_id) else {
            return;
        };

        let peer_error = record.inbox.iter().find_map(|(s, body)| match body {
            MessageBody::Error(reason) => Some((s.peer.clone(), reason.clone())),
            _ => None,
        });
        if let Some((peer, reason)) = peer_error {
            self.fail(flow_id, FlowError::Counterparty { party: peer, reason });
            return;
        }

        let position = record.inbox.iter().position(|(s, _)| *s == session);
        match position.and_then(|index| record.inbox.remove(index)) {
            Some((
                session,
                MessageBody::Initiate(payload) | MessageBody::Data(payload) | MessageBody::Final(payload),
            )) => {
                record.status = Status::Runnable(FlowEvent::Received { session, payload });
                self.run_queue.push_back(flow_id);
            }
            _ => {
                log::debug!("{} suspended {} on {}", self.me, flow_id, session);
                record.status = Status::Waiting {
                    session,
                    since: Instant::now(),
                };
            }
        }
    }

    fn complete(&mut self, flow_id: FlowId, payload: Value) {
        let Some(record) = self.remove(flow_id) else {
            return;
        };
        log::info!("{} {} ({}) succeeded", self.me, flow_id, record.flow_type);

        for session in record.counterparts() {
            let recipient_flow = record.peers.get(&session).copied();
            self.outbox.push_back(FlowMessage {
                sender: self.me.clone(),
                recipient: session.peer,
                sender_flow: flow_id,
                recipient_flow,
                protocol: session.protocol,
                body: MessageBody::End,
            });
        }
        if record.result.settle(Ok(payload)).is_err() {
            log::error!("{} result of {} was settled twice", self.me, flow_id);
        }
        self.record_outcome(flow_id, FlowState::Succeeded);
    }

    fn fail(&mut self, flow_id: FlowId, err: FlowError) {
        let Some(record) = self.remove(flow_id) else {
            return;
        };
        log::warn!("{} {} ({}) failed: {}", self.me, flow_id, record.flow_type, err);

        for session in record.counterparts() {
            let recipient_flow = record.peers.get(&session).copied();
            self.outbox.push_back(FlowMessage {
                sender: self.me.clone(),
                recipient: session.peer,
                sender_flow: flow_id,
                recipient_flow,
                protocol: session.protocol,
                body: MessageBody::Error(err.to_string()),
            });
        }

        if record.result.settle(Err(err.clone())).is_err() {
            log::error!("{} result of {} was settled twice", self.me, flow_id);
        }
        self.record_outcome(flow_id, FlowState::Failed(err));
    }

    fn record_outcome(&mut self, flow_id: FlowId, state: FlowState) {
        self.finished.insert(flow_id, state);
        self.finished_order.push_back(flow_id);
        while self.finished_order.len() > self.finished_retention {
            if let Some(evicted) = self.finished_order.pop_front() {
                self.finished.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, flow_id: FlowId) -> Option<FlowRecord> {
        let record = self.flows.remove(&flow_id)?;
        self.run_queue.retain(|queued| *queued != flow_id);
        self.sessions.retain(|_, local| *local != flow_id);
        Some(record)
    }

    /// Fail a flow whose step was lost, e.g. because the worker panicked
    pub fn abort(&mut self, flow_id: FlowId, err: FlowError) {
        self.fail(flow_id, err);
    }

    /// Cancel a flow that has not committed yet
    ///
    /// A flow in the middle of a step is cancelled when the step ends, unless
    /// that step commits; a committed flow always runs to its own outcome.
    pub fn cancel(&mut self, flow_id: FlowId) -> Result<(), FlowError> {
        let Some(record) = self.flows.get_mut(&flow_id) else {
            return Err(FlowError::NoSuchFlow(flow_id));
        };
        if record.committed {
            return Err(FlowError::AlreadyCommitted);
        }

        if matches!(record.status, Status::Running) {
            record.cancel_requested = true;
            log::info!("{} will cancel {} after its current step", self.me, flow_id);
        } else {
            self.fail(flow_id, FlowError::Cancelled);
        }
        Ok(())
    }

    /// Fail every live flow with `NodeStopped` and refuse new ones
    ///
    /// Steps still running elsewhere are abandoned; their completions are
    /// ignored when they come back.
    ///
    /// # Returns
    /// The flows that were stopped
    pub fn stop(&mut self) -> Vec<FlowId> {
        self.stopped = true;
        let live: Vec<FlowId> = self.flows.keys().copied().collect();
        for flow_id in &live {
            self.fail(*flow_id, FlowError::NodeStopped);
        }
        if !live.is_empty() {
            log::info!("{} stopped {} live flows", self.me, live.len());
        }
        live
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Fail every flow that has waited on a session longer than `timeout`
    pub fn expire_waits(&mut self, now: Instant, timeout: Duration) -> Vec<FlowId> {
        let expired: Vec<(FlowId, Session)> = self
            .flows
            .iter()
            .filter_map(|(flow_id, record)| match &record.status {
                Status::Waiting { session, since }
                    if now.saturating_duration_since(*since) >= timeout =>
                {
                    Some((*flow_id, session.clone()))
                }
                _ => None,
            })
            .collect();
        self.time_out(expired)
    }

    /// Fail every suspended flow; used once no message can ever arrive
    pub fn fail_stalled(&mut self) -> Vec<FlowId> {
        let stalled: Vec<(FlowId, Session)> = self
            .flows
            .iter()
            .filter_map(|(flow_id, record)| match &record.status {
                Status::Waiting { session, .. } => Some((*flow_id, session.clone())),
                _ => None,
            })
            .collect();
        self.time_out(stalled)
    }

    fn time_out(&mut self, flows: Vec<(FlowId, Session)>) -> Vec<FlowId> {
        flows
            .into_iter()
            .map(|(flow_id, session)| {
                self.fail(
                    flow_id,
                    FlowError::MessageTimeout {
                        peer: session.peer,
                        protocol: session.protocol,
                    },
                );
                flow_id
            })
            .collect()
    }

    /// Take every queued outbound message, oldest first
    pub fn drain_outbox(&mut self) -> Vec<FlowMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn has_runnable(&self) -> bool {
        !self.run_queue.is_empty()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Number of flows that have not reached an outcome
    pub fn live_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn flow_state(&self, flow_id: FlowId) -> Option<FlowState> {
        if let Some(record) = self.flows.get(&flow_id) {
            return Some(match &record.status {
                Status::Runnable(_) => FlowState::Runnable,
                Status::Running => FlowState::Running,
                Status::Waiting { session, .. } => FlowState::Suspended(session.clone()),
            });
        }
        self.finished.get(&flow_id).cloned()
    }

    /// Result future of a live flow
    pub fn result(&self, flow_id: FlowId) -> Option<FlowResultFuture> {
        self.flows.get(&flow_id).map(|record| record.result.clone())
    }

    fn allocate_flow_id(&mut self) -> FlowId {
        let flow_id = FlowId(self.next_flow_id);
        self.next_flow_id += 1;
        flow_id
    }
}
