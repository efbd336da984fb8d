use super::{FINALITY_PROTOCOL, NOTARISE_PROTOCOL};
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowEvent, FlowLogic, FlowStep, Session};
use crate::notary::NotaryError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use vaultflow_core::id::{StateRef, TxId};
use vaultflow_core::transaction::LedgerTransaction;

/// Notary's answer to a notarisation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotaryReply {
    Signed,
    Conflict { states: Vec<StateRef> },
    Rejected { reason: String },
}

impl From<Result<(), NotaryError>> for NotaryReply {
    fn from(result: Result<(), NotaryError>) -> Self {
        match result {
            Ok(()) => NotaryReply::Signed,
            Err(NotaryError::Conflict(conflicts)) => NotaryReply::Conflict {
                states: conflicts.into_iter().map(|c| c.state_ref).collect(),
            },
            Err(err) => NotaryReply::Rejected {
                reason: err.to_string(),
            },
        }
    }
}

impl NotaryReply {
    fn into_result(self, notary: &Session) -> Result<(), FlowError> {
        match self {
            NotaryReply::Signed => Ok(()),
            NotaryReply::Conflict { states } => match states.first() {
                Some(state_ref) => Err(FlowError::DoubleSpend(*state_ref)),
                None => Err(FlowError::Protocol(format!(
                    "{} reported an empty conflict",
                    notary.peer
                ))),
            },
            NotaryReply::Rejected { reason } => Err(FlowError::Protocol(format!(
                "{} rejected the transaction: {}",
                notary.peer, reason
            ))),
        }
    }
}

/// Recipient's acknowledgement of a recorded transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityAck {
    pub tx: TxId,
}

pub(crate) enum Progress {
    Await(Session),
    Finalised(LedgerTransaction),
}

enum Stage {
    Ready,
    Notarising(Session),
    AwaitingAcks(VecDeque<Session>),
}

/// Notarise, record and distribute one transaction
///
/// Used as a sub-machine by flows that produce transactions. Issuances skip
/// the notary. Moves are notarised locally when this node is the notary.
pub(crate) struct Finaliser {
    tx: LedgerTransaction,
    stage: Stage,
}

impl Finaliser {
    pub(crate) fn new(tx: LedgerTransaction) -> Self {
        Self {
            tx,
            stage: Stage::Ready,
        }
    }

    pub(crate) fn begin(&mut self, ctx: &mut FlowContext) -> Result<Progress, FlowError> {
        if self.tx.is_issuance() {
            return self.record_and_distribute(ctx);
        }

        if &self.tx.notary == ctx.me() {
            let service = ctx.notary_service().ok_or_else(|| {
                FlowError::Protocol(format!("{} is not a notary", self.tx.notary))
            })?;
            let session = Session::new(self.tx.notary.clone(), NOTARISE_PROTOCOL);
            NotaryReply::from(service.commit(&self.tx)).into_result(&session)?;
            return self.record_and_distribute(ctx);
        }

        let session = Session::new(self.tx.notary.clone(), NOTARISE_PROTOCOL);
        ctx.send(&session, serde_json::to_value(&self.tx)?);
        self.stage = Stage::Notarising(session.clone());
        Ok(Progress::Await(session))
    }

    pub(crate) fn resume(
        &mut self,
        ctx: &mut FlowContext,
        session: &Session,
        payload: Value,
    ) -> Result<Progress, FlowError> {
        match &mut self.stage {
            Stage::Notarising(notary) if notary == session => {
                let reply: NotaryReply = serde_json::from_value(payload)?;
                reply.into_result(session)?;
                log::debug!("{} notarised {}", session.peer, self.tx.id);
                self.record_and_distribute(ctx)
            }
            Stage::AwaitingAcks(pending) if pending.front() == Some(session) => {
                let ack: FinalityAck = serde_json::from_value(payload)?;
                if ack.tx != self.tx.id {
                    return Err(FlowError::Protocol(format!(
                        "{} acknowledged {} instead of {}",
                        session.peer, ack.tx, self.tx.id
                    )));
                }
                pending.pop_front();
                Ok(self.next_ack())
            }
            _ => Err(FlowError::Protocol(format!(
                "unexpected message on {} while finalising {}",
                session, self.tx.id
            ))),
        }
    }

    fn record_and_distribute(&mut self, ctx: &mut FlowContext) -> Result<Progress, FlowError> {
        ctx.record_transaction(&self.tx)?;

        let payload = serde_json::to_value(&self.tx)?;
        let mut pending = VecDeque::new();
        for party in self.tx.participants() {
            if &party == ctx.me() {
                continue;
            }
            let session = Session::new(party, FINALITY_PROTOCOL);
            ctx.send(&session, payload.clone());
            pending.push_back(session);
        }

        self.stage = Stage::AwaitingAcks(pending);
        Ok(self.next_ack())
    }

    fn next_ack(&self) -> Progress {
        match &self.stage {
            Stage::AwaitingAcks(pending) => match pending.front() {
                Some(session) => Progress::Await(session.clone()),
                None => Progress::Finalised(self.tx.clone()),
            },
            _ => Progress::Finalised(self.tx.clone()),
        }
    }
}

impl Progress {
    pub(crate) fn into_step<F>(self, done: F) -> Result<FlowStep, FlowError>
    where
        F: FnOnce(LedgerTransaction) -> Result<FlowStep, FlowError>,
    {
        match self {
            Progress::Await(session) => Ok(FlowStep::Receive(session)),
            Progress::Finalised(tx) => done(tx),
        }
    }
}

/// Records a transaction sent by its initiator and acknowledges it
pub struct FinalityResponder;

impl FlowLogic for FinalityResponder {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError> {
        let FlowEvent::Received { session, payload } = event else {
            return Err(FlowError::Protocol(
                "finality responder cannot be started directly".to_string(),
            ));
        };

        let tx: LedgerTransaction = serde_json::from_value(payload)?;
        let update = ctx.record_transaction(&tx)?;
        ctx.send(&session, serde_json::to_value(FinalityAck { tx: tx.id })?);

        Ok(FlowStep::Done(json!({
            "tx": tx.id.to_hex(),
            "consumed": update.consumed.len(),
            "produced": update.produced.len(),
        })))
    }
}
