use super::finality::{Finaliser, Progress};
use super::ISSUANCE_PROTOCOL;
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowEvent, FlowLogic, FlowStep, Session};
use crate::registry::FlowArgs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vaultflow_core::id::{Party, TxId};
use vaultflow_core::transaction::TransactionBuilder;

/// Sent by a requester asking an issuer for new cash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRequest {
    pub quantity: u64,
    pub asset: String,
    pub issue_to: Party,
    pub issuer_ref: String,
}

/// Issuer's answer once both transactions are final
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum IssuanceReply {
    Success {
        issue_tx: TxId,
        move_tx: TxId,
        issuer_ref: String,
    },
    Failure {
        reason: String,
    },
}

/// Asks an issuer to issue cash and move it to `issue_to`
pub struct IssuanceRequester {
    request: IssuanceRequest,
    issuer: Party,
}

impl IssuanceRequester {
    pub fn new(request: IssuanceRequest, issuer: Party) -> Self {
        Self { request, issuer }
    }

    pub fn from_args(args: &FlowArgs) -> Result<Self, FlowError> {
        let request = IssuanceRequest {
            quantity: args.quantity("quantity")?,
            asset: args.text("asset")?,
            issue_to: args.party("issue_to")?,
            issuer_ref: args.text("issuer_ref")?,
        };
        Ok(Self::new(request, args.party("issuer")?))
    }
}

impl FlowLogic for IssuanceRequester {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError> {
        let session = Session::new(self.issuer.clone(), ISSUANCE_PROTOCOL);
        match event {
            FlowEvent::Start => {
                ctx.send(&session, serde_json::to_value(&self.request)?);
                Ok(FlowStep::Receive(session))
            }
            FlowEvent::Received { payload, .. } => {
                let reply: IssuanceReply = serde_json::from_value(payload)?;
                match reply {
                    IssuanceReply::Success { .. } => Ok(FlowStep::Done(serde_json::to_value(reply)?)),
                    IssuanceReply::Failure { reason } => Err(FlowError::Protocol(format!(
                        "{} refused issuance: {}",
                        self.issuer, reason
                    ))),
                }
            }
        }
    }
}

enum IssuerStage {
    AwaitingRequest,
    Issuing(Finaliser),
    Moving { issue_tx: TxId, finaliser: Finaliser },
}

/// Issues cash to itself, then moves it to the requested party
///
/// Issue and move are two transactions, each committed on its own; the
/// issuer's vault sees the issued state produced and then consumed.
pub struct Issuer {
    requester: Option<Session>,
    request: Option<IssuanceRequest>,
    stage: IssuerStage,
}

impl Issuer {
    pub fn new() -> Self {
        Self {
            requester: None,
            request: None,
            stage: IssuerStage::AwaitingRequest,
        }
    }

    fn notary(&self, ctx: &FlowContext) -> Option<Party> {
        if ctx.notary_service().is_some() {
            Some(ctx.me().clone())
        } else {
            ctx.network().default_notary()
        }
    }

    fn handle_request(
        &mut self,
        ctx: &mut FlowContext,
        session: Session,
        payload: Value,
    ) -> Result<FlowStep, FlowError> {
        let request: IssuanceRequest = serde_json::from_value(payload)?;
        log::info!(
            "{} issuing {} {} to {} (ref {})",
            ctx.me(),
            request.quantity,
            request.asset,
            request.issue_to,
            request.issuer_ref
        );
        self.requester = Some(session.clone());

        let refusal = if request.quantity == 0 {
            Some("quantity must be positive".to_string())
        } else if !ctx.network().contains(&request.issue_to) {
            Some(format!("unknown party {}", request.issue_to))
        } else {
            None
        };
        let notary = self.notary(ctx);
        let (Some(notary), None) = (notary, refusal.clone()) else {
            let reason = refusal.unwrap_or_else(|| "no notary available".to_string());
            ctx.send(&session, serde_json::to_value(IssuanceReply::Failure { reason: reason.clone() })?);
            return Ok(FlowStep::Done(serde_json::to_value(IssuanceReply::Failure { reason })?));
        };

        let tx = TransactionBuilder::new(notary)
            .add_output(ctx.me().clone(), request.asset.clone(), request.quantity)
            .salt(ctx.fresh_salt())
            .build()?;
        self.request = Some(request);

        let mut finaliser = Finaliser::new(tx);
        let progress = finaliser.begin(ctx)?;
        self.stage = IssuerStage::Issuing(finaliser);
        self.advance(ctx, progress)
    }

    fn advance(&mut self, ctx: &mut FlowContext, progress: Progress) -> Result<FlowStep, FlowError> {
        let finalised = match progress {
            Progress::Await(session) => return Ok(FlowStep::Receive(session)),
            Progress::Finalised(tx) => tx,
        };

        match &self.stage {
            IssuerStage::Issuing(_) => {
                let request = self
                    .request
                    .clone()
                    .ok_or_else(|| FlowError::Protocol("issuance without request".to_string()))?;
                let issued = finalised
                    .outputs
                    .first()
                    .cloned()
                    .ok_or_else(|| FlowError::Protocol("issuance produced no state".to_string()))?;

                let move_tx = TransactionBuilder::new(finalised.notary.clone())
                    .add_input(issued)
                    .add_output(request.issue_to, request.asset, request.quantity)
                    .salt(ctx.fresh_salt())
                    .build()?;

                let mut finaliser = Finaliser::new(move_tx);
                let progress = finaliser.begin(ctx)?;
                self.stage = IssuerStage::Moving {
                    issue_tx: finalised.id,
                    finaliser,
                };
                self.advance(ctx, progress)
            }
            IssuerStage::Moving { issue_tx, .. } => {
                let reply = IssuanceReply::Success {
                    issue_tx: *issue_tx,
                    move_tx: finalised.id,
                    issuer_ref: self
                        .request
                        .as_ref()
                        .map(|r| r.issuer_ref.clone())
                        .unwrap_or_default(),
                };
                let requester = self
                    .requester
                    .clone()
                    .ok_or_else(|| FlowError::Protocol("no requester session".to_string()))?;
                let payload = serde_json::to_value(&reply)?;
                ctx.send(&requester, payload.clone());
                Ok(FlowStep::Done(payload))
            }
            IssuerStage::AwaitingRequest => Err(FlowError::Protocol(
                "transaction finalised before any request".to_string(),
            )),
        }
    }
}

impl Default for Issuer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowLogic for Issuer {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError> {
        let FlowEvent::Received { session, payload } = event else {
            return Err(FlowError::Protocol(
                "issuer cannot be started directly".to_string(),
            ));
        };

        let progress = match &mut self.stage {
            IssuerStage::AwaitingRequest => return self.handle_request(ctx, session, payload),
            IssuerStage::Issuing(finaliser) => finaliser.resume(ctx, &session, payload)?,
            IssuerStage::Moving { finaliser, .. } => finaliser.resume(ctx, &session, payload)?,
        };
        self.advance(ctx, progress)
    }
}
