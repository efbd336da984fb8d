use super::finality::NotaryReply;
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowEvent, FlowLogic, FlowStep};
use crate::notary::NotaryError;
use serde_json::json;
use vaultflow_core::transaction::LedgerTransaction;

/// Answers a notarisation request from the local uniqueness service
pub struct NotaryResponder;

impl FlowLogic for NotaryResponder {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError> {
        let FlowEvent::Received { session, payload } = event else {
            return Err(FlowError::Protocol(
                "notary responder cannot be started directly".to_string(),
            ));
        };

        let tx: LedgerTransaction = serde_json::from_value(payload)?;
        let outcome = match ctx.notary_service() {
            Some(service) => service.commit(&tx),
            None => Err(NotaryError::Invalid(
                tx.id,
                format!("{} is not a notary", ctx.me()),
            )),
        };
        let signed = outcome.is_ok();

        ctx.send(&session, serde_json::to_value(NotaryReply::from(outcome))?);
        Ok(FlowStep::Done(json!({
            "tx": tx.id.to_hex(),
            "signed": signed,
        })))
    }
}
