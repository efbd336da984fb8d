use super::finality::{Finaliser, Progress};
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowEvent, FlowLogic, FlowStep};
use crate::registry::FlowArgs;
use serde_json::{json, Value};
use vaultflow_core::id::Party;
use vaultflow_core::transaction::{LedgerTransaction, TransactionBuilder};

fn summary(tx: &LedgerTransaction) -> Value {
    json!({
        "tx": tx.id.to_hex(),
        "outputs": tx.outputs.iter().map(|s| s.state_ref.to_string()).collect::<Vec<_>>(),
    })
}

fn advance(
    finaliser: &mut Option<Finaliser>,
    ctx: &mut FlowContext,
    event: FlowEvent,
) -> Result<Progress, FlowError> {
    match (finaliser.as_mut(), event) {
        (Some(finaliser), FlowEvent::Received { session, payload }) => {
            finaliser.resume(ctx, &session, payload)
        }
        _ => Err(FlowError::Protocol("flow was not started".to_string())),
    }
}

/// Issue cash to this node
pub struct CashIssue {
    quantity: u64,
    asset: String,
    notary: Party,
    finaliser: Option<Finaliser>,
}

impl CashIssue {
    pub fn new(quantity: u64, asset: impl Into<String>, notary: Party) -> Self {
        Self {
            quantity,
            asset: asset.into(),
            notary,
            finaliser: None,
        }
    }

    pub fn from_args(args: &FlowArgs) -> Result<Self, FlowError> {
        Ok(Self::new(
            args.quantity("quantity")?,
            args.text("asset")?,
            args.party("notary")?,
        ))
    }
}

impl FlowLogic for CashIssue {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError> {
        let progress = match event {
            FlowEvent::Start => {
                let tx = TransactionBuilder::new(self.notary.clone())
                    .add_output(ctx.me().clone(), self.asset.clone(), self.quantity)
                    .salt(ctx.fresh_salt())
                    .build()?;
                let finaliser = self.finaliser.insert(Finaliser::new(tx));
                finaliser.begin(ctx)?
            }
            event => advance(&mut self.finaliser, ctx, event)?,
        };
        progress.into_step(|tx| Ok(FlowStep::Done(summary(&tx))))
    }
}

/// Pay cash from this node's vault to a recipient, returning change to self
pub struct CashPayment {
    quantity: u64,
    asset: String,
    recipient: Party,
    notary: Party,
    finaliser: Option<Finaliser>,
}

impl CashPayment {
    pub fn new(quantity: u64, asset: impl Into<String>, recipient: Party, notary: Party) -> Self {
        Self {
            quantity,
            asset: asset.into(),
            recipient,
            notary,
            finaliser: None,
        }
    }

    pub fn from_args(args: &FlowArgs) -> Result<Self, FlowError> {
        Ok(Self::new(
            args.quantity("quantity")?,
            args.text("asset")?,
            args.party("recipient")?,
            args.party("notary")?,
        ))
    }

    // Smallest prefix of owned states, ordered by identity, covering the amount
    fn select_coins(&self, ctx: &mut FlowContext) -> Result<LedgerTransaction, FlowError> {
        let me = ctx.me().clone();
        let candidates = ctx
            .vault()
            .query(|state| state.is_owned_by(&me) && state.asset == self.asset);

        let mut builder = TransactionBuilder::new(self.notary.clone());
        let mut gathered: u64 = 0;
        for state in candidates {
            if gathered >= self.quantity {
                break;
            }
            gathered = gathered.saturating_add(state.quantity);
            builder = builder.add_input(state);
        }

        if gathered < self.quantity {
            return Err(FlowError::InsufficientFunds {
                asset: self.asset.clone(),
                requested: self.quantity,
                available: gathered,
            });
        }

        builder = builder.add_output(self.recipient.clone(), self.asset.clone(), self.quantity);
        if gathered > self.quantity {
            builder = builder.add_output(me, self.asset.clone(), gathered - self.quantity);
        }
        Ok(builder.salt(ctx.fresh_salt()).build()?)
    }
}

impl FlowLogic for CashPayment {
    fn on_event(&mut self, ctx: &mut FlowContext, event: FlowEvent) -> Result<FlowStep, FlowError> {
        let progress = match event {
            FlowEvent::Start => {
                let tx = self.select_coins(ctx)?;
                let finaliser = self.finaliser.insert(Finaliser::new(tx));
                finaliser.begin(ctx)?
            }
            event => advance(&mut self.finaliser, ctx, event)?,
        };
        progress.into_step(|tx| Ok(FlowStep::Done(summary(&tx))))
    }
}
