//! Built-in flows and their responders

mod cash;
mod finality;
mod issuance;
mod notarise;

pub use cash::{CashIssue, CashPayment};
pub use finality::{FinalityAck, FinalityResponder, NotaryReply};
pub use issuance::{IssuanceReply, IssuanceRequest, IssuanceRequester, Issuer};
pub use notarise::NotaryResponder;

use crate::flow::FlowLogic;
use crate::registry::{FlowRegistry, FlowSignature, ParamKind};

/// Protocol spoken with a notary
pub const NOTARISE_PROTOCOL: &str = "notarise";
/// Protocol used to distribute a finalised transaction
pub const FINALITY_PROTOCOL: &str = "finality";
/// Protocol between an issuance requester and the issuer
pub const ISSUANCE_PROTOCOL: &str = "issuance";

pub const CASH_ISSUE: &str = "CashIssue";
pub const CASH_PAYMENT: &str = "CashPayment";
pub const ISSUANCE_REQUESTER: &str = "IssuanceRequester";

impl FlowRegistry {
    /// A registry holding every built-in flow and responder
    pub fn with_builtin_flows() -> Self {
        let mut registry = FlowRegistry::new();

        registry.insert_initiator(
            FlowSignature::new(CASH_ISSUE)
                .param("quantity", ParamKind::Quantity)
                .param("asset", ParamKind::Text)
                .param("notary", ParamKind::Party),
            |args| Ok(Box::new(CashIssue::from_args(args)?) as Box<dyn FlowLogic>),
        );
        registry.insert_initiator(
            FlowSignature::new(CASH_PAYMENT)
                .param("quantity", ParamKind::Quantity)
                .param("asset", ParamKind::Text)
                .param("recipient", ParamKind::Party)
                .param("notary", ParamKind::Party),
            |args| Ok(Box::new(CashPayment::from_args(args)?) as Box<dyn FlowLogic>),
        );
        registry.insert_initiator(
            FlowSignature::new(ISSUANCE_REQUESTER)
                .param("quantity", ParamKind::Quantity)
                .param("asset", ParamKind::Text)
                .param("issue_to", ParamKind::Party)
                .param("issuer_ref", ParamKind::Text)
                .param("issuer", ParamKind::Party),
            |args| Ok(Box::new(IssuanceRequester::from_args(args)?) as Box<dyn FlowLogic>),
        );

        registry.insert_responder(NOTARISE_PROTOCOL, || Box::new(NotaryResponder));
        registry.insert_responder(FINALITY_PROTOCOL, || Box::new(FinalityResponder));
        registry.insert_responder(ISSUANCE_PROTOCOL, || Box::new(Issuer::new()));

        registry
    }
}
