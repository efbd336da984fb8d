use crate::error::{FlowError, RegistryError};
use crate::flow::FlowLogic;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use vaultflow_core::id::Party;

/// Shape of a single flow parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Positive integer amount
    Quantity,
    /// Name of a party on the network
    Party,
    /// Free-form string
    Text,
    Bool,
}

/// Declared parameters of an initiating flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSignature {
    pub flow_type: String,
    pub params: Vec<(String, ParamKind)>,
}

impl FlowSignature {
    pub fn new(flow_type: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push((name.into(), kind));
        self
    }

    /// Check positional arguments against the declared parameters
    ///
    /// # Parameters
    /// * `args` - Positional JSON arguments
    ///
    /// # Returns
    /// The arguments keyed by parameter name, or InvalidArguments describing the first mismatch
    pub fn validate(&self, args: &[Value]) -> Result<FlowArgs, FlowError> {
        if args.len() != self.params.len() {
            return Err(FlowError::InvalidArguments(format!(
                "{} expects {} arguments, got {}",
                self.flow_type,
                self.params.len(),
                args.len()
            )));
        }

        let mut values = Vec::with_capacity(args.len());
        for ((name, kind), arg) in self.params.iter().zip(args) {
            let valid = match kind {
                ParamKind::Quantity => arg.as_u64().map_or(false, |q| q > 0),
                ParamKind::Party => arg.as_str().map_or(false, |s| !s.is_empty()),
                ParamKind::Text => arg.is_string(),
                ParamKind::Bool => arg.is_boolean(),
            };
            if !valid {
                return Err(FlowError::InvalidArguments(format!(
                    "{}: argument `{}` must be {}, got {}",
                    self.flow_type,
                    name,
                    describe(*kind),
                    arg
                )));
            }
            values.push((name.clone(), *kind, arg.clone()));
        }

        Ok(FlowArgs { values })
    }
}

fn describe(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::Quantity => "a positive integer",
        ParamKind::Party => "a party name",
        ParamKind::Text => "a string",
        ParamKind::Bool => "a boolean",
    }
}

/// Validated arguments of a flow start request
#[derive(Debug, Clone, PartialEq)]
pub struct FlowArgs {
    values: Vec<(String, ParamKind, Value)>,
}

impl FlowArgs {
    fn get(&self, name: &str) -> Result<&Value, FlowError> {
        self.values
            .iter()
            .find(|(param, _, _)| param == name)
            .map(|(_, _, value)| value)
            .ok_or_else(|| FlowError::InvalidArguments(format!("missing argument `{}`", name)))
    }

    pub fn quantity(&self, name: &str) -> Result<u64, FlowError> {
        self.get(name)?
            .as_u64()
            .ok_or_else(|| FlowError::InvalidArguments(format!("`{}` is not a quantity", name)))
    }

    pub fn party(&self, name: &str) -> Result<Party, FlowError> {
        self.text(name).map(Party::new)
    }

    pub fn text(&self, name: &str) -> Result<String, FlowError> {
        self.get(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FlowError::InvalidArguments(format!("`{}` is not a string", name)))
    }

    pub fn flag(&self, name: &str) -> Result<bool, FlowError> {
        self.get(name)?
            .as_bool()
            .ok_or_else(|| FlowError::InvalidArguments(format!("`{}` is not a boolean", name)))
    }

    /// Every party-typed argument
    pub fn parties(&self) -> Vec<Party> {
        self.values
            .iter()
            .filter(|(_, kind, _)| *kind == ParamKind::Party)
            .filter_map(|(_, _, value)| value.as_str().map(Party::new))
            .collect()
    }
}

pub type InitiatorFactory =
    Arc<dyn Fn(&FlowArgs) -> Result<Box<dyn FlowLogic>, FlowError> + Send + Sync>;
pub type ResponderFactory = Arc<dyn Fn() -> Box<dyn FlowLogic> + Send + Sync>;

/// Maps flow types to their signatures and factories, and protocols to responders
#[derive(Default, Clone)]
pub struct FlowRegistry {
    initiators: HashMap<String, (FlowSignature, InitiatorFactory)>,
    responders: HashMap<String, ResponderFactory>,
}

impl FlowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initiating flow
    ///
    /// # Arguments
    /// * `signature` - Flow type name and declared parameters
    /// * `factory` - Builds the flow from validated arguments
    ///
    /// # Returns
    /// * `Ok(())` if registration was successful
    /// * `Err(RegistryError)` if the flow type is already registered
    pub fn register_initiator<F>(
        &mut self,
        signature: FlowSignature,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&FlowArgs) -> Result<Box<dyn FlowLogic>, FlowError> + Send + Sync + 'static,
    {
        if self.initiators.contains_key(&signature.flow_type) {
            return Err(RegistryError::AlreadyRegistered(format!(
                "flow '{}'",
                signature.flow_type
            )));
        }
        self.insert_initiator(signature, factory);
        Ok(())
    }

    /// Register the responder created when a session on `protocol` is initiated
    pub fn register_responder<F>(&mut self, protocol: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn FlowLogic> + Send + Sync + 'static,
    {
        if self.responders.contains_key(protocol) {
            return Err(RegistryError::AlreadyRegistered(format!(
                "responder for '{}'",
                protocol
            )));
        }
        self.insert_responder(protocol, factory);
        Ok(())
    }

    pub(crate) fn insert_initiator<F>(&mut self, signature: FlowSignature, factory: F)
    where
        F: Fn(&FlowArgs) -> Result<Box<dyn FlowLogic>, FlowError> + Send + Sync + 'static,
    {
        self.initiators
            .insert(signature.flow_type.clone(), (signature, Arc::new(factory)));
    }

    pub(crate) fn insert_responder<F>(&mut self, protocol: &str, factory: F)
    where
        F: Fn() -> Box<dyn FlowLogic> + Send + Sync + 'static,
    {
        self.responders.insert(protocol.to_string(), Arc::new(factory));
    }

    pub fn signature(&self, flow_type: &str) -> Option<&FlowSignature> {
        self.initiators.get(flow_type).map(|(signature, _)| signature)
    }

    /// Registered flow types, sorted
    pub fn flow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.initiators.keys().cloned().collect();
        types.sort();
        types
    }

    /// Validate `args` and build the flow
    pub fn instantiate(
        &self,
        flow_type: &str,
        args: &[Value],
    ) -> Result<(FlowArgs, Box<dyn FlowLogic>), FlowError> {
        let (signature, factory) = self
            .initiators
            .get(flow_type)
            .ok_or_else(|| FlowError::UnknownFlow(flow_type.to_string()))?;
        let validated = signature.validate(args)?;
        let logic = factory(&validated)?;
        Ok((validated, logic))
    }

    /// Build the responder for `protocol`, if one is registered
    pub fn responder(&self, protocol: &str) -> Option<Box<dyn FlowLogic>> {
        self.responders.get(protocol).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowContext, FlowEvent, FlowStep};
    use serde_json::json;

    struct Noop;

    impl FlowLogic for Noop {
        fn on_event(&mut self, _ctx: &mut FlowContext, _event: FlowEvent) -> Result<FlowStep, FlowError> {
            Ok(FlowStep::Done(Value::Null))
        }
    }

    fn payment_signature() -> FlowSignature {
        FlowSignature::new("Pay")
            .param("quantity", ParamKind::Quantity)
            .param("recipient", ParamKind::Party)
            .param("memo", ParamKind::Text)
            .param("urgent", ParamKind::Bool)
    }

    #[test]
    fn test_validate_arguments() {
        let signature = payment_signature();
        let args = signature
            .validate(&[json!(10), json!("Corp"), json!("rent"), json!(true)])
            .unwrap();
        assert_eq!(args.quantity("quantity").unwrap(), 10);
        assert_eq!(args.party("recipient").unwrap(), Party::new("Corp"));
        assert_eq!(args.text("memo").unwrap(), "rent");
        assert!(args.flag("urgent").unwrap());
        assert_eq!(args.parties(), vec![Party::new("Corp")]);

        // Wrong arity
        assert!(matches!(
            signature.validate(&[json!(10)]),
            Err(FlowError::InvalidArguments(_))
        ));
        // Zero and negative quantities
        for bad in [json!(0), json!(-5), json!("10")] {
            assert!(matches!(
                signature.validate(&[bad, json!("Corp"), json!(""), json!(false)]),
                Err(FlowError::InvalidArguments(_))
            ));
        }
        // Empty party name
        assert!(matches!(
            signature.validate(&[json!(1), json!(""), json!(""), json!(false)]),
            Err(FlowError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_registration_and_lookup() {
        let mut registry = FlowRegistry::new();
        registry
            .register_initiator(payment_signature(), |_| Ok(Box::new(Noop) as Box<dyn FlowLogic>))
            .unwrap();
        registry
            .register_responder("pay", || Box::new(Noop) as Box<dyn FlowLogic>)
            .unwrap();

        assert_eq!(
            registry.register_initiator(payment_signature(), |_| Ok(Box::new(Noop) as Box<dyn FlowLogic>)),
            Err(RegistryError::AlreadyRegistered("flow 'Pay'".to_string()))
        );
        assert!(registry
            .register_responder("pay", || Box::new(Noop) as Box<dyn FlowLogic>)
            .is_err());

        assert_eq!(registry.flow_types(), vec!["Pay".to_string()]);
        assert!(registry.responder("pay").is_some());
        assert!(registry.responder("other").is_none());

        assert!(matches!(
            registry.instantiate("Missing", &[]),
            Err(FlowError::UnknownFlow(_))
        ));
        assert!(registry
            .instantiate("Pay", &[json!(1), json!("Corp"), json!("x"), json!(false)])
            .is_ok());
    }
}
