use crate::engine::FlowEngine;
use crate::error::{FlowError, RpcError};
use crate::flow::{FlowHandle, FlowResultFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use vaultflow_core::id::{Party, TxId};
use vaultflow_core::states::StateObject;
use vaultflow_core::transaction::LedgerTransaction;
use vaultflow_storage::subscription::VaultUpdates;
use vaultflow_storage::transactions::TransactionStorage;
use vaultflow_storage::vault::Vault;

/// Grants every permission
pub const ALL_PERMISSIONS: &str = "ALL";

/// Permission required to start `flow_type`
pub fn start_flow_permission(flow_type: &str) -> String {
    format!("StartFlow.{}", flow_type)
}

/// A user allowed to connect over RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl RpcUser {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }
}

/// An authenticated identity and its permission set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSession {
    username: Option<String>,
    permissions: BTreeSet<String>,
}

impl RpcSession {
    /// A caller that never logged in
    pub fn anonymous() -> Self {
        Self {
            username: None,
            permissions: BTreeSet::new(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_authenticated()
            && (self.permissions.contains(ALL_PERMISSIONS) || self.permissions.contains(permission))
    }
}

/// What the RPC façade needs from a node
pub trait FlowStarter: Send + Sync {
    fn start_flow(&self, flow_type: &str, args: Vec<Value>) -> Result<FlowHandle, FlowError>;

    fn vault(&self) -> Arc<Vault>;

    fn transactions(&self) -> Arc<dyn TransactionStorage>;

    fn identity(&self) -> Party;
}

impl FlowStarter for Arc<Mutex<FlowEngine>> {
    fn start_flow(&self, flow_type: &str, args: Vec<Value>) -> Result<FlowHandle, FlowError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start_flow(flow_type, args)
    }

    fn vault(&self) -> Arc<Vault> {
        self.lock().unwrap_or_else(PoisonError::into_inner).vault()
    }

    fn transactions(&self) -> Arc<dyn TransactionStorage> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .transactions()
    }

    fn identity(&self) -> Party {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .me()
            .clone()
    }
}

/// Boundary used by remote clients
///
/// Every call either returns immediately or fails synchronously with an
/// `RpcError`; flow failures only surface through the returned future.
pub struct RpcServer<N: FlowStarter> {
    users: HashMap<String, RpcUser>,
    node: N,
}

impl<N: FlowStarter> RpcServer<N> {
    pub fn new(node: N, users: impl IntoIterator<Item = RpcUser>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
            node,
        }
    }

    /// Authenticate a user
    ///
    /// # Returns
    /// A session carrying the user's permissions, or PermissionDenied
    pub fn login(&self, username: &str, password: &str) -> Result<RpcSession, RpcError> {
        match self.users.get(username) {
            Some(user) if user.password == password => {
                log::info!("RPC user {} logged in to {}", username, self.node.identity());
                Ok(RpcSession {
                    username: Some(user.username.clone()),
                    permissions: user.permissions.clone(),
                })
            }
            _ => {
                log::warn!("RPC login failed for {}", username);
                Err(RpcError::PermissionDenied(format!(
                    "invalid credentials for {}",
                    username
                )))
            }
        }
    }

    /// Start a flow on behalf of `session`
    ///
    /// # Parameters
    /// * `session` - Must hold `StartFlow.<flow_type>` or `ALL`
    /// * `flow_type` - Registered flow type name
    /// * `args` - Positional arguments
    ///
    /// # Returns
    /// The flow's unset result future; nothing runs on error
    pub fn start_flow(
        &self,
        session: &RpcSession,
        flow_type: &str,
        args: Vec<Value>,
    ) -> Result<FlowResultFuture, RpcError> {
        let permission = start_flow_permission(flow_type);
        if !session.has_permission(&permission) {
            log::warn!(
                "RPC user {} denied {}",
                session.username().unwrap_or("<anonymous>"),
                permission
            );
            return Err(RpcError::PermissionDenied(permission));
        }

        let handle = self.node.start_flow(flow_type, args)?;
        Ok(handle.result)
    }

    /// Snapshot of the vault and a subscription to every later update
    ///
    /// Does not wait for other subscribers to drain, so it is safe to call
    /// from an async task. A caller that stops reading its feed eventually
    /// stalls the node's vault writes.
    pub fn vault_and_updates(
        &self,
        session: &RpcSession,
    ) -> Result<(Vec<StateObject>, VaultUpdates), RpcError> {
        self.require_login(session)?;
        Ok(self.node.vault().snapshot_and_subscribe())
    }

    /// Look up a recorded transaction
    pub fn transaction(
        &self,
        session: &RpcSession,
        id: &TxId,
    ) -> Result<Option<LedgerTransaction>, RpcError> {
        self.require_login(session)?;
        self.node
            .transactions()
            .get_transaction(id)
            .map_err(|e| RpcError::Unavailable(e.to_string()))
    }

    pub fn node_identity(&self, session: &RpcSession) -> Result<Party, RpcError> {
        self.require_login(session)?;
        Ok(self.node.identity())
    }

    fn require_login(&self, session: &RpcSession) -> Result<(), RpcError> {
        if session.is_authenticated() {
            Ok(())
        } else {
            Err(RpcError::PermissionDenied("not logged in".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_map::NetworkMap;
    use crate::registry::FlowRegistry;
    use serde_json::json;

    fn server() -> (RpcServer<Arc<Mutex<FlowEngine>>>, Arc<Mutex<FlowEngine>>) {
        let network = NetworkMap::new();
        let me = Party::new("Bank");
        network.register(me.clone(), true);
        let engine = Arc::new(Mutex::new(FlowEngine::new(
            me.clone(),
            Arc::new(Vault::new(me)),
            Arc::new(FlowRegistry::with_builtin_flows()),
            network,
        )));

        let users = vec![
            RpcUser::new("issuer", "secret").with_permission(start_flow_permission("CashIssue")),
            RpcUser::new("reader", "secret"),
            RpcUser::new("admin", "secret").with_permission(ALL_PERMISSIONS),
        ];
        (RpcServer::new(Arc::clone(&engine), users), engine)
    }

    #[test]
    fn test_login() {
        let (server, _) = server();
        assert!(server.login("issuer", "secret").is_ok());
        assert!(matches!(
            server.login("issuer", "wrong"),
            Err(RpcError::PermissionDenied(_))
        ));
        assert!(matches!(
            server.login("nobody", "secret"),
            Err(RpcError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_permission_denied_starts_nothing() {
        let (server, engine) = server();
        let reader = server.login("reader", "secret").unwrap();
        let (_, mut updates) = server.vault_and_updates(&reader).unwrap();

        let result = server.start_flow(&reader, "CashIssue", vec![json!(10), json!("USD"), json!("Bank")]);
        assert_eq!(
            result.err(),
            Some(RpcError::PermissionDenied("StartFlow.CashIssue".to_string()))
        );

        let anonymous = RpcSession::anonymous();
        assert!(matches!(
            server.start_flow(&anonymous, "CashIssue", vec![]),
            Err(RpcError::PermissionDenied(_))
        ));
        assert!(matches!(
            server.vault_and_updates(&anonymous),
            Err(RpcError::PermissionDenied(_))
        ));

        let mut engine = engine.lock().unwrap();
        assert_eq!(engine.live_flows(), 0);
        assert!(engine.run_next().is_none());
        assert!(updates.try_next_update().is_none());
    }

    #[test]
    fn test_invalid_arguments_are_reported_synchronously() {
        let (server, engine) = server();
        let issuer = server.login("issuer", "secret").unwrap();

        assert!(matches!(
            server.start_flow(&issuer, "CashIssue", vec![json!("ten")]),
            Err(RpcError::InvalidArguments(_))
        ));
        assert!(matches!(
            server.start_flow(&issuer, "CashIssue", vec![json!(10), json!("USD"), json!("Nowhere")]),
            Err(RpcError::InvalidArguments(_))
        ));

        let admin = server.login("admin", "secret").unwrap();
        assert!(matches!(
            server.start_flow(&admin, "Missing", vec![]),
            Err(RpcError::UnknownFlow(_))
        ));
        assert_eq!(engine.lock().unwrap().live_flows(), 0);
    }

    #[test]
    fn test_permitted_flow_runs_and_updates_stream() {
        let (server, engine) = server();
        let issuer = server.login("issuer", "secret").unwrap();
        let (snapshot, mut updates) = server.vault_and_updates(&issuer).unwrap();
        assert!(snapshot.is_empty());

        let result = server
            .start_flow(&issuer, "CashIssue", vec![json!(10), json!("USD"), json!("Bank")])
            .unwrap();
        assert!(!result.is_done());

        while engine.lock().unwrap().run_next().is_some() {}

        let payload = result.try_get().unwrap().unwrap();
        let update = updates.try_next_update().unwrap();
        assert_eq!(update.sizes(), (0, 1));

        let tx_id = TxId::from_hex(payload["tx"].as_str().unwrap()).unwrap();
        let recorded = server.transaction(&issuer, &tx_id).unwrap().unwrap();
        assert_eq!(recorded.outputs, update.produced);
        assert_eq!(server.node_identity(&issuer).unwrap(), Party::new("Bank"));
    }
}
