use crate::rpc::RpcUser;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vaultflow_core::id::Party;
use vaultflow_storage::vault::DEFAULT_SUBSCRIBER_BUFFER;

/// Node configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Party name of the node
    pub name: String,

    /// Whether the node runs a notary service
    pub notary: bool,

    /// Users allowed to connect over RPC
    pub rpc_users: Vec<RpcUser>,

    /// How long a suspended flow may wait for a message
    pub message_timeout_ms: u64,

    /// Capacity of each vault subscriber's buffer
    pub subscriber_buffer: usize,

    /// File backing the vault; in-memory when unset
    pub vault_log_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            notary: false,
            rpc_users: Vec::new(),
            message_timeout_ms: 30_000,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            vault_log_path: None,
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_notary(mut self) -> Self {
        self.notary = true;
        self
    }

    pub fn with_rpc_user(mut self, user: RpcUser) -> Self {
        self.rpc_users.push(user);
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity;
        self
    }

    pub fn with_vault_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.vault_log_path = Some(path.into());
        self
    }

    pub fn party(&self) -> Party {
        Party::new(self.name.clone())
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Load a configuration file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading node config {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing node config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("node name must not be empty");
        }
        if self.message_timeout_ms == 0 {
            anyhow::bail!("message_timeout_ms must be positive");
        }
        if self.subscriber_buffer == 0 {
            anyhow::bail!("subscriber_buffer must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::start_flow_permission;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_json_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "BankOfCorda",
                "notary": true,
                "rpc_users": [
                    {{"username": "user1", "password": "test", "permissions": ["StartFlow.IssuanceRequester"]}}
                ]
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.party(), Party::new("BankOfCorda"));
        assert!(config.notary);
        assert_eq!(config.message_timeout(), Duration::from_secs(30));
        assert_eq!(config.subscriber_buffer, DEFAULT_SUBSCRIBER_BUFFER);
        assert!(config.rpc_users[0]
            .permissions
            .contains(&start_flow_permission("IssuanceRequester")));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "", "subscriber_buffer": 4}}"#).unwrap();
        assert!(NodeConfig::from_json_file(file.path()).is_err());

        let missing = NodeConfig::from_json_file(Path::new("/nonexistent/node.json"));
        let message = format!("{:#}", missing.unwrap_err());
        assert!(message.contains("reading node config"));
    }

    #[test]
    fn test_builder() {
        let config = NodeConfig::new("Corp")
            .with_message_timeout(Duration::from_millis(250))
            .with_subscriber_buffer(8)
            .with_vault_log("/tmp/corp.log");
        assert_eq!(config.message_timeout_ms, 250);
        assert_eq!(config.subscriber_buffer, 8);
        assert_eq!(config.vault_log_path, Some(PathBuf::from("/tmp/corp.log")));
        assert!(config.validate().is_ok());
    }
}
