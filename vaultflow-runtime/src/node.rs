use crate::config::NodeConfig;
use crate::engine::{FlowEngine, StepCompletion};
use crate::error::{FlowError, NodeError};
use crate::flow::{FlowHandle, FlowId};
use crate::messages::FlowMessage;
use crate::network_map::NetworkMap;
use crate::notary::UniquenessProvider;
use crate::registry::FlowRegistry;
use crate::rpc::{FlowStarter, RpcServer};
use crate::transport::{InProcessNetwork, MessageTransport};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vaultflow_core::id::Party;
use vaultflow_storage::store::{MemoryVaultStore, VaultStore};
use vaultflow_storage::transactions::TransactionStorage;
use vaultflow_storage::vault::Vault;
use vaultflow_storage::wal::FileVaultLog;

enum Completion {
    Step(StepCompletion),
    Lost(FlowId),
}

fn lock(engine: &Mutex<FlowEngine>) -> MutexGuard<'_, FlowEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable client of a running node, used by the RPC façade
#[derive(Clone)]
pub struct NodeClient {
    engine: Arc<Mutex<FlowEngine>>,
    wake: Arc<Notify>,
}

impl FlowStarter for NodeClient {
    fn start_flow(&self, flow_type: &str, args: Vec<Value>) -> Result<FlowHandle, FlowError> {
        let handle = lock(&self.engine).start_flow(flow_type, args)?;
        self.wake.notify_one();
        Ok(handle)
    }

    fn vault(&self) -> Arc<Vault> {
        lock(&self.engine).vault()
    }

    fn transactions(&self) -> Arc<dyn TransactionStorage> {
        lock(&self.engine).transactions()
    }

    fn identity(&self) -> Party {
        lock(&self.engine).me().clone()
    }
}

/// A node running its event loop on the tokio runtime
///
/// The loop owns delivery and scheduling. Each flow step runs on the blocking
/// pool and reports back over a channel; suspended flows hold no worker.
pub struct NodeHandle {
    config: NodeConfig,
    client: NodeClient,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// Start a node attached to an in-process network
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_in_process(
        config: NodeConfig,
        registry: Arc<FlowRegistry>,
        network: NetworkMap,
        transport: Arc<InProcessNetwork>,
    ) -> Result<Self, NodeError> {
        let inbound = transport.register(config.party());
        Self::spawn(config, registry, network, transport, inbound)
    }

    /// Start a node
    ///
    /// # Parameters
    /// * `config` - Node configuration
    /// * `registry` - Flows this node can start and respond to
    /// * `network` - Shared network map; the node registers itself
    /// * `transport` - Outbound message delivery
    /// * `inbound` - Messages addressed to this node
    ///
    /// # Returns
    /// A handle to the running node
    pub fn spawn(
        config: NodeConfig,
        registry: Arc<FlowRegistry>,
        network: NetworkMap,
        transport: Arc<dyn MessageTransport>,
        inbound: mpsc::UnboundedReceiver<FlowMessage>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let party = config.party();

        let store: Arc<dyn VaultStore> = match &config.vault_log_path {
            Some(path) => Arc::new(FileVaultLog::open(path)?),
            None => Arc::new(MemoryVaultStore::new()),
        };
        let vault = Arc::new(Vault::open(party.clone(), store, config.subscriber_buffer)?);

        network.register(party.clone(), config.notary);
        let mut engine = FlowEngine::new(party.clone(), vault, registry, network);
        if config.notary {
            engine = engine.with_notary_service(Arc::new(UniquenessProvider::new()));
        }

        let client = NodeClient {
            engine: Arc::new(Mutex::new(engine)),
            wake: Arc::new(Notify::new()),
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_event_loop(
            client.clone(),
            transport,
            inbound,
            shutdown_rx,
            config.message_timeout(),
        ));

        log::info!("Node {} started (notary: {})", party, config.notary);
        Ok(Self {
            config,
            client,
            shutdown,
            task,
        })
    }

    pub fn party(&self) -> Party {
        self.config.party()
    }

    pub fn vault(&self) -> Arc<Vault> {
        self.client.vault()
    }

    pub fn client(&self) -> NodeClient {
        self.client.clone()
    }

    /// RPC façade for this node's configured users
    pub fn rpc(&self) -> RpcServer<NodeClient> {
        RpcServer::new(self.client.clone(), self.config.rpc_users.clone())
    }

    /// Cancel a flow that has not committed yet
    pub fn cancel(&self, flow_id: FlowId) -> Result<(), FlowError> {
        let result = lock(&self.client.engine).cancel(flow_id);
        self.client.wake.notify_one();
        result
    }

    /// Stop the event loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Node {} event loop ended abnormally: {}", self.config.name, e);
        }
        log::info!("Node {} stopped", self.config.name);
    }
}

async fn run_event_loop(
    client: NodeClient,
    transport: Arc<dyn MessageTransport>,
    mut inbound: mpsc::UnboundedReceiver<FlowMessage>,
    mut shutdown: watch::Receiver<bool>,
    timeout: Duration,
) {
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
    let mut ticker = tokio::time::interval((timeout / 4).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        dispatch_steps(&client.engine, &completion_tx);
        flush_outbox(&client.engine, transport.as_ref());

        tokio::select! {
            message = inbound.recv() => {
                match message {
                    Some(message) => {
                        lock(&client.engine).deliver(message);
                    }
                    None => {
                        log::debug!("Inbound queue closed, stopping event loop");
                        break;
                    }
                }
            }
            Some(completion) = completion_rx.recv() => {
                match completion {
                    Completion::Step(completion) => {
                        lock(&client.engine).finish_step(completion);
                    }
                    Completion::Lost(flow_id) => {
                        lock(&client.engine)
                            .abort(flow_id, FlowError::Protocol("flow step panicked".to_string()));
                    }
                }
            }
            _ = client.wake.notified() => {}
            _ = ticker.tick() => {
                let expired = lock(&client.engine).expire_waits(Instant::now(), timeout);
                if !expired.is_empty() {
                    log::warn!("{} flows timed out waiting for messages", expired.len());
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    lock(&client.engine).stop();
    flush_outbox(&client.engine, transport.as_ref());
}

fn dispatch_steps(engine: &Mutex<FlowEngine>, completions: &mpsc::UnboundedSender<Completion>) {
    loop {
        let Some(step) = lock(engine).begin_step() else {
            break;
        };
        let flow_id = step.flow_id();
        let completions = completions.clone();
        tokio::spawn(async move {
            let completion = match tokio::task::spawn_blocking(move || step.run()).await {
                Ok(completion) => Completion::Step(completion),
                Err(e) => {
                    log::error!("Step of {} did not complete: {}", flow_id, e);
                    Completion::Lost(flow_id)
                }
            };
            if completions.send(completion).is_err() {
                log::debug!("Event loop gone, discarding step of {}", flow_id);
            }
        });
    }
}

fn flush_outbox(engine: &Mutex<FlowEngine>, transport: &dyn MessageTransport) {
    let outbox = lock(engine).drain_outbox();
    for message in outbox {
        let recipient = message.recipient.clone();
        if let Err(e) = transport.send(message) {
            log::warn!("Dropping message to {}: {}", recipient, e);
        }
    }
}
