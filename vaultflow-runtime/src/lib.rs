//! Flow engine, built-in flows, node event loop and RPC façade

pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod flows;
pub mod messages;
pub mod network_map;
pub mod node;
pub mod notary;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use config::NodeConfig;
pub use engine::{FlowEngine, FlowState, PendingStep, StepCompletion};
pub use error::{FlowError, NodeError, RegistryError, RpcError};
pub use flow::{FlowContext, FlowEvent, FlowHandle, FlowId, FlowLogic, FlowResultFuture, FlowStep, Session};
pub use messages::{FlowMessage, MessageBody};
pub use network_map::NetworkMap;
pub use node::{NodeClient, NodeHandle};
pub use notary::{ConflictResult, NotaryError, UniquenessProvider};
pub use registry::{FlowArgs, FlowRegistry, FlowSignature, ParamKind};
pub use rpc::{start_flow_permission, FlowStarter, RpcServer, RpcSession, RpcUser, ALL_PERMISSIONS};
pub use transport::{InProcessNetwork, MessageTransport};
