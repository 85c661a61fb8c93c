//! Gateway session supervisor: broker lifecycle monitor, per-gateway sessions
//! and RPC over the broker.

pub mod amqp;
pub mod directory;
pub mod logic;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod transport;

/// RabbitMQ backend.
pub use amqp::{AmqpConnector, AmqpLink};
/// Persistent registry seam.
pub use directory::GatewayDirectory;
/// Business logic attached to sessions.
pub use logic::{Logic, LogicContext, LogicFactory, StatusLogic, StatusLogicFactory};
/// Broker manager and its connection settings.
pub use manager::{BrokerManager, BrokerSettings};
/// In-process broker and registry for tests and local runs.
pub use memory::{DeviceHandle, MemoryBroker, MemoryDirectory, TeardownStep};
/// Live session registry.
pub use registry::SessionRegistry;
/// Per-gateway session.
pub use session::{GatewaySession, Session, SessionConfig, SessionDeps, SessionExit};
/// Broker transport seams.
pub use transport::{BrokerLink, Connector, EventStream, FrameReader, FrameWriter, TransportPair};
