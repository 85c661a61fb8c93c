//! Broker-facing seams: connection, management events and per-gateway
//! transport pairs.
//!
//! Concrete backends live in [`crate::amqp`] (RabbitMQ) and
//! [`crate::memory`] (in-process).

use std::sync::Arc;

use async_trait::async_trait;
use proto::{BrokerError, ExchangeEvent, Frame, GatewayId, TransportError};

/// Reading half of a gateway transport: yields inbound frames.
#[async_trait]
pub trait FrameReader: Send {
    /// Receives the next inbound frame.
    ///
    /// `Ok(None)` means the queue is gone and no further frames will arrive.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Stops consuming. Calling it more than once is harmless.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Writing half of a gateway transport: publishes outbound frames.
#[async_trait]
pub trait FrameWriter: Send + Sync {
    /// Publishes one frame to the gateway.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Stops publishing. Calling it more than once is harmless.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Both directions of one gateway's broker queues.
pub struct TransportPair {
    pub reader: Box<dyn FrameReader>,
    pub writer: Arc<dyn FrameWriter>,
}

/// Stream of notifications from the broker's management exchange.
#[async_trait]
pub trait EventStream: Send {
    /// Next notification; `None` once the broker closed the subscription.
    async fn next_event(&mut self) -> Option<Result<ExchangeEvent, BrokerError>>;
}

/// An open broker connection plus its management channel.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Declares the private monitor queue, binds it to the management
    /// exchange and starts consuming lifecycle notifications.
    async fn subscribe_events(&self, queue: &str) -> Result<Box<dyn EventStream>, BrokerError>;

    /// Opens the transport pair bound to `gateway`'s queues.
    async fn open_transport(
        &self,
        server_id: &str,
        gateway: &GatewayId,
    ) -> Result<TransportPair, BrokerError>;

    /// Deletes a queue owned by this server.
    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Closes the management channel.
    async fn close_channel(&self) -> Result<(), BrokerError>;

    /// Closes the underlying connection.
    async fn close_connection(&self) -> Result<(), BrokerError>;
}

/// Dials a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `url` and opens a management channel.
    ///
    /// Fails with [`BrokerError::Connection`] when dialing fails and with
    /// [`BrokerError::Channel`] when the channel cannot be opened.
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerLink>, BrokerError>;
}
