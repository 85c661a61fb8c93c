//! Broker management notifications about per-gateway queues.

use serde::{Deserialize, Serialize};

use crate::message::GatewayId;

/// Routing key the broker uses when a queue is declared.
pub const QUEUE_CREATED: &str = "queue.created";
/// Routing key the broker uses when a queue is deleted.
pub const QUEUE_DELETED: &str = "queue.deleted";

/// Kind of lifecycle notification, derived from the routing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeEventType {
    Created,
    Deleted,
    /// Any other routing key (bindings, consumers, ...); never actionable.
    Other(String),
}

impl ExchangeEventType {
    /// Maps a management exchange routing key onto an event type.
    pub fn from_routing_key(key: &str) -> Self {
        match key {
            QUEUE_CREATED => ExchangeEventType::Created,
            QUEUE_DELETED => ExchangeEventType::Deleted,
            other => ExchangeEventType::Other(other.to_string()),
        }
    }

    /// Routing key this event type is published under.
    pub fn routing_key(&self) -> &str {
        match self {
            ExchangeEventType::Created => QUEUE_CREATED,
            ExchangeEventType::Deleted => QUEUE_DELETED,
            ExchangeEventType::Other(key) => key,
        }
    }
}

/// Direction suffix of a gateway queue name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueDirection {
    /// Gateway → server.
    In,
    /// Server → gateway.
    Out,
    Other(String),
}

/// Gateway queue name of the form `<gatewayId>.<direction>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueName {
    pub gateway_id: GatewayId,
    pub direction: QueueDirection,
}

impl QueueName {
    /// Parses a queue name; returns `None` when it does not follow the
    /// `<gatewayId>.<direction>` convention.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split('.');
        let gateway = parts.next().filter(|s| !s.is_empty())?;
        let direction = match parts.next()? {
            "in" => QueueDirection::In,
            "out" => QueueDirection::Out,
            "" => return None,
            other => QueueDirection::Other(other.to_string()),
        };
        Some(Self {
            gateway_id: GatewayId::from(gateway),
            direction,
        })
    }
}

/// A single notification read from the management exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    pub event_type: ExchangeEventType,
    pub queue_name: String,
}

impl ExchangeEvent {
    /// Builds an event from the delivery routing key and `name` header.
    pub fn new(routing_key: &str, queue_name: impl Into<String>) -> Self {
        Self {
            event_type: ExchangeEventType::from_routing_key(routing_key),
            queue_name: queue_name.into(),
        }
    }

    /// Convenience constructor for a `queue.created` event.
    pub fn created(queue_name: impl Into<String>) -> Self {
        Self::new(QUEUE_CREATED, queue_name)
    }

    /// Convenience constructor for a `queue.deleted` event.
    pub fn deleted(queue_name: impl Into<String>) -> Self {
        Self::new(QUEUE_DELETED, queue_name)
    }

    /// Gateway this event attaches or detaches.
    ///
    /// Only created/deleted events about a gateway's inbound queue are
    /// actionable; everything else yields `None`.
    pub fn target(&self) -> Option<GatewayId> {
        if matches!(self.event_type, ExchangeEventType::Other(_)) {
            return None;
        }
        let queue = QueueName::parse(&self.queue_name)?;
        (queue.direction == QueueDirection::In).then_some(queue.gateway_id)
    }
}

impl std::fmt::Display for ExchangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.event_type.routing_key(), self.queue_name)
    }
}
