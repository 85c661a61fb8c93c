//! Shared protocol types for the gateway supervisor, registry and CLI.
//!
//! This crate defines the gateway message schema, broker lifecycle events,
//! transport frames and the strongly-typed error enums shared across the
//! workspace.

pub mod error;
pub mod event;
pub mod frame;
pub mod message;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of broker lifecycle event types.
pub use event::{ExchangeEvent, ExchangeEventType, QueueDirection, QueueName};
/// Re-export of the transport frame.
pub use frame::Frame;
/// Re-export of gateway identity and message types.
pub use message::{GatewayId, GatewayStatus, IotMessage};
