//! Gateway-specific business logic attached lazily to a session.

use std::sync::Arc;

use async_trait::async_trait;
use proto::{GatewayId, IotMessage, LogicError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::directory::GatewayDirectory;

/// Everything a logic instance gets from its owning session.
#[derive(Clone)]
pub struct LogicContext {
    /// Session scope; cancelled when the session stops.
    pub scope: CancellationToken,
    pub directory: Arc<dyn GatewayDirectory>,
    pub gateway_id: GatewayId,
}

/// Processes decoded messages for one gateway.
#[async_trait]
pub trait Logic: Send + Sync {
    async fn process(&self, message: &IotMessage) -> Result<(), LogicError>;
}

/// Builds the logic for a gateway once it is confirmed to be registered.
#[async_trait]
pub trait LogicFactory: Send + Sync {
    async fn create(&self, ctx: LogicContext) -> Result<Arc<dyn Logic>, LogicError>;
}

/// Default logic: mirrors `status` messages into the directory.
pub struct StatusLogic {
    ctx: LogicContext,
}

impl StatusLogic {
    pub fn new(ctx: LogicContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Logic for StatusLogic {
    async fn process(&self, message: &IotMessage) -> Result<(), LogicError> {
        if self.ctx.scope.is_cancelled() {
            return Err(LogicError::Process("session stopped".to_string()));
        }

        if message.message_type != "status" {
            debug!(
                gateway = %self.ctx.gateway_id,
                message_type = %message.message_type,
                "No handler for message type"
            );
            return Ok(());
        }

        let status = message.status_value().ok_or_else(|| {
            LogicError::Process(format!("invalid status value: {:?}", message.value))
        })?;

        match message.device_id.as_deref() {
            Some(device) => {
                self.ctx
                    .directory
                    .update_device_status(&self.ctx.gateway_id, device, status)
                    .await?
            }
            None => {
                self.ctx
                    .directory
                    .update_gateway_status(&self.ctx.gateway_id, status)
                    .await?
            }
        }
        Ok(())
    }
}

/// Factory for [`StatusLogic`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusLogicFactory;

#[async_trait]
impl LogicFactory for StatusLogicFactory {
    async fn create(&self, ctx: LogicContext) -> Result<Arc<dyn Logic>, LogicError> {
        debug!(gateway = %ctx.gateway_id, "Creating status logic");
        Ok(Arc::new(StatusLogic::new(ctx)))
    }
}

#[cfg(test)]
mod tests {
    use proto::GatewayStatus;

    use super::*;
    use crate::memory::MemoryDirectory;

    fn context(directory: Arc<MemoryDirectory>) -> LogicContext {
        LogicContext {
            scope: CancellationToken::new(),
            directory,
            gateway_id: GatewayId::from("gw1"),
        }
    }

    #[tokio::test]
    async fn gateway_status_message_updates_directory() {
        let directory = Arc::new(MemoryDirectory::with_gateways(["gw1"]));
        let logic = StatusLogicFactory
            .create(context(directory.clone()))
            .await
            .expect("logic");

        let msg = IotMessage::status(GatewayId::from("gw1"), GatewayStatus::Online);
        logic.process(&msg).await.expect("process");

        assert_eq!(
            directory.gateway_status(&GatewayId::from("gw1")),
            Some(GatewayStatus::Online)
        );
    }

    #[tokio::test]
    async fn device_status_message_updates_device() {
        let directory = Arc::new(MemoryDirectory::with_gateways(["gw1"]));
        let logic = StatusLogic::new(context(directory.clone()));

        let mut msg = IotMessage::status(GatewayId::from("gw1"), GatewayStatus::Online);
        msg.device_id = Some("lamp-3".to_string());
        logic.process(&msg).await.expect("process");

        assert_eq!(directory.device_status("lamp-3"), Some(GatewayStatus::Online));
        assert_eq!(directory.gateway_status(&GatewayId::from("gw1")), None);
    }

    #[tokio::test]
    async fn invalid_status_value_is_an_error() {
        let directory = Arc::new(MemoryDirectory::with_gateways(["gw1"]));
        let logic = StatusLogic::new(context(directory));

        let mut msg = IotMessage::new(GatewayId::from("gw1"), "status");
        msg.value = Some(serde_json::json!(17));
        assert!(matches!(
            logic.process(&msg).await,
            Err(LogicError::Process(_))
        ));
    }

    #[tokio::test]
    async fn other_message_types_are_accepted() {
        let directory = Arc::new(MemoryDirectory::with_gateways(["gw1"]));
        let logic = StatusLogic::new(context(directory.clone()));

        let msg = IotMessage::new(GatewayId::from("gw1"), "telemetry");
        logic.process(&msg).await.expect("process");
        assert_eq!(directory.status_updates().len(), 0);
    }

    #[tokio::test]
    async fn cancelled_scope_rejects_processing() {
        let directory = Arc::new(MemoryDirectory::with_gateways(["gw1"]));
        let ctx = context(directory);
        ctx.scope.cancel();
        let logic = StatusLogic::new(ctx);

        let msg = IotMessage::status(GatewayId::from("gw1"), GatewayStatus::Online);
        assert!(logic.process(&msg).await.is_err());
    }
}
