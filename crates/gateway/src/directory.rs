//! Persistent gateway/device registry as seen by the supervisor.

use async_trait::async_trait;
use proto::{GatewayId, GatewayStatus, RegistryError};

/// Registry of known gateways and their devices.
///
/// The SQLite implementation lives in the `store` crate; tests use
/// [`crate::memory::MemoryDirectory`].
#[async_trait]
pub trait GatewayDirectory: Send + Sync {
    /// Whether the gateway is registered.
    async fn gateway_exists(&self, gateway: &GatewayId) -> Result<bool, RegistryError>;

    /// Records the gateway status. Going offline also marks every device
    /// behind the gateway offline.
    async fn update_gateway_status(
        &self,
        gateway: &GatewayId,
        status: GatewayStatus,
    ) -> Result<(), RegistryError>;

    /// Records the status of one device behind a gateway.
    async fn update_device_status(
        &self,
        gateway: &GatewayId,
        device_id: &str,
        status: GatewayStatus,
    ) -> Result<(), RegistryError>;
}
