use std::sync::Arc;

use dashmap::DashMap;
use proto::GatewayId;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::Session;

/// Attached gateways, keyed by gateway id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<GatewayId, Arc<dyn Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, closing any session it replaces.
    pub async fn add(&self, session: Arc<dyn Session>) {
        let gateway = session.gateway_id().clone();
        debug!("Registering gateway session: {gateway}");
        if let Some(previous) = self.sessions.insert(gateway.clone(), session) {
            warn!("Replacing live session for gateway {gateway}");
            if let Err(e) = previous.close().await {
                warn!("Error closing replaced session for {gateway}: {e}");
            }
        }
    }

    /// Session attached for `gateway`, if any.
    pub fn get(&self, gateway: &GatewayId) -> Option<Arc<dyn Session>> {
        self.sessions.get(gateway).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, gateway: &GatewayId) -> bool {
        self.sessions.contains_key(gateway)
    }

    /// Unregisters and returns the session for `gateway`.
    pub fn remove(&self, gateway: &GatewayId) -> Option<Arc<dyn Session>> {
        debug!("Deregistering gateway session: {gateway}");
        self.sessions.remove(gateway).map(|(_, session)| session)
    }

    /// Unregisters the session only if it is still the given instance.
    pub fn remove_instance(
        &self,
        gateway: &GatewayId,
        instance: Uuid,
    ) -> Option<Arc<dyn Session>> {
        self.sessions
            .remove_if(gateway, |_, session| session.instance_id() == instance)
            .map(|(_, session)| session)
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<dyn Session>> {
        let gateways: Vec<GatewayId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        gateways
            .iter()
            .filter_map(|gateway| self.remove(gateway))
            .collect()
    }

    /// Sorted ids of attached gateways.
    pub fn gateway_ids(&self) -> Vec<GatewayId> {
        let mut ids: Vec<GatewayId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of attached gateways
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
