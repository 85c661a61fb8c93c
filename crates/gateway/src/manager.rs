//! Broker manager: owns the broker link, watches queue lifecycle events and
//! keeps the session registry in sync with attached gateways.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use proto::{
    BrokerError, ExchangeEvent, ExchangeEventType, GatewayError, GatewayId, IotMessage,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use urlencoding::encode;

use crate::directory::GatewayDirectory;
use crate::logic::LogicFactory;
use crate::registry::SessionRegistry;
use crate::session::{GatewaySession, Session, SessionConfig, SessionDeps, SessionExit};
use crate::transport::{BrokerLink, Connector, EventStream};

/// Where and as whom to connect to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Identifies this server instance; also names its monitor queue.
    pub server_id: String,
    pub scheme: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            server_id: "iot-cloud".to_string(),
            scheme: "amqp".to_string(),
            user: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
        }
    }
}

impl BrokerSettings {
    /// `<scheme>://<user>:<password>@<host>:<port>/<vhost>` with user,
    /// password and vhost percent-encoded (`/` becomes `%2F`).
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            self.scheme,
            encode(&self.user),
            encode(&self.password),
            self.host,
            self.port,
            encode(&self.vhost)
        )
    }

    /// Same as [`url`](Self::url) with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        format!(
            "{}://{}:***@{}:{}/{}",
            self.scheme,
            encode(&self.user),
            self.host,
            self.port,
            encode(&self.vhost)
        )
    }
}

/// Supervises every gateway session of one server instance.
pub struct BrokerManager {
    settings: BrokerSettings,
    connector: Arc<dyn Connector>,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
    /// Held by the event loop while it runs.
    events: Mutex<Option<Box<dyn EventStream>>>,
    exits: Mutex<mpsc::UnboundedReceiver<SessionExit>>,
    registry: SessionRegistry,
    deps: SessionDeps,
    monitoring: AtomicBool,
    closed: AtomicBool,
    /// Held by attach from its `closed` check until the session is
    /// registered, and by shutdown for its whole teardown.
    lifecycle: Mutex<()>,
}

impl BrokerManager {
    pub fn new(
        settings: BrokerSettings,
        connector: Arc<dyn Connector>,
        directory: Arc<dyn GatewayDirectory>,
        logic_factory: Arc<dyn LogicFactory>,
        config: SessionConfig,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            connector,
            link: RwLock::new(None),
            events: Mutex::new(None),
            exits: Mutex::new(exit_rx),
            registry: SessionRegistry::new(),
            deps: SessionDeps {
                directory,
                logic_factory,
                config,
                exits: Some(exit_tx),
            },
            monitoring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.settings.server_id
    }

    /// Connects to the broker and opens the management channel. No retries.
    pub async fn open(&self) -> Result<(), BrokerError> {
        if self.link.read().is_some() {
            debug!("Broker connection already open");
            return Ok(());
        }
        info!("Connecting to broker at {}", self.settings.redacted_url());
        let link = self.connector.connect(&self.settings.url()).await?;
        *self.link.write() = Some(link);
        info!(server = %self.settings.server_id, "Broker connection established");
        Ok(())
    }

    /// Declares this server's monitor queue and subscribes it to queue
    /// lifecycle notifications.
    pub async fn init_event_monitor(&self) -> Result<(), BrokerError> {
        let link = self
            .current_link()
            .ok_or_else(|| BrokerError::Setup("broker connection is not open".to_string()))?;
        let stream = link.subscribe_events(&self.settings.server_id).await?;
        *self.events.lock().await = Some(stream);
        self.monitoring.store(true, Ordering::SeqCst);
        info!(queue = %self.settings.server_id, "Event monitor initialised");
        Ok(())
    }

    /// Translates lifecycle events into registry changes until `cancel` fires
    /// or the broker closes the subscription.
    pub async fn run_event_loop(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let mut events = self.events.lock().await;
        let stream = events
            .as_mut()
            .ok_or_else(|| BrokerError::Setup("event monitor is not initialised".to_string()))?;
        let mut exits = self.exits.lock().await;

        info!(server = %self.settings.server_id, "Event loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Event loop cancelled");
                    break;
                }
                Some(exit) = exits.recv() => self.reap(exit).await,
                event = stream.next_event() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => warn!("Skipping unreadable exchange event: {e}"),
                    None => {
                        error!("Exchange event stream closed by broker");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Performs an RPC against an attached gateway.
    pub async fn call_gateway_rpc(
        &self,
        gateway: &GatewayId,
        request: &IotMessage,
    ) -> Result<IotMessage, GatewayError> {
        let session = self
            .registry
            .get(gateway)
            .ok_or_else(|| GatewayError::UnknownGateway(gateway.to_string()))?;
        Ok(session.call(request).await?)
    }

    /// Closes every session, deletes the monitor queue and closes the broker
    /// link. Every step is attempted; the first failure is returned. Later
    /// calls do nothing.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Broker manager already shut down");
            return Ok(());
        }
        info!(server = %self.settings.server_id, "Shutting down broker manager");

        let mut first: Option<GatewayError> = None;
        for session in self.registry.drain() {
            if let Err(e) = session.close().await {
                warn!(gateway = %session.gateway_id(), error = %e, "Error closing session");
                first.get_or_insert(e.into());
            }
        }

        let link = self.link.write().take();
        if let Some(link) = link {
            if self.monitoring.swap(false, Ordering::SeqCst)
                && let Err(e) = link.delete_queue(&self.settings.server_id).await
            {
                warn!(queue = %self.settings.server_id, error = %e, "Error deleting monitor queue");
                first.get_or_insert(e.into());
            }
            if let Err(e) = link.close_channel().await {
                warn!(error = %e, "Error closing broker channel");
                first.get_or_insert(e.into());
            }
            if let Err(e) = link.close_connection().await {
                warn!(error = %e, "Error closing broker connection");
                first.get_or_insert(e.into());
            }
        }

        first.map_or(Ok(()), Err)
    }

    /// Number of attached gateways
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Sorted ids of attached gateways.
    pub fn attached_gateways(&self) -> Vec<GatewayId> {
        self.registry.gateway_ids()
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.link.read().clone()
    }

    async fn handle_event(&self, event: ExchangeEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(gateway) = event.target() else {
            debug!("Ignoring exchange event: {event}");
            return;
        };
        match event.event_type {
            ExchangeEventType::Created => self.attach(gateway).await,
            ExchangeEventType::Deleted => self.detach(&gateway).await,
            ExchangeEventType::Other(_) => {}
        }
    }

    async fn attach(&self, gateway: GatewayId) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!(gateway = %gateway, "Broker manager shut down, not attaching");
            return;
        }
        if self.registry.contains(&gateway) {
            warn!(gateway = %gateway, "Gateway already attached, ignoring created event");
            return;
        }
        let Some(link) = self.current_link() else {
            error!(gateway = %gateway, "Cannot attach gateway: broker connection is not open");
            return;
        };

        let transport = match link.open_transport(&self.settings.server_id, &gateway).await {
            Ok(transport) => transport,
            Err(e) => {
                error!(gateway = %gateway, error = %e, "Cannot open gateway transport");
                return;
            }
        };

        let session = Arc::new(GatewaySession::new(
            self.settings.server_id.clone(),
            gateway.clone(),
            transport,
            self.deps.clone(),
        ));
        session.start();
        self.registry.add(session).await;
        info!(gateway = %gateway, "Gateway attached");
    }

    async fn detach(&self, gateway: &GatewayId) {
        let Some(session) = self.registry.remove(gateway) else {
            warn!(gateway = %gateway, "Deleted event for gateway without session");
            return;
        };
        if let Err(e) = session.close().await {
            warn!(gateway = %gateway, error = %e, "Error closing session");
        }
        info!(gateway = %gateway, "Gateway detached");
    }

    /// Drops a session whose pump ended on its own, unless it was replaced.
    async fn reap(&self, exit: SessionExit) {
        let Some(session) = self
            .registry
            .remove_instance(&exit.gateway_id, exit.instance)
        else {
            return;
        };
        if let Err(e) = session.close().await {
            warn!(gateway = %exit.gateway_id, error = %e, "Error closing lost session");
        }
        info!(gateway = %exit.gateway_id, "Gateway transport lost, session removed");
    }
}
