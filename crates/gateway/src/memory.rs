//! In-process broker and registry (for local runs and testing without RabbitMQ).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{
    BrokerError, ExchangeEvent, Frame, GatewayId, GatewayStatus, RegistryError, TransportError,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::directory::GatewayDirectory;
use crate::transport::{
    BrokerLink, Connector, EventStream, FrameReader, FrameWriter, TransportPair,
};

// ─── Transport pair ──────────────────────────────────────────────────────────

/// Creates a connected transport pair and the gateway-side handle for it.
pub fn transport_pair(gateway: &GatewayId) -> (TransportPair, DeviceHandle) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::unbounded_channel();
    let close_fault = Arc::new(AtomicBool::new(false));
    let pair = TransportPair {
        reader: Box::new(MemoryReader {
            rx: inbound,
            closed: false,
        }),
        writer: Arc::new(MemoryWriter {
            tx: Mutex::new(Some(outbound)),
            close_fault: Arc::clone(&close_fault),
        }),
    };
    let device = DeviceHandle {
        gateway_id: gateway.clone(),
        to_server,
        from_server,
        close_fault,
    };
    (pair, device)
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Frame>,
    closed: bool,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        self.closed = true;
        Ok(())
    }
}

struct MemoryWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    close_fault: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tx.lock().take();
        if self.close_fault.load(Ordering::SeqCst) {
            return Err(TransportError::Io("injected writer close failure".to_string()));
        }
        Ok(())
    }
}

/// The gateway's end of an in-memory transport pair.
///
/// Dropping it closes the gateway → server direction, like a deleted queue.
pub struct DeviceHandle {
    gateway_id: GatewayId,
    to_server: mpsc::UnboundedSender<Frame>,
    from_server: mpsc::UnboundedReceiver<Frame>,
    close_fault: Arc<AtomicBool>,
}

impl DeviceHandle {
    pub fn gateway_id(&self) -> &GatewayId {
        &self.gateway_id
    }

    /// Publishes a raw frame to the server. Returns `false` once the server
    /// stopped consuming.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.to_server.send(frame).is_ok()
    }

    /// Publishes raw bytes as an uncorrelated frame.
    pub fn send_raw(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.send_frame(Frame::new(payload))
    }

    /// Publishes a JSON encoded message.
    pub fn send_message(&self, message: &proto::IotMessage) -> bool {
        match message.to_vec() {
            Ok(payload) => self.send_raw(payload),
            Err(_) => false,
        }
    }

    /// Next frame published by the server; `None` once its writer closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_server.recv().await
    }

    /// Makes the server's writer report an error on close. The writer is
    /// released either way.
    pub fn fail_server_close(&self, fail: bool) {
        self.close_fault.store(fail, Ordering::SeqCst);
    }
}

// ─── Broker ──────────────────────────────────────────────────────────────────

type EventItem = Result<ExchangeEvent, BrokerError>;

/// Link teardown operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    DeleteQueue,
    CloseChannel,
    CloseConnection,
}

struct BrokerState {
    events_tx: mpsc::UnboundedSender<EventItem>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EventItem>>>,
    /// Server ends of gateway queues not yet claimed by a session.
    queues: Mutex<HashMap<GatewayId, TransportPair>>,
    deleted_queues: Mutex<Vec<String>>,
    failing_teardown: Mutex<Vec<TeardownStep>>,
    open_delay: Mutex<Option<Duration>>,
    refuse_connections: AtomicBool,
    channel_open: AtomicBool,
    connection_open: AtomicBool,
}

/// In-process stand-in for the message broker.
///
/// Lifecycle events are buffered until the monitor subscribes.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(BrokerState {
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                queues: Mutex::new(HashMap::new()),
                deleted_queues: Mutex::new(Vec::new()),
                failing_teardown: Mutex::new(Vec::new()),
                open_delay: Mutex::new(None),
                refuse_connections: AtomicBool::new(false),
                channel_open: AtomicBool::new(false),
                connection_open: AtomicBool::new(false),
            }),
        }
    }

    /// Declares the gateway's queues and announces the inbound one.
    pub fn attach_gateway(&self, gateway: impl Into<GatewayId>) -> DeviceHandle {
        let gateway = gateway.into();
        let (pair, device) = transport_pair(&gateway);
        self.state.queues.lock().insert(gateway.clone(), pair);
        self.emit(ExchangeEvent::created(gateway.inbound_queue()));
        device
    }

    /// Deletes the gateway's queues and announces the inbound one.
    pub fn detach_gateway(&self, gateway: impl Into<GatewayId>) {
        let gateway = gateway.into();
        self.state.queues.lock().remove(&gateway);
        self.emit(ExchangeEvent::deleted(gateway.inbound_queue()));
    }

    /// Publishes an arbitrary management notification.
    pub fn emit(&self, event: ExchangeEvent) {
        debug!("Memory broker event: {event}");
        let _ = self.state.events_tx.send(Ok(event));
    }

    /// Publishes a delivery the monitor cannot interpret.
    pub fn emit_error(&self, error: BrokerError) {
        let _ = self.state.events_tx.send(Err(error));
    }

    /// Makes subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes `step` fail on every link from now on.
    pub fn fail_teardown(&self, step: TeardownStep) {
        self.state.failing_teardown.lock().push(step);
    }

    /// Delays every `open_transport` call by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock() = Some(delay);
    }

    /// Queues deleted by the server, in order.
    pub fn deleted_queues(&self) -> Vec<String> {
        self.state.deleted_queues.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connection_open.load(Ordering::SeqCst)
    }

    pub fn is_channel_open(&self) -> bool {
        self.state.channel_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!("connection refused: {url}")));
        }
        self.state.connection_open.store(true, Ordering::SeqCst);
        self.state.channel_open.store(true, Ordering::SeqCst);
        Ok(Arc::new(MemoryLink {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryLink {
    state: Arc<BrokerState>,
}

impl MemoryLink {
    fn check_teardown(&self, step: TeardownStep) -> Result<(), BrokerError> {
        if self.state.failing_teardown.lock().contains(&step) {
            return Err(BrokerError::Teardown(format!("injected {step:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe_events(&self, queue: &str) -> Result<Box<dyn EventStream>, BrokerError> {
        let rx = self
            .state
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Setup(format!("queue {queue} already consumed")))?;
        Ok(Box::new(MemoryEventStream { rx }))
    }

    async fn open_transport(
        &self,
        _server_id: &str,
        gateway: &GatewayId,
    ) -> Result<TransportPair, BrokerError> {
        let delay = *self.state.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.queues.lock().remove(gateway).ok_or_else(|| {
            BrokerError::Setup(format!("queue {} not found", gateway.inbound_queue()))
        })
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.check_teardown(TeardownStep::DeleteQueue)?;
        self.state.deleted_queues.lock().push(queue.to_string());
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        self.check_teardown(TeardownStep::CloseChannel)?;
        self.state.channel_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        self.check_teardown(TeardownStep::CloseConnection)?;
        self.state.connection_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryEventStream {
    rx: mpsc::UnboundedReceiver<EventItem>,
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn next_event(&mut self) -> Option<EventItem> {
        self.rx.recv().await
    }
}

// ─── Directory ───────────────────────────────────────────────────────────────

/// In-memory [`GatewayDirectory`] with failure injection.
#[derive(Default)]
pub struct MemoryDirectory {
    gateways: Mutex<HashMap<GatewayId, Option<GatewayStatus>>>,
    devices: Mutex<HashMap<String, (GatewayId, GatewayStatus)>>,
    updates: Mutex<Vec<(GatewayId, GatewayStatus)>>,
    lookups: AtomicUsize,
    lookup_delay: Mutex<Option<Duration>>,
    fail_lookups: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory with the given gateways registered.
    pub fn with_gateways<I, G>(gateways: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GatewayId>,
    {
        let directory = Self::new();
        for gateway in gateways {
            directory.register(gateway);
        }
        directory
    }

    pub fn register(&self, gateway: impl Into<GatewayId>) {
        self.gateways.lock().entry(gateway.into()).or_insert(None);
    }

    /// Last status recorded for a gateway.
    pub fn gateway_status(&self, gateway: &GatewayId) -> Option<GatewayStatus> {
        self.gateways.lock().get(gateway).copied().flatten()
    }

    pub fn device_status(&self, device_id: &str) -> Option<GatewayStatus> {
        self.devices.lock().get(device_id).map(|(_, status)| *status)
    }

    /// Every gateway status update, in order.
    pub fn status_updates(&self) -> Vec<(GatewayId, GatewayStatus)> {
        self.updates.lock().clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock() = Some(delay);
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Polls until `gateway` was updated to `status` or `timeout` elapses.
    pub async fn wait_for_status(
        &self,
        gateway: &GatewayId,
        status: GatewayStatus,
        timeout: Duration,
    ) -> bool {
        self.wait_until(timeout, || {
            self.updates
                .lock()
                .iter()
                .any(|(g, s)| g == gateway && *s == status)
        })
        .await
    }

    /// Polls until at least `count` existence lookups ran.
    pub async fn wait_for_lookups(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.lookup_count() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl GatewayDirectory for MemoryDirectory {
    async fn gateway_exists(&self, gateway: &GatewayId) -> Result<bool, RegistryError> {
        let delay = *self.lookup_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(RegistryError::Lookup("injected lookup failure".to_string()));
        }
        Ok(self.gateways.lock().contains_key(gateway))
    }

    async fn update_gateway_status(
        &self,
        gateway: &GatewayId,
        status: GatewayStatus,
    ) -> Result<(), RegistryError> {
        if let Some(current) = self.gateways.lock().get_mut(gateway) {
            *current = Some(status);
        }
        if status == GatewayStatus::Offline {
            for (owner, device_status) in self.devices.lock().values_mut() {
                if owner == gateway {
                    *device_status = GatewayStatus::Offline;
                }
            }
        }
        self.updates.lock().push((gateway.clone(), status));
        Ok(())
    }

    async fn update_device_status(
        &self,
        gateway: &GatewayId,
        device_id: &str,
        status: GatewayStatus,
    ) -> Result<(), RegistryError> {
        self.devices
            .lock()
            .insert(device_id.to_string(), (gateway.clone(), status));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_pair_moves_frames_both_ways() {
        let gateway = GatewayId::from("gw1");
        let (mut pair, mut device) = transport_pair(&gateway);
        assert_eq!(device.gateway_id(), &gateway);

        assert!(device.send_raw(b"up".to_vec()));
        let inbound = pair.reader.recv().await.expect("recv").expect("frame");
        assert_eq!(inbound.payload, b"up");

        pair.writer.send(Frame::new(b"down".to_vec())).await.expect("send");
        assert_eq!(device.recv().await.expect("frame").payload, b"down");

        pair.writer.close().await.expect("close");
        pair.writer.close().await.expect("close twice");
        assert_eq!(
            pair.writer.send(Frame::default()).await,
            Err(TransportError::Closed)
        );
        assert!(device.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_device_ends_reader() {
        let (mut pair, device) = transport_pair(&GatewayId::from("gw1"));
        drop(device);
        assert_eq!(pair.reader.recv().await, Ok(None));

        pair.reader.close().await.expect("close");
        assert_eq!(pair.reader.recv().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn broker_hands_out_each_queue_once() {
        let broker = MemoryBroker::new();
        let _device = broker.attach_gateway("gw1");
        let link = broker.connect("amqp://memory").await.expect("connect");

        assert!(link.open_transport("s1", &GatewayId::from("gw1")).await.is_ok());
        assert!(matches!(
            link.open_transport("s1", &GatewayId::from("gw1")).await,
            Err(BrokerError::Setup(_))
        ));

        let mut events = link.subscribe_events("s1").await.expect("subscribe");
        let first = events.next_event().await.expect("event").expect("ok");
        assert_eq!(first, ExchangeEvent::created("gw1.in"));
        assert!(link.subscribe_events("s1").await.is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        assert!(matches!(
            broker.connect("amqp://memory").await,
            Err(BrokerError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn offline_update_cascades_to_devices() {
        let directory = MemoryDirectory::with_gateways(["gw1", "gw2"]);
        let gw1 = GatewayId::from("gw1");
        let gw2 = GatewayId::from("gw2");
        directory
            .update_device_status(&gw1, "d1", GatewayStatus::Online)
            .await
            .expect("device");
        directory
            .update_device_status(&gw2, "d2", GatewayStatus::Online)
            .await
            .expect("device");

        directory
            .update_gateway_status(&gw1, GatewayStatus::Offline)
            .await
            .expect("gateway");

        assert_eq!(directory.gateway_status(&gw1), Some(GatewayStatus::Offline));
        assert_eq!(directory.device_status("d1"), Some(GatewayStatus::Offline));
        assert_eq!(directory.device_status("d2"), Some(GatewayStatus::Online));
    }
}
