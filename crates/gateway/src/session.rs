//! Per-gateway session: message pump, lazy business logic and RPC bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{
    Frame, GatewayId, GatewayStatus, IotMessage, LogicError, RegistryError, RpcError,
    TransportError,
};
use thiserror::Error;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::directory::GatewayDirectory;
use crate::logic::{Logic, LogicContext, LogicFactory};
use crate::rpc::PendingCalls;
use crate::transport::{FrameReader, FrameWriter, TransportPair};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a read error that did not close the transport.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long `call` waits for a correlated reply.
    pub rpc_timeout: Duration,
    /// Deadline for the registry existence check.
    pub lookup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// Notice sent when a pump ended because its transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub gateway_id: GatewayId,
    pub instance: Uuid,
}

/// Collaborators shared by every session of a manager.
#[derive(Clone)]
pub struct SessionDeps {
    pub directory: Arc<dyn GatewayDirectory>,
    pub logic_factory: Arc<dyn LogicFactory>,
    pub config: SessionConfig,
    /// Where to report pumps that stopped on their own.
    pub exits: Option<mpsc::UnboundedSender<SessionExit>>,
}

/// Capabilities the supervisor needs from an attached gateway.
#[async_trait]
pub trait Session: Send + Sync {
    fn gateway_id(&self) -> &GatewayId;

    /// Distinguishes successive sessions of the same gateway.
    fn instance_id(&self) -> Uuid;

    /// Launches the message pump; returns immediately.
    fn start(&self);

    /// Sends `request` and waits for the correlated reply.
    async fn call(&self, request: &IotMessage) -> Result<IotMessage, RpcError>;

    /// Cancels the pump, closes the transport and schedules the offline
    /// status update. Idempotent; failures are logged.
    async fn stop(&self);

    /// `stop` followed by releasing the read side; reports the first error.
    async fn close(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
enum AttachError {
    #[error("gateway is not registered")]
    NotRegistered,
    #[error(transparent)]
    Lookup(#[from] RegistryError),
    #[error(transparent)]
    Create(LogicError),
}

/// Session bound to one gateway's broker queues
pub struct GatewaySession {
    inner: Arc<Inner>,
    /// Held until `start` hands it to the pump.
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    pump: Mutex<Option<JoinHandle<Result<(), TransportError>>>>,
}

struct Inner {
    instance: Uuid,
    server_id: String,
    gateway_id: GatewayId,
    writer: Arc<dyn FrameWriter>,
    scope: CancellationToken,
    pending: PendingCalls,
    /// Unattached until the first message from a registered gateway.
    logic: OnceCell<Arc<dyn Logic>>,
    deps: SessionDeps,
    stopped: AtomicBool,
}

impl GatewaySession {
    /// Creates a session owning `transport`. Nothing runs until [`Session::start`].
    pub fn new(
        server_id: impl Into<String>,
        gateway_id: GatewayId,
        transport: TransportPair,
        deps: SessionDeps,
    ) -> Self {
        let TransportPair { reader, writer } = transport;
        Self {
            inner: Arc::new(Inner {
                instance: Uuid::new_v4(),
                server_id: server_id.into(),
                gateway_id,
                writer,
                scope: CancellationToken::new(),
                pending: PendingCalls::new(),
                logic: OnceCell::new(),
                deps,
                stopped: AtomicBool::new(false),
            }),
            reader: Mutex::new(Some(reader)),
            pump: Mutex::new(None),
        }
    }

    /// Whether business logic has been attached.
    pub fn logic_attached(&self) -> bool {
        self.inner.logic.initialized()
    }

    /// Number of RPC calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stops the session and returns the first teardown error.
    async fn shutdown(&self) -> Result<(), TransportError> {
        let mut first = self.inner.shutdown().await.err();

        // Never started: the reader is still ours to close.
        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader
            && let Err(e) = reader.close().await
        {
            error!(gateway = %self.inner.gateway_id, error = %e, "Error closing gateway input");
            first.get_or_insert(e);
        }

        first.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Session for GatewaySession {
    fn gateway_id(&self) -> &GatewayId {
        &self.inner.gateway_id
    }

    fn instance_id(&self) -> Uuid {
        self.inner.instance
    }

    fn start(&self) {
        let Some(reader) = self.reader.lock().take() else {
            warn!(gateway = %self.inner.gateway_id, "Session already started or stopped");
            return;
        };
        let handle = tokio::spawn(pump(Arc::clone(&self.inner), reader));
        *self.pump.lock() = Some(handle);
    }

    async fn call(&self, request: &IotMessage) -> Result<IotMessage, RpcError> {
        let inner = &self.inner;
        if inner.scope.is_cancelled() {
            return Err(RpcError::TransportClosed);
        }
        let payload = request
            .to_vec()
            .map_err(|e| RpcError::Encode(e.to_string()))?;

        let (correlation_id, reply_rx) = inner.pending.register();
        let frame =
            Frame::new(payload).with_rpc(correlation_id.clone(), inner.gateway_id.inbound_queue());
        if let Err(e) = inner.writer.send(frame).await {
            inner.pending.cancel(&correlation_id);
            return Err(e.into());
        }
        debug!(gateway = %inner.gateway_id, correlation_id = %correlation_id, "RPC request published");

        let timeout = inner.deps.config.rpc_timeout;
        let outcome = tokio::select! {
            reply = tokio::time::timeout(timeout, reply_rx) => reply,
            _ = inner.scope.cancelled() => {
                inner.pending.cancel(&correlation_id);
                return Err(RpcError::TransportClosed);
            }
        };

        match outcome {
            Ok(Ok(reply)) => Ok(IotMessage::from_slice(&reply.payload)?),
            Ok(Err(_)) => Err(RpcError::TransportClosed),
            Err(_) => {
                inner.pending.cancel(&correlation_id);
                warn!(
                    gateway = %inner.gateway_id,
                    correlation_id = %correlation_id,
                    "RPC timed out after {timeout:?}"
                );
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    async fn stop(&self) {
        let _ = self.shutdown().await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut first = self.shutdown().await.err();

        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first.get_or_insert(e);
                }
                Err(e) => {
                    first.get_or_insert(TransportError::Io(e.to_string()));
                }
            }
        }

        first.map_or(Ok(()), Err)
    }
}

impl Inner {
    /// Cancel, fail waiters, close the writer and report the gateway offline.
    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.scope.cancel();
        self.pending.fail_all();

        let result = self.writer.close().await;
        if let Err(e) = &result {
            error!(gateway = %self.gateway_id, error = %e, "Error closing gateway output");
        }

        let directory = Arc::clone(&self.deps.directory);
        let gateway = self.gateway_id.clone();
        tokio::spawn(async move {
            if let Err(e) = directory
                .update_gateway_status(&gateway, GatewayStatus::Offline)
                .await
            {
                error!(gateway = %gateway, error = %e, "Failed to mark gateway offline");
            }
        });

        info!(gateway = %self.gateway_id, server = %self.server_id, "Gateway session stopped");
        result
    }

    /// Routes one received frame; never blocks the pump.
    fn dispatch(self: &Arc<Self>, frame: Frame) {
        if let Some(correlation_id) = frame.correlation_id.clone() {
            if !self.pending.resolve(&correlation_id, frame) {
                debug!(
                    gateway = %self.gateway_id,
                    correlation_id = %correlation_id,
                    "Dropping reply without waiting caller"
                );
            }
            return;
        }

        let message = match IotMessage::from_slice(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(gateway = %self.gateway_id, error = %e, "Cannot decode incoming gateway message");
                return;
            }
        };
        debug!(gateway = %self.gateway_id, message = ?message.redacted(), "Message from gateway");

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.process(message).await });
    }

    async fn process(&self, message: IotMessage) {
        if self.scope.is_cancelled() {
            return;
        }

        let logic = match self.attach_logic().await {
            Ok(logic) => logic,
            Err(AttachError::NotRegistered) => {
                warn!(gateway = %self.gateway_id, "Gateway is not registered in cloud database");
                return;
            }
            Err(AttachError::Lookup(e)) => {
                error!(gateway = %self.gateway_id, error = %e, "Error checking gateway in database");
                return;
            }
            Err(AttachError::Create(e)) => {
                error!(gateway = %self.gateway_id, error = %e, "Cannot create business logic");
                return;
            }
        };

        if let Err(e) = logic.process(&message).await {
            error!(gateway = %self.gateway_id, error = %e, "Error processing message");
        }
    }

    /// Moves the logic slot from unattached to attached at most once. A
    /// failed attempt leaves it unattached for the next message.
    async fn attach_logic(&self) -> Result<Arc<dyn Logic>, AttachError> {
        let logic = self
            .logic
            .get_or_try_init(|| async {
                let deadline = self.deps.config.lookup_timeout;
                let exists = tokio::time::timeout(
                    deadline,
                    self.deps.directory.gateway_exists(&self.gateway_id),
                )
                .await
                .map_err(|_| RegistryError::Timeout(deadline))??;
                if !exists {
                    return Err(AttachError::NotRegistered);
                }

                let ctx = LogicContext {
                    scope: self.scope.child_token(),
                    directory: Arc::clone(&self.deps.directory),
                    gateway_id: self.gateway_id.clone(),
                };
                let logic = self
                    .deps
                    .logic_factory
                    .create(ctx)
                    .await
                    .map_err(AttachError::Create)?;
                info!(gateway = %self.gateway_id, "Business logic attached");
                Ok::<_, AttachError>(logic)
            })
            .await?;
        Ok(Arc::clone(logic))
    }

    fn notify_exit(&self) {
        if let Some(exits) = &self.deps.exits {
            let _ = exits.send(SessionExit {
                gateway_id: self.gateway_id.clone(),
                instance: self.instance,
            });
        }
    }
}

/// Reads frames until cancelled or until the transport goes away.
async fn pump(inner: Arc<Inner>, mut reader: Box<dyn FrameReader>) -> Result<(), TransportError> {
    info!(gateway = %inner.gateway_id, "Message pump started");
    let mut detached = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = inner.scope.cancelled() => break,
            next = reader.recv() => next,
        };

        match next {
            Ok(Some(frame)) => inner.dispatch(frame),
            Ok(None) | Err(TransportError::Closed) => {
                warn!(gateway = %inner.gateway_id, "Gateway transport closed");
                detached = true;
                break;
            }
            Err(e) => {
                error!(gateway = %inner.gateway_id, error = %e, "Error reading gateway channel");
                tokio::select! {
                    biased;
                    _ = inner.scope.cancelled() => break,
                    _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                }
            }
        }
    }

    if detached {
        let _ = inner.shutdown().await;
    }
    let result = reader.close().await;
    if let Err(e) = &result {
        error!(gateway = %inner.gateway_id, error = %e, "Error closing gateway input");
    }
    if detached {
        inner.notify_exit();
    }
    info!(gateway = %inner.gateway_id, "Message pump finished");
    result
}
