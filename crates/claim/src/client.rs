//! Daemon-side claim IPC client
//!
//! Requests are sent over a [`FramedChannel`] and parked in a pending table
//! keyed by request id. A dispatcher task matches inbound responses to that
//! table, so responses may arrive in any order. Callers wait at most
//! `request_timeout`; a response arriving after its caller gave up is
//! discarded.
//!
//! When the channel ends, requests in flight fail with `ServiceUnavailable`.
//! A client built with a [`Connector`] opens a new channel on its next
//! request, so a restarted claimer is picked up without restarting the
//! daemon. A client without one stays disconnected.

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::framing::{decode_frame, encode_frame};
use crate::message::{
    ClaimHistoryEntry, ClaimedDevice, IpcCommand, IpcEnvelope, IpcRequest, IpcResponse, IpcResult,
    PARAM_BUS_ID, PARAM_LIMIT, ServiceStatus,
};
use crate::stats::IpcStatistics;
use crate::transport::FramedChannel;
use protocol::BusId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type PendingTable = HashMap<Uuid, oneshot::Sender<Result<IpcResponse>>>;

/// Pending attempt to open a channel
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<FramedChannel>> + Send>>;

/// Opens a fresh channel to the claimer
pub type Connector = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

/// One channel to the claimer and the requests waiting on it
struct Connection {
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Mutex<PendingTable>,
    lost: AtomicBool,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn start(inner: &Arc<ClientInner>, channel: FramedChannel) -> Arc<Self> {
        let (outbound, inbound) = channel.into_parts();
        let connection = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            lost: AtomicBool::new(false),
            dispatcher: std::sync::Mutex::new(None),
        });
        let handle = tokio::spawn(dispatch_responses(
            inner.clone(),
            connection.clone(),
            inbound,
        ));
        if let Ok(mut slot) = connection.dispatcher.lock() {
            *slot = Some(handle);
        }
        connection
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        if let Ok(mut slot) = self.dispatcher.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

struct ClientInner {
    client_id: String,
    connection: Mutex<Option<Arc<Connection>>>,
    connector: Option<Connector>,
    request_timeout: Duration,
    max_pending_requests: usize,
    max_message_size: usize,
    stats: Arc<IpcStatistics>,
    closed: AtomicBool,
    disconnected: AtomicBool,
}

/// Connection to the privileged claimer
#[derive(Clone)]
pub struct ClaimClient {
    inner: Arc<ClientInner>,
}

impl ClaimClient {
    /// Start a client over `channel` and spawn its response dispatcher
    ///
    /// The client cannot reconnect once `channel` ends.
    pub fn new(channel: FramedChannel, config: &IpcConfig) -> Self {
        Self::build(channel, config, None)
    }

    /// Start a client over `channel` that reopens it through `connector`
    pub fn with_connector(channel: FramedChannel, config: &IpcConfig, connector: Connector) -> Self {
        Self::build(channel, config, Some(connector))
    }

    /// Open the first channel through `connector` and keep it for reconnects
    pub async fn connect_with(config: &IpcConfig, connector: Connector) -> Result<Self> {
        let channel = connector().await?;
        Ok(Self::with_connector(channel, config, connector))
    }

    /// Connect to the claimer's Unix socket, reconnecting after it restarts
    #[cfg(unix)]
    pub async fn connect(config: &IpcConfig) -> Result<Self> {
        let path = config.socket_path()?;
        let max_message_size = config.max_message_size;
        let connector: Connector = Arc::new(move || -> ConnectFuture {
            let path = path.clone();
            Box::pin(async move { crate::transport::unix::connect(&path, max_message_size).await })
        });
        Self::connect_with(config, connector).await
    }

    fn build(channel: FramedChannel, config: &IpcConfig, connector: Option<Connector>) -> Self {
        let stats = Arc::new(IpcStatistics::new());
        stats.mark_started();

        let inner = Arc::new(ClientInner {
            client_id: config.client_id.clone(),
            connection: Mutex::new(None),
            connector,
            request_timeout: config.request_timeout(),
            max_pending_requests: config.max_pending_requests,
            max_message_size: config.max_message_size,
            stats,
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        });

        let connection = Connection::start(&inner, channel);
        // Not shared yet, so the slot is free
        if let Ok(mut slot) = inner.connection.try_lock() {
            *slot = Some(connection);
        }
        Self { inner }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn statistics(&self) -> Arc<IpcStatistics> {
        self.inner.stats.clone()
    }

    /// Number of requests awaiting a response
    pub async fn pending_count(&self) -> usize {
        let connection = self.inner.connection.lock().await.clone();
        match connection {
            Some(connection) => connection.pending.lock().await.len(),
            None => 0,
        }
    }

    /// Whether no further request can succeed
    ///
    /// True after [`close`](Self::close), or once the channel has ended on a
    /// client that has no connector.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
            || (self.inner.connector.is_none() && !self.is_connected())
    }

    /// Whether the current channel to the claimer is up
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
            && !self.inner.disconnected.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its response
    pub async fn send_request(
        &self,
        command: IpcCommand,
        parameters: impl IntoIterator<Item = (&str, String)>,
    ) -> Result<IpcResponse> {
        let mut request = IpcRequest::new(self.inner.client_id.clone(), command);
        for (key, value) in parameters {
            request = request.with_param(key, value);
        }
        self.send(request).await
    }

    /// Send a prepared request and wait for its response
    ///
    /// Each call records exactly one outcome in the statistics.
    pub async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let inner = &self.inner;
        inner.stats.record_request();
        let started = Instant::now();
        let request_id = request.request_id;

        match self.exchange(request).await {
            Ok(response) => {
                inner
                    .stats
                    .record_response(started.elapsed(), response.success());
                Ok(response)
            }
            Err(e) => {
                if matches!(e, IpcError::Timeout { .. }) {
                    inner.stats.record_timeout();
                } else {
                    inner.stats.record_failure();
                }
                debug!("IPC request {} failed: {}", request_id, e);
                Err(e)
            }
        }
    }

    /// Current channel, reopened through the connector if it has ended
    async fn connection(&self) -> Result<Arc<Connection>> {
        let inner = &self.inner;
        let mut slot = inner.connection.lock().await;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(IpcError::ServiceStopped);
        }
        if let Some(connection) = slot.as_ref()
            && !connection.is_lost()
        {
            return Ok(connection.clone());
        }

        let Some(connector) = inner.connector.as_ref() else {
            return Err(IpcError::ServiceUnavailable(
                "claimer channel closed".to_string(),
            ));
        };
        debug!("Reconnecting to the claimer");
        let channel = connector().await?;
        inner.disconnected.store(false, Ordering::SeqCst);
        let connection = Connection::start(inner, channel);
        *slot = Some(connection.clone());
        info!("Reconnected to the claimer");
        Ok(connection)
    }

    async fn exchange(&self, request: IpcRequest) -> Result<IpcResponse> {
        let inner = &self.inner;
        let request_id = request.request_id;
        let frame = encode_frame(&IpcEnvelope::Request(request), inner.max_message_size)?;
        let connection = self.connection().await?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = connection.pending.lock().await;
            // Checked under the lock so close() and the dispatcher cannot miss
            // this entry
            if inner.closed.load(Ordering::SeqCst) {
                return Err(IpcError::ServiceStopped);
            }
            if connection.is_lost() {
                return Err(IpcError::ServiceUnavailable(
                    "claimer channel closed".to_string(),
                ));
            }
            if pending.len() >= inner.max_pending_requests {
                return Err(IpcError::PendingLimitExceeded {
                    limit: inner.max_pending_requests,
                });
            }
            pending.insert(request_id, tx);
        }

        if connection.outbound.send(frame).await.is_err() {
            connection.pending.lock().await.remove(&request_id);
            return Err(IpcError::ServiceUnavailable(
                "claimer channel closed".to_string(),
            ));
        }

        match tokio::time::timeout(inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: the table was cleared
            Ok(Err(_)) => Err(IpcError::ServiceStopped),
            Err(_) => {
                connection.pending.lock().await.remove(&request_id);
                warn!(
                    "IPC request {} from '{}' timed out after {:?}",
                    request_id, inner.client_id, inner.request_timeout
                );
                Err(IpcError::Timeout {
                    request_id,
                    timeout: inner.request_timeout,
                })
            }
        }
    }

    /// Send a command and unwrap its result, turning rejections into errors
    async fn call(&self, command: IpcCommand, parameters: Vec<(&str, String)>) -> Result<IpcResult> {
        let response = self.send_request(command, parameters).await?;
        response.result.map_err(IpcError::from)
    }

    /// Claim a device
    pub async fn claim_device(&self, bus_id: &BusId) -> Result<ClaimedDevice> {
        match self
            .call(IpcCommand::ClaimDevice, vec![(PARAM_BUS_ID, bus_id.to_string())])
            .await?
        {
            IpcResult::Claimed(device) => Ok(device),
            _ => Err(unexpected(IpcCommand::ClaimDevice)),
        }
    }

    /// Release a device, `Ok(false)` if it was not claimed
    pub async fn release_device(&self, bus_id: &BusId) -> Result<bool> {
        match self
            .call(IpcCommand::ReleaseDevice, vec![(PARAM_BUS_ID, bus_id.to_string())])
            .await?
        {
            IpcResult::Released { was_claimed, .. } => Ok(was_claimed),
            _ => Err(unexpected(IpcCommand::ReleaseDevice)),
        }
    }

    pub async fn claimed_devices(&self) -> Result<Vec<ClaimedDevice>> {
        match self.call(IpcCommand::GetClaimedDevices, Vec::new()).await? {
            IpcResult::ClaimedDevices(devices) => Ok(devices),
            _ => Err(unexpected(IpcCommand::GetClaimedDevices)),
        }
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        match self.call(IpcCommand::GetStatus, Vec::new()).await? {
            IpcResult::Status(status) => Ok(status),
            _ => Err(unexpected(IpcCommand::GetStatus)),
        }
    }

    /// Health-check the claimer, returning its uptime in seconds
    pub async fn health_check(&self) -> Result<u64> {
        match self.call(IpcCommand::HealthCheck, Vec::new()).await? {
            IpcResult::Health {
                healthy: true,
                uptime_secs,
            } => Ok(uptime_secs),
            IpcResult::Health { healthy: false, .. } => Err(IpcError::ServiceUnavailable(
                "claimer reports unhealthy".to_string(),
            )),
            _ => Err(unexpected(IpcCommand::HealthCheck)),
        }
    }

    pub async fn claim_history(&self, limit: Option<usize>) -> Result<Vec<ClaimHistoryEntry>> {
        let params = limit
            .map(|l| vec![(PARAM_LIMIT, l.to_string())])
            .unwrap_or_default();
        match self.call(IpcCommand::GetClaimHistory, params).await? {
            IpcResult::History(entries) => Ok(entries),
            _ => Err(unexpected(IpcCommand::GetClaimHistory)),
        }
    }

    /// Ask the claimer to release everything and exit
    pub async fn shutdown_claimer(&self) -> Result<()> {
        match self.call(IpcCommand::Shutdown, Vec::new()).await? {
            IpcResult::ShutdownAck => Ok(()),
            _ => Err(unexpected(IpcCommand::Shutdown)),
        }
    }

    /// Stop the client, failing every pending request with `ServiceStopped`
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection = self.inner.connection.lock().await.take();
        if let Some(connection) = connection {
            let failed = fail_pending(&connection, || IpcError::ServiceStopped).await;
            if failed > 0 {
                debug!("Failed {} pending IPC request(s) on close", failed);
            }
            connection.abort();
        }
        self.inner.stats.mark_stopped();
    }
}

fn unexpected(command: IpcCommand) -> IpcError {
    IpcError::UnexpectedResponse {
        command: command.to_string(),
    }
}

async fn fail_pending(connection: &Connection, make_error: impl Fn() -> IpcError) -> usize {
    let drained: Vec<_> = connection.pending.lock().await.drain().collect();
    let count = drained.len();
    for (_, tx) in drained {
        let _ = tx.send(Err(make_error()));
    }
    count
}

async fn dispatch_responses(
    inner: Arc<ClientInner>,
    connection: Arc<Connection>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = inbound.recv().await {
        let envelope: IpcEnvelope = match decode_frame(&frame, inner.max_message_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                inner.stats.record_invalid_request();
                warn!("Dropping undecodable IPC frame: {}", e);
                continue;
            }
        };

        let response = match envelope {
            IpcEnvelope::Response(response) => response,
            IpcEnvelope::Request(request) => {
                inner.stats.record_invalid_request();
                warn!(
                    "Ignoring request {} sent to the client side",
                    request.request_id
                );
                continue;
            }
        };

        let waiter = connection.pending.lock().await.remove(&response.request_id);
        match waiter {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    debug!("Caller gave up before its response was delivered");
                }
            }
            None => {
                inner.stats.record_discarded_response();
                warn!(
                    "Discarding response {} with no pending request (late or unknown)",
                    response.request_id
                );
            }
        }
    }

    connection.lost.store(true, Ordering::SeqCst);
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    inner.disconnected.store(true, Ordering::SeqCst);
    fail_pending(&connection, || {
        IpcError::ServiceUnavailable("claimer channel closed".to_string())
    })
    .await;

    if inner.connector.is_some() {
        warn!("Claimer channel closed, reconnecting on next request");
    } else {
        error!("Claimer channel closed");
        inner.stats.mark_stopped();
    }
}
