//! Claimer-side IPC server
//!
//! Reads request frames from each connected daemon, authenticates the
//! caller, runs the command against the [`ClaimService`] and writes the
//! response back. Requests on one channel are handled concurrently so a slow
//! hardware claim does not hold up a health check.

use crate::auth::ClientAuthenticator;
use crate::config::IpcConfig;
use crate::error::{IpcError, IpcFailure, Result};
use crate::framing::{decode_frame, encode_frame};
use crate::message::{
    IpcCommand, IpcEnvelope, IpcRequest, IpcResponse, IpcResult, PARAM_LIMIT, ServiceStatus,
};
use crate::pool::ConnectionPool;
use crate::service::ClaimService;
use crate::stats::IpcStatistics;
use crate::transport::FramedChannel;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct IpcServer {
    config: IpcConfig,
    service: Arc<ClaimService>,
    auth: ClientAuthenticator,
    stats: Arc<IpcStatistics>,
    pool: Arc<ConnectionPool>,
}

impl IpcServer {
    pub fn new(service: Arc<ClaimService>, config: IpcConfig) -> Arc<Self> {
        let stats = Arc::new(IpcStatistics::new());
        stats.mark_started();
        Arc::new(Self {
            auth: ClientAuthenticator::new(config.authorized_clients.clone(), stats.clone()),
            pool: ConnectionPool::new(config.max_connections),
            config,
            service,
            stats,
        })
    }

    pub fn statistics(&self) -> Arc<IpcStatistics> {
        self.stats.clone()
    }

    pub fn service(&self) -> &Arc<ClaimService> {
        &self.service
    }

    /// Number of connected IPC clients
    pub fn active_connections(&self) -> usize {
        self.pool.active_count()
    }

    /// Gate a client id; a rejected id stays rejected for every command
    pub async fn authenticate_client(&self, client_id: &str) -> bool {
        self.auth.authenticate(client_id).await.is_accepted()
    }

    /// Run one request and build its response
    pub async fn handle_request(&self, request: IpcRequest) -> IpcResponse {
        self.stats.record_request();
        let started = Instant::now();

        let request_id = request.request_id;
        let response = match self.dispatch(&request).await {
            Ok(result) => IpcResponse::ok(request_id, result),
            Err(failure) => {
                debug!(
                    "Request {} ({}) from '{}' rejected: {}",
                    request_id, request.command, request.client_id, failure
                );
                IpcResponse::failure(request_id, failure)
            }
        };

        self.stats
            .record_response(started.elapsed(), response.success());
        response
    }

    async fn dispatch(&self, request: &IpcRequest) -> std::result::Result<IpcResult, IpcFailure> {
        if !self.authenticate_client(&request.client_id).await {
            return Err(IpcFailure::AuthenticationFailed {
                client_id: request.client_id.clone(),
            });
        }

        let owner = request.client_id.as_str();
        match request.command {
            IpcCommand::ClaimDevice => {
                let bus_id = self.require_bus_id(request)?;
                let device = self.service.claim_device(owner, &bus_id).await?;
                Ok(IpcResult::Claimed(device))
            }
            IpcCommand::ReleaseDevice => {
                let bus_id = self.require_bus_id(request)?;
                let was_claimed = self.service.release_device(owner, &bus_id).await?;
                Ok(IpcResult::Released {
                    bus_id,
                    was_claimed,
                })
            }
            IpcCommand::GetClaimedDevices => Ok(IpcResult::ClaimedDevices(
                self.service.claimed_devices().await,
            )),
            IpcCommand::GetStatus => Ok(IpcResult::Status(self.status().await)),
            IpcCommand::HealthCheck => Ok(IpcResult::Health {
                healthy: !self.service.is_shutting_down(),
                uptime_secs: self.service.uptime_secs(),
            }),
            IpcCommand::GetClaimHistory => {
                let limit = match request.parameters.get(PARAM_LIMIT) {
                    Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
                        self.stats.record_invalid_request();
                        IpcFailure::InvalidRequest {
                            reason: format!("'{}' is not a valid {}", raw, PARAM_LIMIT),
                        }
                    })?),
                    None => None,
                };
                Ok(IpcResult::History(self.service.history(limit).await))
            }
            IpcCommand::Shutdown => {
                info!("Shutdown requested by '{}'", owner);
                self.service.request_shutdown();
                Ok(IpcResult::ShutdownAck)
            }
        }
    }

    fn require_bus_id(&self, request: &IpcRequest) -> std::result::Result<protocol::BusId, IpcFailure> {
        request.bus_id().inspect_err(|_| self.stats.record_invalid_request())
    }

    /// Current service status
    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            service_name: self.config.service_name.clone(),
            started_at: self.service.started_at(),
            uptime_secs: self.service.uptime_secs(),
            claimed_devices: self.service.claim_count().await,
            shutting_down: self.service.is_shutting_down(),
            statistics: self.stats.snapshot(),
        }
    }

    /// Encode a response, refusing it if it exceeds `max_message_size`
    ///
    /// Nothing is transmitted when this fails.
    pub fn build_response_frame(&self, response: &IpcResponse) -> Result<Vec<u8>> {
        encode_frame(
            &IpcEnvelope::Response(response.clone()),
            self.config.max_message_size,
        )
    }

    /// Encode a response, substituting a size failure for an oversized one
    fn encode_response(&self, response: IpcResponse) -> Option<Vec<u8>> {
        match self.build_response_frame(&response) {
            Ok(frame) => Some(frame),
            Err(IpcError::MessageTooLarge { size, max }) => {
                warn!(
                    "Response to {} is {} bytes (max {}), sending size failure instead",
                    response.request_id, size, max
                );
                let fallback = IpcResponse::failure(
                    response.request_id,
                    IpcFailure::ResponseTooLarge { size, max },
                );
                self.build_response_frame(&fallback).ok()
            }
            Err(e) => {
                error!("Failed to encode response {}: {}", response.request_id, e);
                None
            }
        }
    }

    /// Serve one client channel until it closes
    ///
    /// Fails with [`IpcError::ConnectionLimit`] without reading anything if
    /// `max_connections` channels are already being served.
    pub async fn serve_channel(self: &Arc<Self>, channel: FramedChannel) -> Result<()> {
        let Some(_guard) = self.pool.try_acquire() else {
            self.stats.record_connection_rejected();
            warn!(
                "Rejecting IPC connection: {} of {} slots in use",
                self.pool.active_count(),
                self.pool.max_connections()
            );
            return Err(IpcError::ConnectionLimit {
                max: self.pool.max_connections(),
            });
        };
        self.stats.record_connection_accepted();

        let (outbound, mut inbound) = channel.into_parts();
        while let Some(frame) = inbound.recv().await {
            let request = match decode_frame::<IpcEnvelope>(&frame, self.config.max_message_size) {
                Ok(IpcEnvelope::Request(request)) => request,
                Ok(IpcEnvelope::Response(response)) => {
                    self.stats.record_invalid_request();
                    warn!("Ignoring response {} sent to the claimer", response.request_id);
                    continue;
                }
                Err(e) => {
                    self.stats.record_invalid_request();
                    warn!("Dropping undecodable IPC frame: {}", e);
                    continue;
                }
            };

            self.spawn_request(request, outbound.clone());
        }

        debug!("IPC channel closed");
        Ok(())
    }

    fn spawn_request(self: &Arc<Self>, request: IpcRequest, outbound: mpsc::Sender<Vec<u8>>) {
        let server = self.clone();
        tokio::spawn(async move {
            let response = server.handle_request(request).await;
            let request_id = response.request_id;
            if let Some(frame) = server.encode_response(response)
                && outbound.send(frame).await.is_err()
            {
                debug!("Client left before response {} was sent", request_id);
            }
        });
    }

    /// Accept connections on a Unix socket until shutdown is requested
    #[cfg(unix)]
    pub async fn serve_unix(self: Arc<Self>, listener: tokio::net::UnixListener) -> Result<()> {
        info!("Claim service '{}' listening", self.config.service_name);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let channel =
                        crate::transport::unix::attach(stream, self.config.max_message_size);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_channel(channel).await {
                            warn!("IPC connection ended: {}", e);
                        }
                    });
                }
                _ = self.service.wait_for_shutdown() => {
                    info!("Claim service stopped accepting connections");
                    break;
                }
            }
        }
        self.stats.mark_stopped();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClaimState, PARAM_BUS_ID};
    use crate::testing::StaticClaimBackend;

    fn server() -> Arc<IpcServer> {
        let backend = Arc::new(StaticClaimBackend::with_devices(["1-1", "1-2"]));
        let service = Arc::new(ClaimService::new("test", backend, 16));
        IpcServer::new(service, IpcConfig::default())
    }

    #[tokio::test]
    async fn test_claim_command() {
        let server = server();
        let request =
            IpcRequest::new("usbipd", IpcCommand::ClaimDevice).with_param(PARAM_BUS_ID, "1-1");
        let response = server.handle_request(request).await;

        let Ok(IpcResult::Claimed(device)) = response.result else {
            panic!("Expected Claimed, got {:?}", response.result);
        };
        assert_eq!(device.claim_state, ClaimState::Claimed);
        assert_eq!(server.statistics().successes(), 1);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_invalid() {
        let server = server();
        let response = server
            .handle_request(IpcRequest::new("usbipd", IpcCommand::ReleaseDevice))
            .await;

        assert!(matches!(
            response.result,
            Err(IpcFailure::InvalidRequest { .. })
        ));
        assert_eq!(server.statistics().invalid_requests(), 1);
    }

    #[tokio::test]
    async fn test_health_reflects_shutdown() {
        let server = server();
        let health = server
            .handle_request(IpcRequest::new("usbipd", IpcCommand::HealthCheck))
            .await;
        assert!(matches!(
            health.result,
            Ok(IpcResult::Health { healthy: true, .. })
        ));

        server
            .handle_request(IpcRequest::new("usbipd", IpcCommand::Shutdown))
            .await;
        assert!(server.service().is_shutting_down());

        let health = server
            .handle_request(IpcRequest::new("usbipd", IpcCommand::HealthCheck))
            .await;
        assert!(matches!(
            health.result,
            Ok(IpcResult::Health { healthy: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_status_counts_claims() {
        let server = server();
        server
            .handle_request(
                IpcRequest::new("usbipd", IpcCommand::ClaimDevice).with_param(PARAM_BUS_ID, "1-2"),
            )
            .await;

        let status = server.status().await;
        assert_eq!(status.claimed_devices, 1);
        assert_eq!(status.service_name, IpcConfig::default().service_name);
        assert_eq!(status.statistics.requests, 1);
    }
}
