//! gRPC service implementation for the coordinator
//!
//! Implements the methods defined in coordinator.proto on top of the
//! runtime-core membership registry and round table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use runtime_core::{
    CoordinatorConfig, Error, Rendezvous, RendezvousHandle, Result, WorkerInfo, WorkerRegistry,
    WorkerRegistryHandle,
};

use crate::client::from_wire;
use crate::middleware::{InputValidator, RequestMetrics};
use crate::proto::{
    coordinator_server::Coordinator, ExchangeRequest, ExchangeResponse, HeartbeatRequest,
    HeartbeatResponse, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse,
};

/// Largest message either side encodes or decodes
pub const MAX_MESSAGE_BYTES: usize = 1 << 30;

/// Coordinator gRPC service
#[derive(Clone)]
pub struct CoordinatorService {
    /// Membership of the group
    registry: WorkerRegistryHandle,

    /// Round table completing collectives
    rendezvous: RendezvousHandle,

    /// Bound on a single collective
    collective_timeout: Duration,

    validator: Arc<InputValidator>,

    metrics: Arc<RequestMetrics>,

    /// Server start time for uptime tracking
    start_time: Instant,
}

impl CoordinatorService {
    /// Create a service for a group of `world_size` ranks
    pub fn new(world_size: usize, config: &CoordinatorConfig) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world_size must be at least 1".to_string(),
            });
        }

        info!(
            world_size = world_size,
            collective_timeout_ms = config.collective_timeout.as_millis(),
            heartbeat_timeout_ms = config.heartbeat_timeout.as_millis(),
            "Creating coordinator service"
        );

        Ok(Self {
            registry: Arc::new(WorkerRegistry::new(world_size, config.heartbeat_timeout)),
            rendezvous: Arc::new(Rendezvous::new(world_size)),
            collective_timeout: config.collective_timeout,
            validator: Arc::new(InputValidator::new(MAX_MESSAGE_BYTES)?),
            metrics: Arc::new(RequestMetrics::new()),
            start_time: Instant::now(),
        })
    }

    pub fn registry(&self) -> &WorkerRegistryHandle {
        &self.registry
    }

    pub fn rendezvous(&self) -> &RendezvousHandle {
        &self.rendezvous
    }

    pub fn metrics(&self) -> &Arc<RequestMetrics> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Periodically mark members that stopped heartbeating and fail the group
    ///
    /// Ranks blocked in a collective are released with an error instead of
    /// waiting out the collective timeout behind a dead peer.
    pub fn spawn_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let rendezvous = self.rendezvous.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let dead = registry.check_dead_workers();
                if !dead.is_empty() {
                    rendezvous.fail(format!("ranks {:?} missed heartbeats", dead));
                }
            }
        })
    }

    fn observe<T>(&self, method: &str, start: Instant, result: &std::result::Result<T, Status>) {
        self.metrics.record(method, start.elapsed(), result.is_err());
        if let Err(status) = result {
            debug!(method = method, code = ?status.code(), message = %status.message(), "Request failed");
        }
    }

    fn handle_join(&self, req: JoinRequest) -> std::result::Result<JoinResponse, Status> {
        self.validator.validate_hostname(&req.hostname)?;

        if let Some(reason) = self.rendezvous.failure() {
            return Err(Status::aborted(format!("process group failed: {}", reason)));
        }

        let world_size = self.registry.world_size();
        let member = WorkerInfo::new(req.rank as usize, req.world_size as usize, req.hostname);

        let (accepted, reason) = match self.registry.join(member) {
            Ok(()) => (true, String::new()),
            Err(e @ Error::ShardTopology { .. }) | Err(e @ Error::Coordination { .. }) => {
                warn!(rank = req.rank, error = %e, "Join rejected");
                (false, e.to_string())
            }
            Err(e) => return Err(to_status(e)),
        };

        Ok(JoinResponse {
            accepted,
            world_size: world_size as u32,
            reason,
            active_members: self.registry.active_count() as u32,
        })
    }

    async fn handle_exchange(
        &self,
        req: ExchangeRequest,
    ) -> std::result::Result<ExchangeResponse, Status> {
        let rank = self
            .validator
            .validate_rank(req.rank, self.registry.world_size())?;
        self.validator.validate_payloads(&req.payloads)?;
        let kind = from_wire(req.kind(), req.root as usize);

        match self.registry.get(rank) {
            Some(member) if member.state.is_active() => {}
            Some(member) => {
                return Err(Status::failed_precondition(format!(
                    "rank {} is {:?}",
                    rank, member.state
                )))
            }
            None => {
                return Err(Status::failed_precondition(format!(
                    "rank {} has not joined",
                    rank
                )))
            }
        }

        let payloads = self
            .rendezvous
            .exchange(
                rank,
                req.seq,
                kind,
                req.payloads.into_iter().map(Bytes::from).collect(),
                self.collective_timeout,
            )
            .await
            .map_err(to_status)?;

        Ok(ExchangeResponse {
            payloads: payloads.into_iter().map(|p| p.to_vec()).collect(),
        })
    }

    fn handle_heartbeat(
        &self,
        req: HeartbeatRequest,
    ) -> std::result::Result<HeartbeatResponse, Status> {
        let state = self
            .registry
            .heartbeat(req.rank as usize)
            .map_err(|e| Status::not_found(e.to_string()))?;

        Ok(HeartbeatResponse {
            state: format!("{:?}", state).to_lowercase(),
            server_timestamp_ms: Utc::now().timestamp_millis(),
            failure: self.rendezvous.failure().unwrap_or_default(),
        })
    }

    fn handle_leave(&self, req: LeaveRequest) -> std::result::Result<LeaveResponse, Status> {
        let rank = req.rank as usize;
        self.registry
            .leave(rank)
            .map_err(|e| Status::not_found(e.to_string()))?;

        let pending = self.rendezvous.pending_rounds();
        if pending > 0 {
            self.rendezvous.fail(format!(
                "rank {} left with {} collectives pending",
                rank, pending
            ));
        }

        Ok(LeaveResponse { acknowledged: true })
    }
}

/// Map a runtime error onto the closest gRPC status
fn to_status(error: Error) -> Status {
    let message = error.to_string();
    match error {
        Error::Coordination { .. } => Status::unavailable(message),
        Error::ShardTopology { .. } => Status::failed_precondition(message),
        Error::InvalidConfig { .. } => Status::invalid_argument(message),
        _ => Status::internal(message),
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinResponse>, Status> {
        let start = Instant::now();
        let result = self.handle_join(request.into_inner());
        self.observe("join", start, &result);
        result.map(Response::new)
    }

    async fn exchange(
        &self,
        request: Request<ExchangeRequest>,
    ) -> std::result::Result<Response<ExchangeResponse>, Status> {
        let start = Instant::now();
        let result = self.handle_exchange(request.into_inner()).await;
        self.observe("exchange", start, &result);
        result.map(Response::new)
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> std::result::Result<Response<HeartbeatResponse>, Status> {
        let start = Instant::now();
        let result = self.handle_heartbeat(request.into_inner());
        self.observe("heartbeat", start, &result);
        result.map(Response::new)
    }

    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> std::result::Result<Response<LeaveResponse>, Status> {
        let start = Instant::now();
        let result = self.handle_leave(request.into_inner());
        self.observe("leave", start, &result);
        result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            collective_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn join_request(rank: u32, world_size: u32) -> Request<JoinRequest> {
        Request::new(JoinRequest {
            rank,
            world_size,
            hostname: format!("node-{}", rank),
        })
    }

    #[tokio::test]
    async fn test_join_reports_world_mismatch() {
        let service = CoordinatorService::new(2, &config()).unwrap();

        let response = service.join(join_request(0, 2)).await.unwrap().into_inner();
        assert!(response.accepted);
        assert_eq!(response.active_members, 1);

        let response = service.join(join_request(1, 3)).await.unwrap().into_inner();
        assert!(!response.accepted);
        assert_eq!(response.world_size, 2);

        let response = service.join(join_request(0, 2)).await.unwrap().into_inner();
        assert!(!response.accepted, "rank 0 joined twice");
    }

    #[tokio::test]
    async fn test_exchange_orders_payloads_by_rank() {
        let service = CoordinatorService::new(2, &config()).unwrap();
        service.join(join_request(0, 2)).await.unwrap();
        service.join(join_request(1, 2)).await.unwrap();
        assert!(service.registry().is_complete());

        let mut handles = Vec::new();
        for rank in [1u32, 0] {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .exchange(Request::new(ExchangeRequest {
                        rank,
                        seq: 0,
                        payloads: vec![vec![rank as u8; 3]],
                        ..Default::default()
                    }))
                    .await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap().unwrap().into_inner();
            assert_eq!(response.payloads, vec![vec![0u8; 3], vec![1u8; 3]]);
        }
        assert_eq!(service.metrics().method("exchange").unwrap().requests, 2);
    }

    #[tokio::test]
    async fn test_scatter_returns_only_own_slot() {
        let service = CoordinatorService::new(3, &config()).unwrap();
        for rank in 0..3 {
            service.join(join_request(rank, 3)).await.unwrap();
        }

        let mut handles = Vec::new();
        for rank in 0..3u32 {
            let service = service.clone();
            let payloads = if rank == 2 {
                (0..3u8).map(|r| vec![r; 100]).collect()
            } else {
                Vec::new()
            };
            let mut request = ExchangeRequest {
                rank,
                seq: 0,
                payloads,
                root: 2,
                ..Default::default()
            };
            request.set_kind(crate::proto::RoundKind::Scatter);
            handles.push(tokio::spawn(async move {
                service.exchange(Request::new(request)).await
            }));
        }

        for (rank, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap().unwrap().into_inner();
            assert_eq!(response.payloads, vec![vec![rank as u8; 100]]);
        }
    }

    #[tokio::test]
    async fn test_exchange_requires_membership() {
        let service = CoordinatorService::new(2, &config()).unwrap();

        let status = service
            .exchange(Request::new(ExchangeRequest {
                rank: 1,
                seq: 0,
                payloads: vec![Vec::new()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status = service
            .exchange(Request::new(ExchangeRequest {
                rank: 5,
                seq: 0,
                payloads: vec![Vec::new()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(service.metrics().method("exchange").unwrap().errors, 2);
    }

    #[tokio::test]
    async fn test_missed_heartbeats_release_waiting_ranks() {
        let config = CoordinatorConfig {
            collective_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let service = CoordinatorService::new(2, &config).unwrap();
        service.join(join_request(0, 2)).await.unwrap();
        service.join(join_request(1, 2)).await.unwrap();
        let monitor = service.spawn_monitor(Duration::from_millis(10));

        // Rank 1 never arrives and never heartbeats
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            service.exchange(Request::new(ExchangeRequest {
                rank: 0,
                seq: 0,
                payloads: vec![Vec::new()],
                ..Default::default()
            })),
        )
        .await
        .expect("waiting rank was not released");
        monitor.abort();

        assert_eq!(result.unwrap_err().code(), tonic::Code::Unavailable);
        assert!(service.rendezvous().failure().is_some());

        let heartbeat = service
            .heartbeat(Request::new(HeartbeatRequest { rank: 1 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(heartbeat.state, "dead");
        assert!(!heartbeat.failure.is_empty());
    }

    #[tokio::test]
    async fn test_leave_with_pending_round_fails_group() {
        let service = CoordinatorService::new(2, &config()).unwrap();
        service.join(join_request(0, 2)).await.unwrap();
        service.join(join_request(1, 2)).await.unwrap();

        let waiting = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .exchange(Request::new(ExchangeRequest {
                        rank: 0,
                        seq: 0,
                        payloads: vec![Vec::new()],
                        ..Default::default()
                    }))
                    .await
            })
        };
        while service.rendezvous().pending_rounds() == 0 {
            tokio::task::yield_now().await;
        }

        let ack = service
            .leave(Request::new(LeaveRequest { rank: 1 }))
            .await
            .unwrap()
            .into_inner();
        assert!(ack.acknowledged);

        let status = waiting.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(
            service.join(join_request(1, 2)).await.unwrap_err().code(),
            tonic::Code::Aborted
        );
    }
}
