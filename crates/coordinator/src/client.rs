//! Process group backed by the coordinator gRPC service

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing::{debug, info, instrument, warn};

use runtime_core::{
    hostname, CoordinatorConfig, Error, LaunchInfo, ProcessGroup, Rank, Result, RoundKind,
};

use crate::proto::{
    self, coordinator_client::CoordinatorClient, ExchangeRequest, HeartbeatRequest, JoinRequest,
    LeaveRequest,
};
use crate::service::MAX_MESSAGE_BYTES;

/// Delay between connection attempts while the coordinator comes up
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// One rank's membership in a group hosted by a remote coordinator
///
/// Heartbeats run on a background task for as long as the group is alive.
pub struct GrpcProcessGroup {
    rank: Rank,
    world_size: usize,
    client: CoordinatorClient<Channel>,
    collective_timeout: Duration,
    heartbeat: JoinHandle<()>,
}

impl GrpcProcessGroup {
    /// Connect using the launcher-supplied identity
    ///
    /// `COORDINATOR_ADDR` wins over the configured address.
    pub async fn from_launch(info: &LaunchInfo, config: &CoordinatorConfig) -> Result<Self> {
        let address = info
            .coordinator_addr
            .clone()
            .unwrap_or_else(|| config.address.clone());
        Self::connect(address, info.rank, info.world_size, config).await
    }

    /// Connect to the coordinator at `address` and register as `rank`
    ///
    /// Connection attempts are retried until the join timeout; a rejected
    /// registration is fatal.
    #[instrument(skip(address, config), fields(address = %address))]
    pub async fn connect(
        address: String,
        rank: Rank,
        world_size: usize,
        config: &CoordinatorConfig,
    ) -> Result<Self> {
        let deadline = Instant::now() + config.join_timeout;

        let channel = loop {
            match Channel::from_shared(address.clone())
                .map_err(|e| Error::InvalidConfig {
                    message: format!("invalid coordinator address {}: {}", address, e),
                })?
                .connect()
                .await
            {
                Ok(channel) => break channel,
                Err(e) if Instant::now() < deadline => {
                    debug!(error = %e, "Coordinator not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(e) => {
                    return Err(Error::coordination(
                        "join",
                        format!(
                            "coordinator {} unreachable after {:?}: {}",
                            address, config.join_timeout, e
                        ),
                    ))
                }
            }
        };

        let mut client = CoordinatorClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);

        let response = client
            .join(JoinRequest {
                rank: rank as u32,
                world_size: world_size as u32,
                hostname: hostname(),
            })
            .await
            .map_err(|status| Error::coordination("join", status.message().to_string()))?
            .into_inner();

        if !response.accepted {
            if response.world_size as usize != world_size {
                return Err(Error::ShardTopology {
                    expected_world_size: response.world_size as usize,
                    actual_world_size: world_size,
                });
            }
            return Err(Error::coordination("join", response.reason));
        }

        info!(
            rank = rank,
            world_size = world_size,
            active_members = response.active_members,
            "Registered with coordinator"
        );

        let heartbeat = spawn_heartbeat(client.clone(), rank, config.heartbeat_interval);

        Ok(Self {
            rank,
            world_size,
            client,
            collective_timeout: config.collective_timeout,
            heartbeat,
        })
    }

    /// Leave the group; the coordinator fails it if collectives are pending
    pub async fn leave(&self) -> Result<()> {
        self.heartbeat.abort();
        self.client
            .clone()
            .leave(LeaveRequest {
                rank: self.rank as u32,
            })
            .await
            .map_err(|status| Error::coordination("leave", status.message().to_string()))?;
        info!(rank = self.rank, "Left process group");
        Ok(())
    }
}

impl Drop for GrpcProcessGroup {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[async_trait]
impl ProcessGroup for GrpcProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn exchange(
        &self,
        seq: u64,
        kind: RoundKind,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<Bytes>> {
        let (wire_kind, root) = to_wire(kind);
        let mut request = ExchangeRequest {
            rank: self.rank as u32,
            seq,
            payloads: payloads.iter().map(|p| p.to_vec()).collect(),
            kind: 0,
            root: root as u32,
        };
        request.set_kind(wire_kind);

        // The server enforces the collective timeout; the margin covers transport
        let bound = self.collective_timeout + Duration::from_secs(5);
        let response = tokio::time::timeout(bound, self.client.clone().exchange(request))
            .await
            .map_err(|_| {
                Error::coordination("exchange", format!("no response after {:?}", bound))
            })?
            .map_err(|status| Error::coordination("exchange", status.message().to_string()))?
            .into_inner();

        Ok(response.payloads.into_iter().map(Bytes::from).collect())
    }
}

/// Split a round kind into its wire enum and root
pub(crate) fn to_wire(kind: RoundKind) -> (proto::RoundKind, Rank) {
    match kind {
        RoundKind::AllGather => (proto::RoundKind::AllGather, 0),
        RoundKind::Gather { root } => (proto::RoundKind::Gather, root),
        RoundKind::Scatter { root } => (proto::RoundKind::Scatter, root),
    }
}

/// Inverse of [`to_wire`]
pub(crate) fn from_wire(kind: proto::RoundKind, root: Rank) -> RoundKind {
    match kind {
        proto::RoundKind::AllGather => RoundKind::AllGather,
        proto::RoundKind::Gather => RoundKind::Gather { root },
        proto::RoundKind::Scatter => RoundKind::Scatter { root },
    }
}

fn spawn_heartbeat(
    mut client: CoordinatorClient<Channel>,
    rank: Rank,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match client
                .heartbeat(HeartbeatRequest { rank: rank as u32 })
                .await
            {
                Ok(response) => {
                    let response = response.into_inner();
                    if !response.failure.is_empty() {
                        warn!(rank = rank, failure = %response.failure, "Process group failed");
                        break;
                    }
                }
                Err(status) => {
                    warn!(rank = rank, error = %status.message(), "Heartbeat failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_coordinator_times_out() {
        let config = CoordinatorConfig {
            join_timeout: Duration::from_millis(300),
            ..Default::default()
        };

        // Port 9 (discard) is not a gRPC server
        let result =
            GrpcProcessGroup::connect("http://127.0.0.1:9".to_string(), 0, 1, &config).await;
        assert!(matches!(result, Err(Error::Coordination { .. })));
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let result = GrpcProcessGroup::connect(
            "not a uri".to_string(),
            0,
            1,
            &CoordinatorConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_round_kind_wire_mapping() {
        for kind in [
            RoundKind::AllGather,
            RoundKind::Gather { root: 2 },
            RoundKind::Scatter { root: 1 },
        ] {
            let (wire, root) = to_wire(kind);
            assert_eq!(from_wire(wire, root), kind);
        }
    }
}
