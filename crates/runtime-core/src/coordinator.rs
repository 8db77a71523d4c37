//! Process identity and typed collectives for one rank

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::collective::{ProcessGroup, RoundKind};
use crate::{Error, Rank, Result};

/// Launch identity handed to this process by the external launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInfo {
    pub rank: Rank,
    pub world_size: usize,
    pub coordinator_addr: Option<String>,
}

impl LaunchInfo {
    /// Read `RANK`, `WORLD_SIZE` and optionally `COORDINATOR_ADDR`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse = |key: &str| -> Result<usize> {
            let raw = lookup(key).ok_or_else(|| Error::InvalidConfig {
                message: format!("{} is not set", key),
            })?;
            raw.trim().parse().map_err(|_| Error::InvalidConfig {
                message: format!("{}={} is not a non-negative integer", key, raw),
            })
        };

        let rank = parse("RANK")?;
        let world_size = parse("WORLD_SIZE")?;
        if world_size == 0 || rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("RANK={} is invalid for WORLD_SIZE={}", rank, world_size),
            });
        }

        Ok(Self {
            rank,
            world_size,
            coordinator_addr: lookup("COORDINATOR_ADDR"),
        })
    }
}

/// Handshake exchanged by every rank when joining
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberHello {
    rank: Rank,
    world_size: usize,
    hostname: String,
}

/// Owns this process's rank and issues collectives on its behalf
///
/// Every rank must call the collectives in the same order and the same
/// number of times; the sequence counter ties the n-th call on one rank to
/// the n-th call on every other rank.
pub struct WorkerCoordinator {
    group: Arc<dyn ProcessGroup>,
    seq: AtomicU64,
}

/// Thread-safe handle to a coordinator
pub type WorkerCoordinatorHandle = Arc<WorkerCoordinator>;

impl WorkerCoordinator {
    /// Join the group, failing fatally if it does not complete in `timeout`
    #[instrument(skip(group), fields(rank = group.rank(), world_size = group.world_size()))]
    pub async fn join(group: Arc<dyn ProcessGroup>, timeout: Duration) -> Result<Self> {
        let coordinator = Self {
            group,
            seq: AtomicU64::new(0),
        };

        let hello = MemberHello {
            rank: coordinator.rank(),
            world_size: coordinator.world_size(),
            hostname: hostname(),
        };

        let members: Vec<MemberHello> =
            tokio::time::timeout(timeout, coordinator.all_gather("join", &hello))
                .await
                .map_err(|_| {
                    Error::coordination("join", format!("group incomplete after {:?}", timeout))
                })??;

        for (index, member) in members.iter().enumerate() {
            if member.world_size != hello.world_size {
                return Err(Error::ShardTopology {
                    expected_world_size: hello.world_size,
                    actual_world_size: member.world_size,
                });
            }
            if member.rank != index {
                return Err(Error::coordination(
                    "join",
                    format!(
                        "slot {} answered as rank {} from host {}",
                        index, member.rank, member.hostname
                    ),
                ));
            }
        }

        info!(
            rank = hello.rank,
            world_size = hello.world_size,
            hostname = %hello.hostname,
            "Joined process group"
        );

        Ok(coordinator)
    }

    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Rank 0 leads leader-only work (commit, retention, logging summaries)
    pub fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Number of collectives issued so far
    pub fn collectives_issued(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Run one round, tagging failures with `operation`
    async fn round(
        &self,
        operation: &str,
        kind: RoundKind,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<Bytes>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        debug!(seq = seq, operation = operation, rank = self.rank(), kind = ?kind, "Collective");

        let received = self
            .group
            .exchange(seq, kind, payloads)
            .await
            .map_err(|e| match e {
                Error::Coordination { reason, .. } => Error::coordination(operation, reason),
                other => other,
            })?;

        let expected = kind.delivery_len(self.rank(), self.world_size());
        if received.len() != expected {
            return Err(Error::coordination(
                operation,
                format!(
                    "expected {} payloads, got {}",
                    expected,
                    received.len()
                ),
            ));
        }
        Ok(received)
    }

    /// Every rank rejects a bad root before any round is issued
    fn check_root(&self, operation: &str, root: Rank) -> Result<()> {
        if root >= self.world_size() {
            return Err(Error::coordination(
                operation,
                format!("root {} out of range", root),
            ));
        }
        Ok(())
    }

    /// All-gather raw payloads, tagging failures with `operation`
    pub async fn all_gather_bytes(&self, operation: &str, payload: Bytes) -> Result<Vec<Bytes>> {
        self.round(operation, RoundKind::AllGather, vec![payload])
            .await
    }

    /// All-gather a serializable value, one entry per rank
    pub async fn all_gather<T>(&self, operation: &str, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = Bytes::from(bincode::serialize(value)?);
        decode_all(self.all_gather_bytes(operation, payload).await?)
    }

    /// Deliver `root`'s value to every rank
    pub async fn broadcast<T>(&self, operation: &str, value: Option<&T>, root: Rank) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.check_root(operation, root)?;

        // Non-root ranks contribute empty payloads; only the root's is decoded
        let payload = if self.rank() == root {
            bincode::serialize(&value)?
        } else {
            Vec::new()
        };
        let gathered = self
            .round(operation, RoundKind::AllGather, vec![Bytes::from(payload)])
            .await?;
        let value: Option<T> = bincode::deserialize(&gathered[root])?;
        value.ok_or_else(|| {
            Error::coordination(operation, format!("root {} supplied no value", root))
        })
    }

    /// Collect every rank's value on `root`; other ranks receive `None`
    ///
    /// Only `root` receives the payloads.
    pub async fn gather<T>(&self, operation: &str, value: &T, root: Rank) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.check_root(operation, root)?;

        let payload = Bytes::from(bincode::serialize(value)?);
        let received = self
            .round(operation, RoundKind::Gather { root }, vec![payload])
            .await?;
        if self.rank() == root {
            decode_all(received).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Hand each rank its own element of `root`'s vector
    ///
    /// Each rank receives only its element. When `root` has no vector, or
    /// one of the wrong length, every rank fails.
    pub async fn scatter<T>(&self, operation: &str, values: Option<Vec<T>>, root: Rank) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.check_root(operation, root)?;
        let world_size = self.world_size();

        let payloads = if self.rank() == root {
            match values.filter(|v| v.len() == world_size) {
                Some(values) => values
                    .iter()
                    .map(|v| bincode::serialize(&Some(v)).map(Bytes::from))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                None => {
                    let missing = Bytes::from(bincode::serialize(&None::<T>)?);
                    vec![missing; world_size]
                }
            }
        } else {
            Vec::new()
        };

        let received = self
            .round(operation, RoundKind::Scatter { root }, payloads)
            .await?;
        let mine: Option<T> = bincode::deserialize(&received[0])?;
        mine.ok_or_else(|| {
            Error::coordination(
                operation,
                format!("root {} did not supply one value per rank", root),
            )
        })
    }

    /// Elementwise sum across ranks, accumulated in rank order
    pub async fn reduce_sum(&self, operation: &str, values: &[f64]) -> Result<Vec<f64>> {
        let gathered: Vec<Vec<f64>> = self.all_gather(operation, &values.to_vec()).await?;

        let mut sum = vec![0.0; values.len()];
        for (rank, contribution) in gathered.iter().enumerate() {
            if contribution.len() != values.len() {
                return Err(Error::coordination(
                    operation,
                    format!(
                        "rank {} contributed {} values, expected {}",
                        rank,
                        contribution.len(),
                        values.len()
                    ),
                ));
            }
            for (acc, value) in sum.iter_mut().zip(contribution) {
                *acc += value;
            }
        }
        Ok(sum)
    }

    /// Collective average of one scalar
    pub async fn reduce_mean(&self, operation: &str, value: f64) -> Result<f64> {
        let sum = self.reduce_sum(operation, &[value]).await?;
        Ok(sum[0] / self.world_size() as f64)
    }

    /// Block until every rank arrives
    pub async fn barrier(&self, operation: &str) -> Result<()> {
        self.all_gather_bytes(operation, Bytes::new()).await?;
        Ok(())
    }
}

fn decode_all<T: DeserializeOwned>(payloads: Vec<Bytes>) -> Result<Vec<T>> {
    payloads
        .iter()
        .map(|bytes| bincode::deserialize(bytes).map_err(Error::from))
        .collect()
}

/// Host name reported to peers, from `HOSTNAME`
pub fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalProcessGroup;
    use std::collections::HashMap;
    use std::future::Future;

    /// Run `f` once per rank over an in-process group and collect results by rank
    async fn run_group<F, Fut, T>(world_size: usize, f: F) -> Vec<Result<T>>
    where
        F: Fn(WorkerCoordinator) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut handles = Vec::new();
        for member in LocalProcessGroup::new_group(world_size, Duration::from_secs(5)) {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                let coordinator =
                    WorkerCoordinator::join(Arc::new(member), Duration::from_secs(5)).await?;
                f(coordinator).await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[test]
    fn test_launch_info_from_lookup() {
        let env: HashMap<&str, &str> = [("RANK", "1"), ("WORLD_SIZE", "4")].into();
        let info = LaunchInfo::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(info.rank, 1);
        assert_eq!(info.world_size, 4);
        assert_eq!(info.coordinator_addr, None);

        let env: HashMap<&str, &str> = [("RANK", "4"), ("WORLD_SIZE", "4")].into();
        let result = LaunchInfo::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_reduce_mean_is_deterministic() {
        let results = run_group(4, |c| async move {
            let value = (c.rank() + 1) as f64;
            c.reduce_mean("loss", value).await
        })
        .await;

        for result in results {
            assert_eq!(result.unwrap(), 2.5);
        }
    }

    #[tokio::test]
    async fn test_broadcast_and_scatter() {
        let results = run_group(3, |c| async move {
            let greeting = c
                .broadcast("greeting", c.is_leader().then_some(&"hello".to_string()), 0)
                .await?;
            let values = c.is_leader().then(|| vec![10u32, 20, 30]);
            let mine = c.scatter("slice", values, 0).await?;
            let gathered = c.gather("collect", &(mine + 1), 0).await?;
            c.barrier("done").await?;
            // join plus four collectives
            assert_eq!(c.collectives_issued(), 5);
            Ok((greeting, mine, gathered))
        })
        .await;

        for (rank, result) in results.into_iter().enumerate() {
            let (greeting, mine, gathered) = result.unwrap();
            assert_eq!(greeting, "hello");
            assert_eq!(mine, [10, 20, 30][rank]);
            if rank == 0 {
                assert_eq!(gathered, Some(vec![11, 21, 31]));
            } else {
                assert_eq!(gathered, None);
            }
        }
    }

    #[tokio::test]
    async fn test_scatter_of_wrong_length_fails_everywhere() {
        let results = run_group(3, |c| async move {
            let values = c.is_leader().then(|| vec![1u32, 2]);
            c.scatter("slice", values, 0).await
        })
        .await;

        for result in results {
            assert!(matches!(result, Err(Error::Coordination { .. })));
        }
    }

    #[tokio::test]
    async fn test_bad_root_rejected_without_a_round() {
        let results = run_group(2, |c| async move {
            let result = c.gather("collect", &1u8, 2).await;
            Ok((result.is_err(), c.collectives_issued()))
        })
        .await;

        for result in results {
            // Only the join round
            assert_eq!(result.unwrap(), (true, 1));
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_value_fails_everywhere() {
        let results = run_group(2, |c| async move {
            c.broadcast::<u64>("empty", None, 0).await
        })
        .await;

        for result in results {
            assert!(matches!(result, Err(Error::Coordination { .. })));
        }
    }
}
